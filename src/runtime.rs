// Haptic control loop: one packet in, one command out, per tick
// Note: a tick only counts once its packet decodes. Empty polls and corrupt
// frames leave every timer untouched so time-based effects do not drift.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn}; // tracing emits events, the subscriber installed in main prints them

// local imports
use crate::config::{RATE_WINDOW, RuntimeConfig};
use crate::device::{
    DecodeError, PacketSink, PacketSource, RawPacket, ReadOutcome, SerialTransport,
    TransportError, decode, encode,
};
use crate::messages::{DeviceState, ForceCommand};
use crate::strategy::{self, ForceStrategy, StrategyKind};

/// Top-level error for the runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Giving up after {count} consecutive transport failures")]
    TooManyFailures { count: u32 },

    #[error("Control loop task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Where the loop is within the current tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    AwaitingTick,
    Decoding,
    Computing,
    Encoding,
    Dispatched,
}

/// Cooperative stop flag shared with whoever owns the loop
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Time-based state that persists across ticks
///
/// Advanced exactly once per accepted tick, never on an empty poll or a
/// dropped packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopContext {
    started_at: Option<Instant>,
    now: Option<Instant>,
    previous: Option<Instant>,
    ticks: u64,
    window_start: Option<Instant>,
    window_ticks: u32,
    tick_rate: Option<u32>,
}

impl LoopContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted tick at `now`
    ///
    /// Returns the tick count of the rate window if this tick closed it.
    pub fn advance(&mut self, now: Instant) -> Option<u32> {
        self.started_at.get_or_insert(now);
        self.previous = self.now.replace(now);
        self.ticks += 1;

        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return None;
        };
        self.window_ticks += 1;
        if now.saturating_duration_since(start) >= RATE_WINDOW {
            let rate = self.window_ticks;
            self.tick_rate = Some(rate);
            self.window_start = Some(now);
            self.window_ticks = 0;
            return Some(rate);
        }
        None
    }

    /// Timestamp of the current tick
    pub fn now(&self) -> Option<Instant> {
        self.now
    }

    /// Time since the previous accepted tick
    pub fn dt(&self) -> Option<Duration> {
        Some(self.now?.saturating_duration_since(self.previous?))
    }

    /// Time since the first accepted tick
    pub fn elapsed(&self) -> Duration {
        match (self.started_at, self.now) {
            (Some(start), Some(now)) => now.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Accepted ticks in the last complete rate window
    pub fn tick_rate(&self) -> Option<u32> {
        self.tick_rate
    }
}

/// Counters for everything that did not produce a normal tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub dispatched: u64,
    pub idle_polls: u64,
    pub dropped_packets: u64,
    pub range_clamps: u64,
    pub transport_failures: u64,
    pub consecutive_failures: u32,
    pub resends: u64,
}

/// What one call to [`ControlLoop::step`] did
#[derive(Debug)]
pub enum TickOutcome {
    Stopped,
    NotReady,
    Dropped(DecodeError),
    ReadFailed(TransportError),
    Dispatched {
        state: DeviceState,
        command: ForceCommand,
    },
    DispatchFailed {
        state: DeviceState,
        command: ForceCommand,
        error: TransportError,
    },
}

pub struct ControlLoop<T> {
    transport: T,
    strategy: Box<dyn ForceStrategy>,
    context: LoopContext,
    stats: LoopStats,
    phase: LoopPhase,
    stop: StopHandle,
    homing: bool,
    max_consecutive_failures: u32,
    idle_resend_polls: u32,
    idle_streak: u32,
    last_sent: RawPacket,
}

impl<T: PacketSource + PacketSink> ControlLoop<T> {
    pub fn new(transport: T, strategy: Box<dyn ForceStrategy>, config: &RuntimeConfig) -> Self {
        Self {
            transport,
            strategy,
            context: LoopContext::new(),
            stats: LoopStats::default(),
            phase: LoopPhase::AwaitingTick,
            stop: StopHandle::new(),
            homing: config.homing,
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            idle_resend_polls: config.idle_resend_polls,
            idle_streak: 0,
            last_sent: RawPacket::blank(),
        }
    }

    /// Handle that stops the loop at its next poll
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn context(&self) -> &LoopContext {
        &self.context
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn record_failure(&mut self) {
        self.stats.transport_failures += 1;
        self.stats.consecutive_failures += 1;
    }

    fn send(&mut self, packet: RawPacket) -> Result<(), TransportError> {
        match self.transport.write_packet(&packet) {
            Ok(()) => {
                self.stats.consecutive_failures = 0;
                self.last_sent = packet;
                Ok(())
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Encode, clamping once if a force does not fit the wire
    fn encode_command(&mut self, command: ForceCommand) -> (RawPacket, ForceCommand) {
        match encode(&command) {
            Ok(packet) => (packet, command),
            Err(e) => {
                warn!("{}, clamping", e);
                self.stats.range_clamps += 1;
                let clamped = command.clamped();
                let packet = encode(&clamped).unwrap_or_else(|_| RawPacket::blank());
                (packet, clamped)
            }
        }
    }

    /// Neutral frame sent at start-up and shutdown
    fn idle_command(&self) -> ForceCommand {
        ForceCommand {
            homing: self.homing,
            ..ForceCommand::zero()
        }
    }

    /// Run one iteration of the loop
    pub fn step(&mut self, now: Instant) -> TickOutcome {
        self.phase = LoopPhase::AwaitingTick;
        if self.stop.is_stopped() {
            return TickOutcome::Stopped;
        }

        let raw = match self.transport.read_packet() {
            Ok(ReadOutcome::Packet(raw)) => {
                self.stats.consecutive_failures = 0;
                raw
            }
            Ok(ReadOutcome::NotReady) => {
                self.stats.consecutive_failures = 0;
                self.stats.idle_polls += 1;
                self.idle_streak += 1;
                if self.idle_resend_polls > 0 && self.idle_streak >= self.idle_resend_polls {
                    self.idle_streak = 0;
                    self.stats.resends += 1;
                    trace!("No status for {} polls, re-sending last command", self.idle_resend_polls);
                    if let Err(e) = self.send(self.last_sent) {
                        warn!("Re-send failed: {}", e);
                    }
                }
                return TickOutcome::NotReady;
            }
            Err(e) => {
                self.record_failure();
                warn!("Read failed: {}", e);
                return TickOutcome::ReadFailed(e);
            }
        };
        self.idle_streak = 0;

        self.phase = LoopPhase::Decoding;
        let state = match decode(&raw) {
            Ok(state) => state,
            Err(e) => {
                self.stats.dropped_packets += 1;
                warn!("Dropping packet: {}", e);
                self.phase = LoopPhase::AwaitingTick;
                return TickOutcome::Dropped(e);
            }
        };

        self.phase = LoopPhase::Computing;
        if let Some(rate) = self.context.advance(now) {
            debug!("Loop rate: {} ticks/s", rate);
        }
        let mut command = self.strategy.compute(&state, &self.context);
        command.homing |= self.homing;
        command.reserved = state.reserved;

        self.phase = LoopPhase::Encoding;
        let (packet, command) = self.encode_command(command);

        self.phase = LoopPhase::Dispatched;
        match self.send(packet) {
            Ok(()) => {
                self.stats.dispatched += 1;
                trace!("Tick {}: {:?} -> {:?}", self.context.ticks(), state.axes, command.forces);
                TickOutcome::Dispatched { state, command }
            }
            Err(error) => {
                warn!("Dispatch failed: {}", error);
                TickOutcome::DispatchFailed {
                    state,
                    command,
                    error,
                }
            }
        }
    }

    /// Leave the device unpowered
    fn zero_forces(&mut self) {
        let (zero, _) = self.encode_command(self.idle_command());
        if let Err(e) = self.send(zero) {
            warn!("Failed to zero forces on stop: {}", e);
        }
    }

    /// Drive the loop until stopped or the transport keeps failing
    pub fn run(&mut self) -> Result<LoopStats, RuntimeError> {
        info!(
            "Control loop started: strategy={}, failure limit={}",
            self.strategy.name(),
            self.max_consecutive_failures
        );

        // The firmware only reports status in answer to a command
        let (prime, _) = self.encode_command(self.idle_command());
        if let Err(e) = self.send(prime) {
            warn!("Initial command failed: {}", e);
        }

        loop {
            if let TickOutcome::Stopped = self.step(Instant::now()) {
                break;
            }
            if self.stats.consecutive_failures >= self.max_consecutive_failures {
                let count = self.stats.consecutive_failures;
                self.zero_forces();
                return Err(RuntimeError::TooManyFailures { count });
            }
        }

        self.zero_forces();
        info!(
            "Control loop stopped after {} ticks ({} dropped, {} transport failures)",
            self.context.ticks(),
            self.stats.dropped_packets,
            self.stats.transport_failures
        );
        Ok(self.stats.clone())
    }
}

/// Open the device and run the selected strategy until Ctrl+C
pub async fn run(config: RuntimeConfig, kind: StrategyKind) -> Result<LoopStats, RuntimeError> {
    info!("Opening device on {} at {} baud", config.port, config.baudrate);
    let transport = SerialTransport::open_with_baudrate(&config.port, config.baudrate)?;
    let strategy = strategy::build(kind, &config);

    let mut control = ControlLoop::new(transport, strategy, &config);
    let stop = control.stop_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stop requested");
            stop.stop();
        }
    });

    // The loop busy-polls, keep it off the async workers
    tokio::task::spawn_blocking(move || control.run()).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::protocol::PACKET_LEN;
    use crate::messages::LedMode;
    use std::collections::VecDeque;

    /// In-memory transport fed from a script of read results
    #[derive(Default)]
    struct ScriptedTransport {
        reads: VecDeque<Result<ReadOutcome, TransportError>>,
        written: Vec<RawPacket>,
        failing_writes: u32,
        stop_when_empty: Option<StopHandle>,
    }

    impl ScriptedTransport {
        fn with_reads(reads: Vec<Result<ReadOutcome, TransportError>>) -> Self {
            Self {
                reads: reads.into(),
                ..Self::default()
            }
        }
    }

    impl PacketSource for ScriptedTransport {
        fn read_packet(&mut self) -> Result<ReadOutcome, TransportError> {
            match self.reads.pop_front() {
                Some(read) => read,
                None => {
                    if let Some(stop) = &self.stop_when_empty {
                        stop.stop();
                    }
                    Ok(ReadOutcome::NotReady)
                }
            }
        }
    }

    impl PacketSink for ScriptedTransport {
        fn write_packet(&mut self, packet: &RawPacket) -> Result<(), TransportError> {
            if self.failing_writes > 0 {
                self.failing_writes -= 1;
                return Err(TransportError::Closed);
            }
            self.written.push(*packet);
            Ok(())
        }
    }

    /// Returns the same forces every tick and counts calls
    struct ConstantStrategy {
        forces: [i32; 3],
        calls: Arc<std::sync::atomic::AtomicU32>,
    }

    impl ForceStrategy for ConstantStrategy {
        fn name(&self) -> &'static str {
            "constant"
        }

        fn compute(&mut self, _state: &DeviceState, _ctx: &LoopContext) -> ForceCommand {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ForceCommand {
                leds: LedMode::GREEN,
                ..ForceCommand::with_forces(self.forces)
            }
        }
    }

    fn status(axes: [i16; 3], reserved: u8) -> ReadOutcome {
        let command = ForceCommand {
            reserved,
            ..ForceCommand::with_forces(axes.map(i32::from))
        };
        ReadOutcome::Packet(encode(&command).unwrap())
    }

    fn corrupt() -> ReadOutcome {
        let mut bytes = *RawPacket::blank().as_bytes();
        bytes[PACKET_LEN - 1] = 0x00;
        ReadOutcome::Packet(RawPacket::new(bytes))
    }

    fn control_loop(
        transport: ScriptedTransport,
        forces: [i32; 3],
    ) -> (
        ControlLoop<ScriptedTransport>,
        Arc<std::sync::atomic::AtomicU32>,
    ) {
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let strategy = ConstantStrategy {
            forces,
            calls: calls.clone(),
        };
        let config = RuntimeConfig {
            max_consecutive_failures: 3,
            idle_resend_polls: 0,
            ..RuntimeConfig::default()
        };
        (ControlLoop::new(transport, Box::new(strategy), &config), calls)
    }

    #[test]
    fn test_tick_decodes_computes_and_dispatches() {
        let transport = ScriptedTransport::with_reads(vec![Ok(status([100, -200, 300], 0x41))]);
        let (mut control, calls) = control_loop(transport, [10, 20, -30]);

        let outcome = control.step(Instant::now());
        match outcome {
            TickOutcome::Dispatched { state, command } => {
                assert_eq!(state.axes, [100, -200, 300]);
                assert_eq!(command.forces, [10, 20, -30]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(control.phase(), LoopPhase::Dispatched);
        assert_eq!(control.context().ticks(), 1);

        let sent = decode(&control.transport().written[0]).unwrap();
        assert_eq!(sent.axes, [10, 20, -30]);
        // green LED is bit 1 of the info byte
        assert_eq!(sent.buttons, [false, true, false, false]);
    }

    #[test]
    fn test_dropped_packet_leaves_context_untouched() {
        let transport = ScriptedTransport::with_reads(vec![
            Ok(status([0; 3], 0x41)),
            Ok(corrupt()),
            Ok(status([0; 3], 0x41)),
        ]);
        let (mut control, calls) = control_loop(transport, [0; 3]);
        let t0 = Instant::now();

        control.step(t0);
        let before = control.context().clone();

        let outcome = control.step(t0 + Duration::from_millis(5));
        assert!(matches!(
            outcome,
            TickOutcome::Dropped(DecodeError::Framing { .. })
        ));
        assert_eq!(control.context(), &before);
        assert_eq!(control.phase(), LoopPhase::AwaitingTick);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(control.transport().written.len(), 1);
        assert_eq!(control.stats().dropped_packets, 1);

        control.step(t0 + Duration::from_millis(10));
        assert_eq!(control.context().ticks(), 2);
        assert_eq!(control.context().dt(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_not_ready_is_a_no_op() {
        let transport = ScriptedTransport::with_reads(vec![Ok(ReadOutcome::NotReady)]);
        let (mut control, calls) = control_loop(transport, [0; 3]);

        assert!(matches!(control.step(Instant::now()), TickOutcome::NotReady));
        assert_eq!(control.context(), &LoopContext::new());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(control.transport().written.is_empty());
        assert_eq!(control.stats().idle_polls, 1);
    }

    #[test]
    fn test_out_of_range_force_is_clamped() {
        let transport = ScriptedTransport::with_reads(vec![Ok(status([0; 3], 0x41))]);
        let (mut control, _) = control_loop(transport, [50_000, -50_000, 7]);

        match control.step(Instant::now()) {
            TickOutcome::Dispatched { command, .. } => {
                assert_eq!(command.forces, [32767, -32768, 7]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(control.stats().range_clamps, 1);
        let sent = decode(&control.transport().written[0]).unwrap();
        assert_eq!(sent.axes, [32767, -32768, 7]);
    }

    #[test]
    fn test_reserved_byte_and_homing_pass_through() {
        let transport = ScriptedTransport::with_reads(vec![Ok(status([0; 3], 0x5A))]);
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let strategy = ConstantStrategy {
            forces: [0; 3],
            calls,
        };
        let config = RuntimeConfig {
            homing: true,
            ..RuntimeConfig::default()
        };
        let mut control = ControlLoop::new(transport, Box::new(strategy), &config);

        control.step(Instant::now());
        let sent = control.transport().written[0];
        assert_eq!(sent.as_bytes()[14], 0x5A);
        // green + homing
        assert_eq!(sent.as_bytes()[13], 0x41 + 0x03);
    }

    #[test]
    fn test_dispatch_failure_is_reported_and_loop_continues() {
        let mut transport = ScriptedTransport::with_reads(vec![
            Ok(status([0; 3], 0x41)),
            Ok(status([0; 3], 0x41)),
        ]);
        transport.failing_writes = 1;
        let (mut control, _) = control_loop(transport, [1, 2, 3]);

        assert!(matches!(
            control.step(Instant::now()),
            TickOutcome::DispatchFailed {
                error: TransportError::Closed,
                ..
            }
        ));
        assert_eq!(control.stats().consecutive_failures, 1);

        assert!(matches!(
            control.step(Instant::now()),
            TickOutcome::Dispatched { .. }
        ));
        assert_eq!(control.stats().consecutive_failures, 0);
        assert_eq!(control.stats().transport_failures, 1);
    }

    #[test]
    fn test_idle_polls_resend_last_command() {
        let transport = ScriptedTransport::with_reads(vec![
            Ok(ReadOutcome::NotReady),
            Ok(ReadOutcome::NotReady),
            Ok(ReadOutcome::NotReady),
        ]);
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let strategy = ConstantStrategy {
            forces: [0; 3],
            calls,
        };
        let config = RuntimeConfig {
            idle_resend_polls: 2,
            ..RuntimeConfig::default()
        };
        let mut control = ControlLoop::new(transport, Box::new(strategy), &config);

        for _ in 0..3 {
            control.step(Instant::now());
        }
        assert_eq!(control.stats().resends, 1);
        assert_eq!(control.transport().written, vec![RawPacket::blank()]);
        assert_eq!(control.context(), &LoopContext::new());
    }

    #[test]
    fn test_run_stops_on_signal_and_zeroes_forces() {
        let mut transport = ScriptedTransport::with_reads(vec![
            Ok(status([0; 3], 0x41)),
            Ok(ReadOutcome::NotReady),
            Ok(corrupt()),
            Ok(status([0; 3], 0x41)),
        ]);
        let stop = StopHandle::new();
        transport.stop_when_empty = Some(stop.clone());
        let (mut control, calls) = control_loop(transport, [5, 5, 5]);
        control.stop = stop;

        let stats = control.run().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.dropped_packets, 1);

        // prime + two ticks + final zero
        let written = &control.transport().written;
        assert_eq!(written.len(), 4);
        assert_eq!(written[0], RawPacket::blank());
        assert_eq!(written[3], RawPacket::blank());
    }

    #[test]
    fn test_run_gives_up_after_consecutive_read_failures() {
        let transport = ScriptedTransport::with_reads(vec![
            Err(TransportError::Closed),
            Err(TransportError::Closed),
            Err(TransportError::Closed),
        ]);
        let (mut control, _) = control_loop(transport, [0; 3]);

        let err = control.run().unwrap_err();
        assert!(matches!(err, RuntimeError::TooManyFailures { count: 3 }));
    }

    #[test]
    fn test_good_reads_break_a_failure_streak() {
        let mut transport = ScriptedTransport::with_reads(vec![
            Err(TransportError::Closed),
            Ok(corrupt()),
            Err(TransportError::Closed),
            Ok(ReadOutcome::NotReady),
            Err(TransportError::Closed),
            Ok(corrupt()),
        ]);
        let stop = StopHandle::new();
        transport.stop_when_empty = Some(stop.clone());
        let (mut control, _) = control_loop(transport, [0; 3]);
        control.stop = stop;

        let stats = control.run().unwrap();
        assert_eq!(stats.transport_failures, 3);
        assert_eq!(stats.dropped_packets, 2);
    }

    #[test]
    fn test_give_up_still_zeroes_forces() {
        let transport = ScriptedTransport::with_reads(vec![
            Ok(status([0; 3], 0x41)),
            Err(TransportError::Closed),
            Err(TransportError::Closed),
            Err(TransportError::Closed),
        ]);
        let (mut control, _) = control_loop(transport, [500, 0, 0]);

        let err = control.run().unwrap_err();
        assert!(matches!(err, RuntimeError::TooManyFailures { count: 3 }));

        let written = &control.transport().written;
        // prime, one tick, final zero
        assert_eq!(written.len(), 3);
        assert_eq!(decode(&written[1]).unwrap().axes, [500, 0, 0]);
        assert_eq!(written[2], RawPacket::blank());
    }

    #[test]
    fn test_stop_is_checked_before_reading() {
        let transport = ScriptedTransport::with_reads(vec![Ok(status([0; 3], 0x41))]);
        let (mut control, calls) = control_loop(transport, [0; 3]);
        control.stop_handle().stop();

        assert!(matches!(control.step(Instant::now()), TickOutcome::Stopped));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(control.transport().reads.len(), 1);
    }

    #[test]
    fn test_context_reports_tick_rate_per_window() {
        let mut ctx = LoopContext::new();
        let t0 = Instant::now();
        let mut closed = None;
        for ms in 0..=1000u64 {
            if let Some(rate) = ctx.advance(t0 + Duration::from_millis(ms)) {
                closed = Some((ms, rate));
            }
        }
        assert_eq!(closed, Some((1000, 1000)));
        assert_eq!(ctx.tick_rate(), Some(1000));
        assert_eq!(ctx.ticks(), 1001);
        assert_eq!(ctx.elapsed(), Duration::from_secs(1));
    }
}
