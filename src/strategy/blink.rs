// LED blink: breathing pulse driven by a saw-tooth counter
//
// A counter runs 0..total_time once per tick. The LED is lit while the counter
// is above a threshold, and the threshold walks down to 0 and back up to
// total_time one step per interval, so the duty cycle fades in and out.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::trace;

use super::ForceStrategy;
use crate::config::LED_STEP_INTERVAL;
use crate::messages::{DeviceState, ForceCommand, LedMode};
use crate::runtime::LoopContext;

/// Ticks per saw-tooth period
pub const DEFAULT_TOTAL_TIME: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlinkConfig {
    pub total_time: u32,
    /// Wall-clock time between threshold steps
    pub step_interval_ms: u64,
    /// LEDs to light during the "on" part of the cycle
    pub on_leds: LedMode,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            total_time: DEFAULT_TOTAL_TIME,
            step_interval_ms: LED_STEP_INTERVAL.as_millis() as u64,
            on_leds: LedMode::BLUE,
        }
    }
}

/// Counter plus a threshold that bounces between 0 and total
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SawTooth {
    total: i32,
    counter: i32,
    limit: i32,
    step: i32,
}

impl SawTooth {
    pub fn new(total: u32) -> Self {
        let total = total.clamp(1, i32::MAX as u32) as i32;
        Self {
            total,
            counter: 0,
            limit: total,
            step: -1,
        }
    }

    /// Advance the counter one tick; returns true when the LED should be lit
    pub fn tick(&mut self) -> bool {
        self.counter += 1;
        if self.counter >= self.total {
            self.counter = 0;
        }
        self.counter > self.limit
    }

    /// Move the threshold one step, bouncing off 0 and total
    pub fn shift_limit(&mut self) {
        self.limit += self.step;
        if self.limit <= 0 || self.limit >= self.total {
            self.limit = self.limit.clamp(0, self.total);
            self.step = -self.step;
        }
    }

    pub fn counter(&self) -> i32 {
        self.counter
    }

    pub fn limit(&self) -> i32 {
        self.limit
    }

    pub fn step(&self) -> i32 {
        self.step
    }
}

pub struct BlinkStrategy {
    saw: SawTooth,
    interval: Duration,
    on_leds: LedMode,
    last_shift: Option<Instant>,
}

impl BlinkStrategy {
    pub fn new(config: BlinkConfig) -> Self {
        Self {
            saw: SawTooth::new(config.total_time),
            interval: Duration::from_millis(config.step_interval_ms),
            on_leds: config.on_leds,
            last_shift: None,
        }
    }

    pub fn saw(&self) -> &SawTooth {
        &self.saw
    }
}

impl ForceStrategy for BlinkStrategy {
    fn name(&self) -> &'static str {
        "led"
    }

    fn compute(&mut self, _state: &DeviceState, ctx: &LoopContext) -> ForceCommand {
        let lit = self.saw.tick();

        if let Some(now) = ctx.now() {
            match self.last_shift {
                None => self.last_shift = Some(now),
                Some(last) if now.saturating_duration_since(last) > self.interval => {
                    self.saw.shift_limit();
                    self.last_shift = Some(now);
                    trace!("LED threshold now {}", self.saw.limit());
                }
                Some(_) => {}
            }
        }

        ForceCommand::with_leds(if lit { self.on_leds } else { LedMode::OFF })
    }
}
