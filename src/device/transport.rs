// Packet transport: the byte-stream side of the device link
//
// The control loop only sees whole 16-byte frames through PacketSource and
// PacketSink. SerialTransport implements both over a serial port, slicing the
// incoming byte stream into frames on the start marker.

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, trace};

use super::protocol::{PACKET_LEN, RawPacket, START_MARKER};

/// Default serial configuration for the device's FTDI bridge
pub const DEFAULT_BAUDRATE: u32 = 1_456_312;
pub const DEFAULT_TIMEOUT_MS: u64 = 1;

/// Error types for packet transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Result of polling the source for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Packet(RawPacket),
    /// Nothing complete yet; poll again
    NotReady,
}

/// Something that yields raw frames from the device
pub trait PacketSource {
    /// Must not block for longer than the transport's own short timeout
    fn read_packet(&mut self) -> Result<ReadOutcome>;
}

/// Something that accepts raw frames for the device
pub trait PacketSink {
    fn write_packet(&mut self, packet: &RawPacket) -> Result<()>;
}

/// Reassembles frames from an arbitrary byte stream
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    discarded: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next candidate frame, skipping any bytes before a start marker
    ///
    /// Only the start marker is used to align; the end marker is left for the
    /// codec to validate so a corrupt frame still surfaces as a decode failure.
    pub fn next_frame(&mut self) -> Option<RawPacket> {
        match self.buffer.iter().position(|&b| b == START_MARKER) {
            Some(0) => {}
            Some(skip) => {
                self.discarded += skip;
                self.buffer.drain(..skip);
            }
            None => {
                self.discarded += self.buffer.len();
                self.buffer.clear();
                return None;
            }
        }

        if self.buffer.len() < PACKET_LEN {
            return None;
        }

        let mut frame = [0u8; PACKET_LEN];
        frame.copy_from_slice(&self.buffer[..PACKET_LEN]);
        self.buffer.drain(..PACKET_LEN);
        Some(RawPacket::new(frame))
    }

    /// Bytes thrown away while searching for a start marker
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Serial link to the device
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    assembler: FrameAssembler,
}

impl SerialTransport {
    /// Open a connection to the device
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        debug!("Opened {} at {} baud", port_name, baudrate);
        Ok(Self {
            port,
            assembler: FrameAssembler::new(),
        })
    }

    /// Pull whatever the port has buffered into the assembler
    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4 * PACKET_LEN];
        match self.port.read(&mut chunk) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => {
                trace!("Read {} bytes", n);
                self.assembler.push(&chunk[..n]);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(()),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

impl PacketSource for SerialTransport {
    fn read_packet(&mut self) -> Result<ReadOutcome> {
        if let Some(packet) = self.assembler.next_frame() {
            return Ok(ReadOutcome::Packet(packet));
        }
        self.fill()?;
        Ok(match self.assembler.next_frame() {
            Some(packet) => ReadOutcome::Packet(packet),
            None => ReadOutcome::NotReady,
        })
    }
}

impl PacketSink for SerialTransport {
    fn write_packet(&mut self, packet: &RawPacket) -> Result<()> {
        self.port.write_all(packet.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }
}
