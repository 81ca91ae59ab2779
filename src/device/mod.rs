// Device module for the Falcon haptic controller
//
// Provides:
// - Streaming-firmware packet codec (decode status, encode commands)
// - Packet transport traits and the serial implementation
// - Linear calibration between device and physical units

pub mod calibration;
pub mod protocol;
pub mod transport;

pub use calibration::Calibration;
pub use protocol::{DecodeError, RangeError, RawPacket, decode, encode};
pub use transport::{PacketSink, PacketSource, ReadOutcome, SerialTransport, TransportError};
