// Falcon streaming-firmware packet codec
//
// Every frame is 16 bytes:
// ['<', axis0 x4, axis1 x4, axis2 x4, info, reserved, '>']
// Payload bytes are offset by 0x41 so the stream stays printable.
// Axis fields are 16-bit two's complement, sent little-nibble-first.

use crate::messages::{AXIS_COUNT, BUTTON_COUNT, DeviceState, ForceCommand, LedMode};

/// Total frame length
pub const PACKET_LEN: usize = 16;

/// Framing bytes
pub const START_MARKER: u8 = 0x3C; // '<'
pub const END_MARKER: u8 = 0x3E; // '>'

/// Every payload byte is transmitted as PAYLOAD_BASE + value
pub const PAYLOAD_BASE: u8 = 0x41; // 'A'

/// Byte offsets within a frame
pub mod idx {
    pub const START: usize = 0;
    pub const AXIS_0: usize = 1; // axis i starts at AXIS_0 + 4 * i
    pub const INFO: usize = 13; // buttons/homing on input, LEDs/homing on output
    pub const RESERVED: usize = 14; // never interpreted
    pub const END: usize = 15;
}

/// Nibbles per axis field
pub const NIBBLES_PER_AXIS: usize = 4;

/// Largest value an axis payload byte may carry
const MAX_NIBBLE: u8 = 0x0F;

/// Largest value the info byte may carry
const MAX_INFO: u8 = 0x7F;

/// Info byte bits, input direction (device -> host)
pub const INFO_BUTTON_MASK: u8 = 0x0F;
pub const INFO_HOMED_SHIFT: u8 = 4;

/// Info byte bits, output direction (host -> device)
pub const INFO_HOMING_MODE: u8 = 0x01;
pub const INFO_LED_GREEN: u8 = 0x02;
pub const INFO_LED_BLUE: u8 = 0x04;
pub const INFO_LED_RED: u8 = 0x08;

/// Errors produced while decoding an input frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Bad framing: start=0x{start:02X}, end=0x{end:02X}")]
    Framing { start: u8, end: u8 },

    #[error("Malformed field at byte {index}: 0x{byte:02X}")]
    Field { index: usize, byte: u8 },

    #[error("Expected 16 bytes, got {len}")]
    Length { len: usize },
}

/// Force value that does not fit the 16-bit axis field
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Force {value} on axis {axis} is outside the encodable range")]
pub struct RangeError {
    pub axis: usize,
    pub value: i32,
}

/// One fixed-size frame as it travels on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPacket([u8; PACKET_LEN]);

impl RawPacket {
    pub fn new(bytes: [u8; PACKET_LEN]) -> Self {
        Self(bytes)
    }

    /// Frame with markers set and every payload byte at its zero value
    pub fn blank() -> Self {
        let mut bytes = [PAYLOAD_BASE; PACKET_LEN];
        bytes[idx::START] = START_MARKER;
        bytes[idx::END] = END_MARKER;
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_LEN] {
        &self.0
    }
}

impl TryFrom<&[u8]> for RawPacket {
    type Error = DecodeError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; PACKET_LEN] = bytes
            .try_into()
            .map_err(|_| DecodeError::Length { len: bytes.len() })?;
        Ok(Self(bytes))
    }
}

fn axis_offset(axis: usize) -> usize {
    idx::AXIS_0 + NIBBLES_PER_AXIS * axis
}

/// Remove the payload offset from one byte, checking it against an upper bound
fn unbias(raw: &RawPacket, index: usize, max: u8) -> Result<u8, DecodeError> {
    let byte = raw.0[index];
    match byte.checked_sub(PAYLOAD_BASE) {
        Some(value) if value <= max => Ok(value),
        _ => Err(DecodeError::Field { index, byte }),
    }
}

/// Decode a status frame from the device
pub fn decode(raw: &RawPacket) -> Result<DeviceState, DecodeError> {
    let bytes = raw.as_bytes();
    if bytes[idx::START] != START_MARKER || bytes[idx::END] != END_MARKER {
        return Err(DecodeError::Framing {
            start: bytes[idx::START],
            end: bytes[idx::END],
        });
    }

    let mut axes = [0i16; AXIS_COUNT];
    for (axis, slot) in axes.iter_mut().enumerate() {
        let start = axis_offset(axis);
        let mut value: u16 = 0;
        for position in 0..NIBBLES_PER_AXIS {
            let nibble = unbias(raw, start + position, MAX_NIBBLE)?;
            value |= (nibble as u16) << (4 * position);
        }
        // Readings at or above 2^15 are negative displacement
        *slot = value as i16;
    }

    let info = unbias(raw, idx::INFO, MAX_INFO)?;
    let button_bits = info & INFO_BUTTON_MASK;
    let buttons: [bool; BUTTON_COUNT] = std::array::from_fn(|i| button_bits & (1 << i) != 0);
    let homing_bits = info >> INFO_HOMED_SHIFT;
    let homed: [bool; AXIS_COUNT] = std::array::from_fn(|i| homing_bits & (1 << i) != 0);

    Ok(DeviceState {
        axes,
        buttons,
        homed,
        reserved: bytes[idx::RESERVED],
    })
}

/// Encode a command frame for the device
///
/// Forces outside i16 are rejected rather than wrapped. Callers that want to
/// send anyway should clamp with [`ForceCommand::clamped`] and encode again.
pub fn encode(cmd: &ForceCommand) -> Result<RawPacket, RangeError> {
    let mut packet = RawPacket::blank();

    for (axis, &force) in cmd.forces.iter().enumerate() {
        let value = i16::try_from(force).map_err(|_| RangeError { axis, value: force })? as u16;
        let start = axis_offset(axis);
        for position in 0..NIBBLES_PER_AXIS {
            let nibble = ((value >> (4 * position)) & 0x0F) as u8;
            packet.0[start + position] = PAYLOAD_BASE + nibble;
        }
    }

    packet.0[idx::INFO] = PAYLOAD_BASE + info_bits(cmd.leds, cmd.homing);
    packet.0[idx::RESERVED] = cmd.reserved;

    Ok(packet)
}

/// Pack LED and homing flags into the output info byte
fn info_bits(leds: LedMode, homing: bool) -> u8 {
    let mut info = 0;
    if homing {
        info |= INFO_HOMING_MODE;
    }
    if leds.green {
        info |= INFO_LED_GREEN;
    }
    if leds.blue {
        info |= INFO_LED_BLUE;
    }
    if leds.red {
        info |= INFO_LED_RED;
    }
    info
}
