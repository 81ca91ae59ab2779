// Define message types exchanged between the codec, the strategies and the loop

use serde::{Deserialize, Serialize};

/// Number of motorised axes on the device
pub const AXIS_COUNT: usize = 3;

/// Number of buttons reported by the four-button grip
pub const BUTTON_COUNT: usize = 4;

/// Grip button indices (as viewed from the front of the device)
pub const BUTTON_FAR_RIGHT: usize = 0;
pub const BUTTON_FORWARD: usize = 1;
pub const BUTTON_CENTER: usize = 2;
pub const BUTTON_FAR_LEFT: usize = 3;

/// Decoded device status from one input packet
// Created fresh by every decode, never mutated afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    /// Encoder ticks per axis (two's complement, wraps into negative displacement)
    pub axes: [i16; AXIS_COUNT],
    pub buttons: [bool; BUTTON_COUNT],
    /// Homing status per axis
    pub homed: [bool; AXIS_COUNT],
    /// Byte 14 of the frame, kept verbatim
    pub reserved: u8,
}

impl DeviceState {
    /// True if the given grip button is held
    pub fn button(&self, index: usize) -> bool {
        self.buttons.get(index).copied().unwrap_or(false)
    }

    pub fn all_homed(&self) -> bool {
        self.homed.iter().all(|&h| h)
    }
}

/// LED selector sent in the info byte of an output packet
///
/// Any combination of the three LEDs may be lit at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedMode {
    pub green: bool,
    pub blue: bool,
    pub red: bool,
}

impl LedMode {
    pub const OFF: LedMode = LedMode {
        green: false,
        blue: false,
        red: false,
    };
    pub const GREEN: LedMode = LedMode {
        green: true,
        blue: false,
        red: false,
    };
    pub const BLUE: LedMode = LedMode {
        green: false,
        blue: true,
        red: false,
    };
    pub const RED: LedMode = LedMode {
        green: false,
        blue: false,
        red: true,
    };

    pub fn is_off(&self) -> bool {
        *self == Self::OFF
    }
}

/// Output command computed by a force strategy for one tick
// Has default values because a strategy may have nothing to render
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceCommand {
    /// Raw motor effort per axis, must fit in i16 to be encodable
    pub forces: [i32; AXIS_COUNT],
    pub leds: LedMode,
    /// Ask the firmware to run its homing routine
    pub homing: bool,
    /// Byte 14 of the frame, written verbatim
    pub reserved: u8,
}

impl Default for ForceCommand {
    fn default() -> Self {
        Self {
            forces: [0; AXIS_COUNT],
            leds: LedMode::OFF,
            homing: false,
            reserved: crate::device::protocol::PAYLOAD_BASE,
        }
    }
}

impl ForceCommand {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn with_forces(forces: [i32; AXIS_COUNT]) -> Self {
        Self {
            forces,
            ..Self::default()
        }
    }

    pub fn with_leds(leds: LedMode) -> Self {
        Self {
            leds,
            ..Self::default()
        }
    }

    /// Saturate every force into the encodable i16 range
    pub fn clamped(&self) -> Self {
        Self {
            forces: self
                .forces
                .map(|f| f.clamp(i16::MIN as i32, i16::MAX as i32)),
            ..*self
        }
    }
}
