// Linear calibration between device units and physical units
// Encoder ticks -> meters on the way in, newtons -> raw motor effort on the way out.

use serde::{Deserialize, Serialize};

use crate::messages::{AXIS_COUNT, DeviceState};

/// Encoder resolution used when no calibration file is given
pub const DEFAULT_COUNTS_PER_METER: f64 = 200_000.0;

/// Workspace centre sits this far out along Z (meters)
pub const DEFAULT_Z_OFFSET: f64 = 0.125;

/// Raw effort units per newton
pub const DEFAULT_COUNTS_PER_NEWTON: f64 = 100.0;

/// Per-axis linear calibration for the device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    pub counts_per_meter: [f64; AXIS_COUNT],
    /// Added after scaling, in meters
    pub offset_m: [f64; AXIS_COUNT],
    pub counts_per_newton: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            counts_per_meter: [DEFAULT_COUNTS_PER_METER; AXIS_COUNT],
            offset_m: [0.0, 0.0, DEFAULT_Z_OFFSET],
            counts_per_newton: DEFAULT_COUNTS_PER_NEWTON,
        }
    }
}

impl Calibration {
    /// Effector position in meters
    pub fn position(&self, state: &DeviceState) -> [f64; AXIS_COUNT] {
        std::array::from_fn(|i| {
            state.axes[i] as f64 / self.counts_per_meter[i] + self.offset_m[i]
        })
    }

    /// Convert a force in newtons to raw effort
    ///
    /// The result is saturated to i32 but not to the wire range, so the codec
    /// still reports anything the device cannot take.
    pub fn force_to_raw(&self, newtons: [f64; AXIS_COUNT]) -> [i32; AXIS_COUNT] {
        newtons.map(|f| {
            let raw = (f * self.counts_per_newton).round();
            if raw.is_nan() { 0 } else { raw as i32 }
        })
    }
}
