// Single-axis wall
//
// A one-sided spring at `bound` along one axis. Releasing the center grip
// button flips which side is solid; the effector then has to be moved back to
// the free side before the wall comes alive again.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::ForceStrategy;
use crate::device::Calibration;
use crate::messages::{AXIS_COUNT, BUTTON_CENTER, DeviceState, ForceCommand};
use crate::runtime::LoopContext;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WallConfig {
    pub axis: usize,
    /// Wall position along `axis` in meters
    pub bound: f64,
    pub stiffness: f64,
}

impl Default for WallConfig {
    fn default() -> Self {
        Self {
            axis: 2,
            bound: 0.130,
            stiffness: 1000.0,
        }
    }
}

/// Restoring force along the wall axis (newtons)
///
/// With `positive` the wall pushes towards larger coordinates and the solid
/// side is below `bound`.
pub fn wall_force(pos: f64, bound: f64, stiffness: f64, positive: bool) -> f64 {
    let penetrating = if positive { pos < bound } else { pos > bound };
    if penetrating {
        -stiffness * (pos - bound)
    } else {
        0.0
    }
}

pub struct WallStrategy {
    config: WallConfig,
    calibration: Calibration,
    positive: bool,
    initializing: bool,
    button_down: bool,
}

impl WallStrategy {
    pub fn new(config: WallConfig, calibration: Calibration) -> Self {
        let axis = config.axis.min(AXIS_COUNT - 1);
        Self {
            config: WallConfig { axis, ..config },
            calibration,
            positive: true,
            initializing: true,
            button_down: false,
        }
    }

    pub fn is_positive(&self) -> bool {
        self.positive
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing
    }
}

impl ForceStrategy for WallStrategy {
    fn name(&self) -> &'static str {
        "wall"
    }

    fn compute(&mut self, state: &DeviceState, _ctx: &LoopContext) -> ForceCommand {
        let axis = self.config.axis;
        let pos = self.calibration.position(state)[axis];

        if self.initializing {
            let clear = if self.positive {
                pos > self.config.bound
            } else {
                pos < self.config.bound
            };
            if clear {
                info!(
                    "Wall active on axis {} at {:.3} m ({} side solid)",
                    axis,
                    self.config.bound,
                    if self.positive { "lower" } else { "upper" }
                );
                self.initializing = false;
            }
            return ForceCommand::zero();
        }

        // Act on release so one press flips exactly once
        if state.button(BUTTON_CENTER) {
            self.button_down = true;
        } else if self.button_down {
            self.button_down = false;
            self.positive = !self.positive;
            self.initializing = true;
            info!("Flipping wall direction, move the effector to the free side");
            return ForceCommand::zero();
        }

        let mut force = [0.0; AXIS_COUNT];
        force[axis] = wall_force(pos, self.config.bound, self.config.stiffness, self.positive);
        ForceCommand::with_forces(self.calibration.force_to_raw(force))
    }
}
