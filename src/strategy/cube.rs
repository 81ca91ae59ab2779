// Bounded-volume restoring force ("virtual box")
//
// The effector only feels the box while it is strictly inside all three axis
// ranges. Then a spring pushes it out through the nearest face.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::ForceStrategy;
use crate::device::Calibration;
use crate::messages::{AXIS_COUNT, DeviceState, ForceCommand};
use crate::runtime::LoopContext;

/// Box corners in meters
pub const DEFAULT_CORNER_A: [f64; AXIS_COUNT] = [-0.030, -0.030, 0.095];
pub const DEFAULT_CORNER_B: [f64; AXIS_COUNT] = [0.030, 0.030, 0.155];

/// Newtons per meter of penetration
pub const DEFAULT_STIFFNESS: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxConfig {
    /// Minimum corner
    pub corner_a: [f64; AXIS_COUNT],
    /// Maximum corner
    pub corner_b: [f64; AXIS_COUNT],
    pub stiffness: f64,
    /// Stay inert until Z first exceeds this (meters)
    pub arm_above_z: Option<f64>,
}

impl Default for BoxConfig {
    fn default() -> Self {
        Self {
            corner_a: DEFAULT_CORNER_A,
            corner_b: DEFAULT_CORNER_B,
            stiffness: DEFAULT_STIFFNESS,
            arm_above_z: None,
        }
    }
}

/// Where the effector sits relative to the box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Containment {
    /// Axis and signed distance of the nearest face among the axes the
    /// effector is inside of
    pub closest: Option<(usize, f64)>,
    pub all_inside: bool,
}

/// Per-axis open-interval test against the box
pub fn containment(
    pos: [f64; AXIS_COUNT],
    corner_a: [f64; AXIS_COUNT],
    corner_b: [f64; AXIS_COUNT],
) -> Containment {
    let mut closest: Option<(usize, f64)> = None;
    let mut inside = 0;

    for axis in 0..AXIS_COUNT {
        if pos[axis] <= corner_a[axis] || pos[axis] >= corner_b[axis] {
            continue;
        }
        inside += 1;

        for dist in [pos[axis] - corner_a[axis], pos[axis] - corner_b[axis]] {
            // strict: ties keep the earlier face
            if closest.is_none_or(|(_, best)| dist.abs() < best.abs()) {
                closest = Some((axis, dist));
            }
        }
    }

    Containment {
        closest,
        all_inside: inside == AXIS_COUNT,
    }
}

/// Restoring force in newtons for a position in meters
pub fn box_force(
    pos: [f64; AXIS_COUNT],
    corner_a: [f64; AXIS_COUNT],
    corner_b: [f64; AXIS_COUNT],
    stiffness: f64,
) -> [f64; AXIS_COUNT] {
    let mut force = [0.0; AXIS_COUNT];
    let hit = containment(pos, corner_a, corner_b);
    if let (true, Some((axis, dist))) = (hit.all_inside, hit.closest) {
        force[axis] = -stiffness * dist;
    }
    force
}

pub struct BoxStrategy {
    config: BoxConfig,
    calibration: Calibration,
    armed: bool,
}

impl BoxStrategy {
    pub fn new(config: BoxConfig, calibration: Calibration) -> Self {
        Self {
            config,
            calibration,
            armed: config.arm_above_z.is_none(),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl ForceStrategy for BoxStrategy {
    fn name(&self) -> &'static str {
        "box"
    }

    fn compute(&mut self, state: &DeviceState, _ctx: &LoopContext) -> ForceCommand {
        let pos = self.calibration.position(state);

        if !self.armed {
            match self.config.arm_above_z {
                Some(z) if pos[2] > z => {
                    info!("Effector cleared z={:.3}, box simulation armed", z);
                    self.armed = true;
                }
                _ => {}
            }
            return ForceCommand::zero();
        }

        let force = box_force(
            pos,
            self.config.corner_a,
            self.config.corner_b,
            self.config.stiffness,
        );
        if force.iter().any(|&f| f != 0.0) {
            debug!("Box contact at {:?}: force {:?} N", pos, force);
        }
        ForceCommand::with_forces(self.calibration.force_to_raw(force))
    }
}
