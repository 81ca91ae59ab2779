// Force strategies for the control loop
//
// Provides:
// - Bounded-volume (box) restoring force
// - LED saw-tooth blink
// - Single-axis wall with button-flipped direction

pub mod blink;
pub mod cube;
pub mod wall;

use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::messages::{DeviceState, ForceCommand};
use crate::runtime::LoopContext;

pub use blink::{BlinkConfig, BlinkStrategy, SawTooth};
pub use cube::{BoxConfig, BoxStrategy, Containment, box_force, containment};
pub use wall::{WallConfig, WallStrategy};

/// Computes the command for one tick from the decoded device state
pub trait ForceStrategy: Send {
    fn name(&self) -> &'static str;

    /// Called once per accepted tick, after the loop context has advanced
    fn compute(&mut self, state: &DeviceState, ctx: &LoopContext) -> ForceCommand;
}

/// Strategy selector for the CLI and config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Feel a virtual box
    Box,
    /// Breathing LED, no forces
    Led,
    /// One-sided wall on a single axis
    Wall,
}

/// Build the strategy named by `kind` from the runtime configuration
pub fn build(kind: StrategyKind, config: &RuntimeConfig) -> Box<dyn ForceStrategy> {
    match kind {
        StrategyKind::Box => Box::new(BoxStrategy::new(config.box_volume, config.calibration)),
        StrategyKind::Led => Box::new(BlinkStrategy::new(config.blink)),
        StrategyKind::Wall => Box::new(WallStrategy::new(config.wall, config.calibration)),
    }
}
