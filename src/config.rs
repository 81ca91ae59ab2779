// Timeouts, limits, device defaults and the loadable runtime configuration
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::device::Calibration;
use crate::device::transport::DEFAULT_BAUDRATE;
use crate::strategy::{BlinkConfig, BoxConfig, WallConfig};

// LED threshold step period
pub const LED_STEP_INTERVAL: Duration = Duration::from_millis(100);

// Window for the tick-rate statistic
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

// Consecutive read/write failures before the loop gives up
pub const MAX_CONSECUTIVE_FAILURES: u32 = 100;

// Re-send the last command after this many empty polls in a row.
// The firmware only answers a command, so a lost frame would otherwise stall the exchange.
pub const IDLE_RESEND_POLLS: u32 = 1000;

// Serial port for the device's FTDI bridge
pub const DEVICE_PORT: &str = "/dev/ttyUSB0";

/// Error loading a configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Everything the runtime can be told from a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub port: String,
    pub baudrate: u32,
    /// Keep the firmware's homing mode on in every command
    pub homing: bool,
    pub max_consecutive_failures: u32,
    /// 0 disables re-sending
    pub idle_resend_polls: u32,
    pub calibration: Calibration,
    #[serde(rename = "box")]
    pub box_volume: BoxConfig,
    pub blink: BlinkConfig,
    pub wall: WallConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: DEVICE_PORT.to_string(),
            baudrate: DEFAULT_BAUDRATE,
            homing: false,
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
            idle_resend_polls: IDLE_RESEND_POLLS,
            calibration: Calibration::default(),
            box_volume: BoxConfig::default(),
            blink: BlinkConfig::default(),
            wall: WallConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load from a JSON file; missing fields keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}
