//! Driver configuration loading from TOML
//!
//! # Configuration File Format
//!
//! ```toml
//! serial_port = "/dev/ttyUSB0"
//! feedback_interval_ms = 100
//! receive_interval_ms = 2
//! connect_timeout_ms = 5000
//! homing_timeout_ms = 10000
//! reset_speed_factor = 0.2
//! ```
//!
//! Every field is optional and falls back to the defaults above, so an empty
//! file (or no file at all) yields a usable configuration. The same values
//! are reachable programmatically through
//! [`FingerManager::with_config`](crate::manager::FingerManager::with_config).

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Tunables of the driver.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Serial device of the hand.
    ///
    /// **Format**: Device path (e.g., "/dev/ttyUSB0", "COM3")
    /// **Baud rate**: 921600 (fixed by the motor controller)
    #[serde(default = "default_serial_port")]
    pub serial_port: String,

    /// Period of the feedback poll worker.
    ///
    /// The hand only replies when spoken to; this poll is what produces
    /// continuous telemetry.
    ///
    /// **Units**: Milliseconds
    /// **Default**: 100
    #[serde(default = "default_feedback_interval_ms")]
    pub feedback_interval_ms: u64,

    /// Idle period of the receive worker between drain passes.
    ///
    /// **Units**: Milliseconds
    /// **Default**: 2
    #[serde(default = "default_receive_interval_ms")]
    pub receive_interval_ms: u64,

    /// How long `connect` waits for the hardware to echo every request.
    ///
    /// **Units**: Milliseconds
    /// **Default**: 5000
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long a joint may stand still during homing before the procedure
    /// aborts.
    ///
    /// **Units**: Milliseconds
    /// **Default**: 10000
    #[serde(default = "default_homing_timeout_ms")]
    pub homing_timeout_ms: u64,

    /// Velocity-limit factor applied while a joint is driven into its hard
    /// stop.
    ///
    /// **Valid range**: (0.0, 1.0]
    /// **Default**: 0.2
    #[serde(default = "default_reset_speed_factor")]
    pub reset_speed_factor: f32,
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_feedback_interval_ms() -> u64 {
    100
}

fn default_receive_interval_ms() -> u64 {
    2
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_homing_timeout_ms() -> u64 {
    10_000
}

fn default_reset_speed_factor() -> f32 {
    0.2
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            serial_port: default_serial_port(),
            feedback_interval_ms: default_feedback_interval_ms(),
            receive_interval_ms: default_receive_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            homing_timeout_ms: default_homing_timeout_ms(),
            reset_speed_factor: default_reset_speed_factor(),
        }
    }
}

impl DriverConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: DriverConfig = basic_toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.feedback_interval_ms == 0 || self.receive_interval_ms == 0 {
            return Err(Error::Config(
                "worker intervals must be greater than zero".to_string(),
            ));
        }
        if !(self.reset_speed_factor > 0.0 && self.reset_speed_factor <= 1.0) {
            return Err(Error::Config(format!(
                "reset_speed_factor must be in (0.0, 1.0], got {}",
                self.reset_speed_factor
            )));
        }
        Ok(())
    }

    pub fn feedback_interval(&self) -> Duration {
        Duration::from_millis(self.feedback_interval_ms)
    }

    pub fn receive_interval(&self) -> Duration {
        Duration::from_millis(self.receive_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn homing_timeout(&self) -> Duration {
        Duration::from_millis(self.homing_timeout_ms)
    }
}
