//! Typed configuration loading using Figment.
//!
//! Configuration is loaded from a TOML file merged with environment
//! variables prefixed `APT_SCAN_` (nested keys separated by `__`, e.g.
//! `APT_SCAN_X__CONTROLLER__PORT=/dev/ttyUSB0`). Values that parse can
//! still be semantically wrong, so loading always runs the validation pass
//! before the rest of the crate sees the result.
//!
//! # Example
//!
//! ```toml
//! [x.controller]
//! port = "/dev/ttyUSB0"
//! serial = "29252556"
//! voltage_limit = 75
//!
//! [x.gauge]
//! port = "/dev/ttyUSB1"
//! serial = "59500241"
//!
//! [y.controller]
//! port = "/dev/ttyUSB2"
//! serial = "29252557"
//!
//! [y.gauge]
//! port = "/dev/ttyUSB3"
//! serial = "59500242"
//!
//! [scan]
//! length_x_um = 10.0
//! step_x_um = 0.2
//! settle_time = "500ms"
//!
//! [scan.convergence]
//! gain = 0.002
//! tolerance_um = 0.5
//! ```

use crate::protocol::{AxisMode, FeedbackSource, VoltageLimit};
use crate::scan::ScanPlan;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Serial rates the T-cube USB bridge accepts.
const VALID_BAUD_RATES: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

/// Serial number prefix of KPZ101 units.
const KPZ_SERIAL_PREFIX: &str = "29";
/// Serial number prefix of KSG101 units.
const KSG_SERIAL_PREFIX: &str = "59";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] figment::Error),
    #[error("configuration validation error: {0}")]
    Validation(String),
}

/// Top-level configuration: two axes and the scan plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    pub x: AxisConfig,
    pub y: AxisConfig,
    #[serde(default)]
    pub scan: ScanPlan,
    /// Directory for timestamped result files.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

/// The device pair driving one axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    pub controller: DeviceConfig,
    pub gauge: DeviceConfig,
}

/// Connection and mode settings for one T-cube unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Display name; defaults to the device's role in the axis.
    #[serde(default)]
    pub name: String,
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3").
    pub port: String,
    /// Device serial number, used to sanity-check the wiring.
    pub serial: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub mode: AxisMode,
    /// Feedback input, required in closed-loop mode and ignored otherwise.
    #[serde(default)]
    pub feedback: Option<FeedbackSource>,
    #[serde(default)]
    pub voltage_limit: VoltageLimit,
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

impl ScanConfig {
    /// Load and validate configuration from `path` plus the environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path))
                .merge(Env::prefixed("APT_SCAN_").split("__")),
        )
    }

    /// Extract and validate from an arbitrary Figment, mainly for tests.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let mut config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        self.x.validate("x")?;
        self.y.validate("y")?;
        self.scan
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(())
    }
}

impl AxisConfig {
    fn validate(&mut self, axis: &str) -> Result<(), ConfigError> {
        self.controller
            .validate(&format!("{axis}.controller"), KPZ_SERIAL_PREFIX)?;
        self.gauge
            .validate(&format!("{axis}.gauge"), KSG_SERIAL_PREFIX)?;
        Ok(())
    }
}

impl DeviceConfig {
    fn validate(&mut self, role: &str, serial_prefix: &str) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            self.name = role.replace('.', "_");
        }
        if !self.serial.starts_with(serial_prefix) {
            return Err(ConfigError::Validation(format!(
                "{role}: serial number '{}' does not start with '{serial_prefix}'",
                self.serial
            )));
        }
        if !VALID_BAUD_RATES.contains(&self.baud_rate) {
            return Err(ConfigError::Validation(format!(
                "{role}: invalid baud rate {}, expected one of {VALID_BAUD_RATES:?}",
                self.baud_rate
            )));
        }
        match self.mode {
            AxisMode::ClosedLoop if self.feedback.is_none() => {
                return Err(ConfigError::Validation(format!(
                    "{role}: closed_loop mode requires a feedback input"
                )));
            }
            // The feedback input is meaningless without the servo loop.
            AxisMode::OpenLoop => self.feedback = None,
            AxisMode::ClosedLoop => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [x.controller]
        port = "/dev/ttyUSB0"
        serial = "29252556"

        [x.gauge]
        port = "/dev/ttyUSB1"
        serial = "59500241"

        [y.controller]
        port = "/dev/ttyUSB2"
        serial = "29252557"

        [y.gauge]
        port = "/dev/ttyUSB3"
        serial = "59500242"
    "#;

    fn load(toml: &str) -> Result<ScanConfig, ConfigError> {
        ScanConfig::from_figment(Figment::from(Toml::string(toml)))
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = load(MINIMAL).unwrap();
        assert_eq!(config.x.controller.baud_rate, 115200);
        assert_eq!(config.x.controller.mode, AxisMode::OpenLoop);
        assert_eq!(config.x.controller.voltage_limit, VoltageLimit::V75);
        assert_eq!(config.x.controller.name, "x_controller");
        assert_eq!(config.scan.nx(), 51);
        assert_eq!(config.scan.ny(), 51);
        assert!((config.scan.convergence.gain - 0.002).abs() < 1e-12);
        assert_eq!(config.output_dir, PathBuf::from("data"));
    }

    #[test]
    fn test_closed_loop_requires_feedback() {
        let toml = MINIMAL.replace(
            "serial = \"29252556\"",
            "serial = \"29252556\"\nmode = \"closed_loop\"",
        );
        let err = load(&toml).unwrap_err();
        assert!(err.to_string().contains("requires a feedback input"));
    }

    #[test]
    fn test_open_loop_drops_feedback() {
        let toml = MINIMAL.replace(
            "serial = \"29252556\"",
            "serial = \"29252556\"\nfeedback = \"chan1\"",
        );
        let config = load(&toml).unwrap();
        assert_eq!(config.x.controller.feedback, None);
    }

    #[test]
    fn test_closed_loop_with_feedback_accepted() {
        let toml = MINIMAL.replace(
            "serial = \"29252556\"",
            "serial = \"29252556\"\nmode = \"closed_loop\"\nfeedback = \"extin\"",
        );
        let config = load(&toml).unwrap();
        assert_eq!(config.x.controller.feedback, Some(FeedbackSource::ExtIn));
    }

    #[test]
    fn test_wrong_serial_prefix_rejected() {
        let toml = MINIMAL.replace("59500241", "29500241");
        let err = load(&toml).unwrap_err();
        assert!(err.to_string().contains("does not start with '59'"));
    }

    #[test]
    fn test_invalid_voltage_limit_rejected() {
        let toml = MINIMAL.replace(
            "serial = \"29252556\"",
            "serial = \"29252556\"\nvoltage_limit = 80",
        );
        assert!(matches!(load(&toml), Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_invalid_baud_rate_rejected() {
        let toml = MINIMAL.replace(
            "serial = \"29252556\"",
            "serial = \"29252556\"\nbaud_rate = 12345",
        );
        let err = load(&toml).unwrap_err();
        assert!(err.to_string().contains("invalid baud rate"));
    }

    #[test]
    fn test_scan_section_overrides() {
        let toml = format!(
            "{MINIMAL}\n[scan]\nlength_x_um = 2.0\nstep_x_um = 1.0\nsettle_time = \"50ms\"\n"
        );
        let config = load(&toml).unwrap();
        assert_eq!(config.scan.nx(), 3);
        assert_eq!(
            config.scan.settle_time,
            std::time::Duration::from_millis(50)
        );
    }
}
