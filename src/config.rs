//! # Printer Configuration
//!
//! All hardware and timing settings live in a single TOML file.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [firmware]
//! port = "/dev/ttyACM0"
//! baud = 115200
//! position_feedback = true
//!
//! [projector]
//! power_command = "set-projector-power"
//!
//! [motion]
//! maximum_z = 50.0
//! high_speed_threshold_z = 10.0
//!
//! [timing]
//! pause_before_lift_ms = 2000
//! ```
//!
//! Every field is optional; missing fields fall back to the defaults below.

// src/config.rs - Single configuration file
use crate::hardware::link::MIN_RESET_HOLD;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the firmware link, projector, motion limits and print timing.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub firmware: FirmwareConfig,
    #[serde(default)]
    pub projector: ProjectorConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub web: WebConfig,
}

/// Which field of the firmware's position report carries the build platform height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlatformAxis {
    #[default]
    X,
    Y,
    Z,
}

/// Firmware link configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FirmwareConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_reset_hold_ms")]
    pub reset_hold_ms: u64,
    /// Confirm moves against the reported position instead of the acknowledgment alone.
    #[serde(default = "default_true")]
    pub position_feedback: bool,
    #[serde(default)]
    pub platform_axis: PlatformAxis,
    #[serde(default = "default_auto_report_interval_s")]
    pub auto_report_interval_s: u32,
    /// Talk to the in-process simulated firmware instead of a serial port.
    #[serde(default)]
    pub simulate: bool,
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
            reset_hold_ms: default_reset_hold_ms(),
            position_feedback: true,
            platform_axis: PlatformAxis::default(),
            auto_report_interval_s: default_auto_report_interval_s(),
            simulate: false,
            simulator: SimulatorConfig::default(),
        }
    }
}

impl FirmwareConfig {
    pub fn reset_hold(&self) -> Duration {
        Duration::from_millis(self.reset_hold_ms)
    }
}

/// Tuning for the simulated firmware.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_boot_delay_ms")]
    pub boot_delay_ms: u64,
    /// Largest write-completion chunk reported back to the link.
    #[serde(default = "default_max_write_chunk")]
    pub max_write_chunk: usize,
    /// Multiplier applied to the physical travel time of every move.
    #[serde(default = "default_move_time_scale")]
    pub move_time_scale: f64,
    #[serde(default = "default_firmware_author")]
    pub firmware_author: String,
    /// Answer the n-th linear move (1-based) with an error line instead of an acknowledgment.
    #[serde(default)]
    pub fail_on_move: Option<usize>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            boot_delay_ms: default_boot_delay_ms(),
            max_write_chunk: default_max_write_chunk(),
            move_time_scale: default_move_time_scale(),
            firmware_author: default_firmware_author(),
            fail_on_move: None,
        }
    }
}

/// Projector power helper configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectorConfig {
    #[serde(default = "default_power_command")]
    pub power_command: String,
    #[serde(default = "default_power_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_power_level")]
    pub max_power_level: u32,
    /// Log power changes instead of launching the helper.
    #[serde(default)]
    pub simulate: bool,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            power_command: default_power_command(),
            timeout_ms: default_power_timeout_ms(),
            max_power_level: default_max_power_level(),
            simulate: false,
        }
    }
}

/// Build platform limits and speeds. Distances in mm, speeds in mm/min.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotionConfig {
    #[serde(default = "default_maximum_z")]
    pub maximum_z: f64,
    #[serde(default = "default_maximum_z")]
    pub raise_to_maximum_z: f64,
    #[serde(default = "default_high_speed_threshold_z")]
    pub high_speed_threshold_z: f64,
    #[serde(default = "default_high_speed")]
    pub default_high_speed: f64,
    #[serde(default = "default_low_speed")]
    pub default_low_speed: f64,
    #[serde(default = "default_position_tolerance")]
    pub position_tolerance: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            maximum_z: default_maximum_z(),
            raise_to_maximum_z: default_maximum_z(),
            high_speed_threshold_z: default_high_speed_threshold_z(),
            default_high_speed: default_high_speed(),
            default_low_speed: default_low_speed(),
            position_tolerance: default_position_tolerance(),
        }
    }
}

impl MotionConfig {
    /// Height below which the platform travels at the slow speed, given its current position.
    pub fn threshold_for(&self, position: f64) -> f64 {
        self.raise_to_maximum_z.min(self.high_speed_threshold_z + position)
    }
}

/// Fixed delays of the print sequence.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    #[serde(default = "default_pause_after_dispense_ms")]
    pub pause_after_solution_dispensed_ms: u64,
    #[serde(default = "default_pause_before_project_ms")]
    pub pause_before_project_ms: u64,
    #[serde(default = "default_pause_before_lift_ms")]
    pub pause_before_lift_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pause_after_solution_dispensed_ms: default_pause_after_dispense_ms(),
            pause_before_project_ms: default_pause_before_project_ms(),
            pause_before_lift_ms: default_pause_before_lift_ms(),
        }
    }
}

impl TimingConfig {
    pub fn pause_after_solution_dispensed(&self) -> Duration {
        Duration::from_millis(self.pause_after_solution_dispensed_ms)
    }

    pub fn pause_before_project(&self) -> Duration {
        Duration::from_millis(self.pause_before_project_ms)
    }

    pub fn pause_before_lift(&self) -> Duration {
        Duration::from_millis(self.pause_before_lift_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DisplayConfig {
    /// Refuse to show layers whose image file does not exist.
    #[serde(default = "default_true")]
    pub require_images: bool,
    /// Prefix for relative manifest directories.
    #[serde(default)]
    pub image_root: Option<PathBuf>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            require_images: true,
            image_root: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl Config {
    /// Reject settings that would drive the platform past its limits or never move it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let motion = &self.motion;
        if motion.high_speed_threshold_z > motion.maximum_z {
            return Err(ConfigError::Invalid(format!(
                "high_speed_threshold_z ({}) exceeds maximum_z ({})",
                motion.high_speed_threshold_z, motion.maximum_z
            )));
        }
        if motion.raise_to_maximum_z > motion.maximum_z {
            return Err(ConfigError::Invalid(format!(
                "raise_to_maximum_z ({}) exceeds maximum_z ({})",
                motion.raise_to_maximum_z, motion.maximum_z
            )));
        }
        if motion.default_high_speed <= 0.0 || motion.default_low_speed <= 0.0 {
            return Err(ConfigError::Invalid("motion speeds must be > 0".to_string()));
        }
        if self.firmware.reset_hold() < MIN_RESET_HOLD {
            return Err(ConfigError::Invalid(format!(
                "firmware reset_hold_ms ({}) is below {} ms",
                self.firmware.reset_hold_ms,
                MIN_RESET_HOLD.as_millis()
            )));
        }
        if self.firmware.baud == 0 {
            return Err(ConfigError::Invalid("firmware baud must be > 0".to_string()));
        }
        if self.projector.power_command.trim().is_empty() {
            return Err(ConfigError::Invalid("projector power_command is empty".to_string()));
        }
        if self.projector.max_power_level == 0 {
            return Err(ConfigError::Invalid("projector max_power_level must be > 0".to_string()));
        }
        Ok(())
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_port() -> String { "/dev/ttyACM0".to_string() }
fn default_baud() -> u32 { 115200 }
fn default_reset_hold_ms() -> u64 { 200 }
fn default_auto_report_interval_s() -> u32 { 5 }
fn default_boot_delay_ms() -> u64 { 50 }
fn default_max_write_chunk() -> usize { 16 }
fn default_move_time_scale() -> f64 { 1.0 }
fn default_firmware_author() -> String { "vatprint-sim".to_string() }
fn default_power_command() -> String { "set-projector-power".to_string() }
fn default_power_timeout_ms() -> u64 { 5000 }
fn default_max_power_level() -> u32 { 100 }
fn default_maximum_z() -> f64 { 50.0 }
fn default_high_speed_threshold_z() -> f64 { 10.0 }
fn default_high_speed() -> f64 { 200.0 }
fn default_low_speed() -> f64 { 50.0 }
fn default_position_tolerance() -> f64 { 0.02 }
fn default_pause_after_dispense_ms() -> u64 { 4000 }
fn default_pause_before_project_ms() -> u64 { 4000 }
fn default_pause_before_lift_ms() -> u64 { 2000 }
fn default_bind() -> String { "0.0.0.0:3000".to_string() }

/// Load and validate configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.firmware.baud, 115200);
        assert_eq!(config.firmware.reset_hold_ms, 200);
        assert_eq!(config.firmware.platform_axis, PlatformAxis::X);
        assert_eq!(config.projector.power_command, "set-projector-power");
        assert_eq!(config.timing.pause_after_solution_dispensed_ms, 4000);
        assert_eq!(config.timing.pause_before_project_ms, 4000);
        assert_eq!(config.timing.pause_before_lift_ms, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_success() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("printer.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "[firmware]\nport = '/dev/ttyUSB1'\nplatform_axis = 'Z'\n\n[motion]\nmaximum_z = 80.0").unwrap();
        file.flush().unwrap();
        let config = load_config(file_path.to_str().unwrap()).unwrap();
        assert_eq!(config.firmware.port, "/dev/ttyUSB1");
        assert_eq!(config.firmware.platform_axis, PlatformAxis::Z);
        assert_eq!(config.motion.maximum_z, 80.0);
        // Defaults for missing fields
        assert_eq!(config.motion.raise_to_maximum_z, 50.0);
        assert_eq!(config.firmware.baud, 115200);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("nonexistent_file.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("bad.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "not a valid toml").unwrap();
        file.flush().unwrap();
        let result = load_config(file_path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_rejects_threshold_above_maximum() {
        let config: Config = toml::from_str("[motion]\nmaximum_z = 40.0\nraise_to_maximum_z = 40.0\nhigh_speed_threshold_z = 45.0").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_short_reset_hold() {
        let config: Config = toml::from_str("[firmware]\nreset_hold_ms = 0").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        let config: Config = toml::from_str("[firmware]\nreset_hold_ms = 199").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        let config: Config = toml::from_str("[firmware]\nreset_hold_ms = 200").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_is_capped_by_raise_height() {
        let motion = MotionConfig::default();
        assert_eq!(motion.threshold_for(2.0), 12.0);
        assert_eq!(motion.threshold_for(45.0), 50.0);
    }
}
