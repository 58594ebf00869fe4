use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::error::{LabError, Result};
use crate::pid::PiSettings;

/// Top-level configuration of the lab host, read from a TOML file.
/// Every section falls back to its defaults, so an empty file is valid.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LabConfig {
    pub serial: SerialConfig,
    pub timing: TimingConfig,
    pub controller: PiSettings,
    pub regulation: RegulationConfig,
    pub export: ExportConfig,
}

pub fn load_config(path: &str) -> Result<LabConfig> {
    let content = fs::read_to_string(path)?;
    LabConfig::from_toml(&content)
}

impl LabConfig {
    /// Parse and validate. Values the host cannot run with are a
    /// [`LabError::Configuration`].
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: LabConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.timing.validate()?;
        self.controller.validate()?;
        self.regulation.validate()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name, e.g. `/dev/ttyUSB0` or `COM3`. `None` means "ask".
    pub port: Option<String>,
    pub baud: u32,
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: 115_200,
            read_timeout_ms: 100,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimingConfig {
    pub handshake_timeout_ms: u64,
    /// Pause after each configuration command; the firmware parses commands slowly.
    pub settle_ms: u64,
    pub watchdog_poll_ms: u64,
    pub heartbeat_ms: u64,
    pub no_data_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 3_000,
            settle_ms: 100,
            watchdog_poll_ms: 100,
            heartbeat_ms: 1_000,
            no_data_timeout_ms: 3_000,
        }
    }
}

impl TimingConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn watchdog_poll(&self) -> Duration {
        Duration::from_millis(self.watchdog_poll_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn no_data_timeout(&self) -> Duration {
        Duration::from_millis(self.no_data_timeout_ms)
    }

    /// `heartbeat_ms = 0` disables the heartbeat; the other periods must be positive.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("watchdog_poll_ms", self.watchdog_poll_ms),
            ("no_data_timeout_ms", self.no_data_timeout_ms),
        ];
        match periods.iter().find(|(_, ms)| *ms == 0) {
            Some((name, _)) => Err(LabError::Configuration(format!("timing.{name} must be positive"))),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RegulationConfig {
    pub target_c: f64,
    pub min_target_c: f64,
    pub max_target_c: f64,
}

impl Default for RegulationConfig {
    fn default() -> Self {
        Self {
            target_c: 25.0,
            min_target_c: 18.0,
            max_target_c: 40.0,
        }
    }
}

impl RegulationConfig {
    pub fn validate(&self) -> Result<()> {
        let (min, max) = (self.min_target_c, self.max_target_c);
        if !(min.is_finite() && max.is_finite() && min <= max) {
            return Err(LabError::Configuration(format!(
                "regulation target range [{min}, {max}] is not a finite, non-empty range"
            )));
        }
        if !self.target_c.is_finite() {
            return Err(LabError::Configuration("regulation.target_c must be finite".into()));
        }
        Ok(())
    }

    /// Never panics; an unvalidated inverted range yields `max_target_c`.
    pub fn clamp_target(&self, target: f64) -> f64 {
        target.max(self.min_target_c).min(self.max_target_c)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExportConfig {
    pub delimiter: char,
    /// Write `24,5` instead of `24.5` for spreadsheet locales that expect it.
    pub decimal_comma: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            delimiter: ';',
            decimal_comma: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = LabConfig::from_toml("").unwrap();
        assert_eq!(config.serial.baud, 115_200);
        assert_eq!(config.timing.handshake_timeout(), Duration::from_secs(3));
        assert_eq!(config.timing.settle(), Duration::from_millis(100));
        assert_eq!(config.export.delimiter, ';');
        assert!(!config.controller.reset_integral_on_reversal);
    }

    #[test]
    fn partial_sections_override_only_given_fields() {
        let config = LabConfig::from_toml(
            r#"
            [serial]
            port = "/dev/ttyUSB0"

            [timing]
            no_data_timeout_ms = 500

            [controller]
            deadband = 0.05
            reset_integral_on_reversal = true

            [controller.heat]
            kp = 12.0
            ki = 1.5
            kd = 0.0
            "#,
        )
        .unwrap();

        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.serial.baud, 115_200);
        assert_eq!(config.timing.no_data_timeout(), Duration::from_millis(500));
        assert_eq!(config.timing.heartbeat(), Duration::from_secs(1));
        assert_eq!(config.controller.deadband, 0.05);
        assert!(config.controller.reset_integral_on_reversal);
        assert_eq!(config.controller.heat.kp, 12.0);
        assert_eq!(config.controller.heat.ki, 1.5);
        assert_eq!(config.controller.cool.kp, 40.0);
    }

    #[test]
    fn regulation_target_is_clamped_to_range() {
        let regulation = RegulationConfig::default();
        assert_eq!(regulation.clamp_target(5.0), 18.0);
        assert_eq!(regulation.clamp_target(55.0), 40.0);
        assert_eq!(regulation.clamp_target(31.5), 31.5);
    }

    #[test]
    fn unusable_regulation_range_is_a_configuration_error() {
        for range in [
            "min_target_c = 40.0\nmax_target_c = 18.0",
            "min_target_c = nan",
            "max_target_c = inf",
            "target_c = nan",
        ] {
            let result = LabConfig::from_toml(&format!("[regulation]\n{range}"));
            assert!(
                matches!(result, Err(LabError::Configuration(_))),
                "{range:?} should be rejected"
            );
        }
    }

    #[test]
    fn inverted_range_clamps_without_panicking() {
        let regulation = RegulationConfig {
            min_target_c: 40.0,
            max_target_c: 18.0,
            ..RegulationConfig::default()
        };
        assert!(regulation.validate().is_err());
        assert_eq!(regulation.clamp_target(25.0), 18.0);
    }

    #[test]
    fn zero_watchdog_poll_is_rejected() {
        let result = LabConfig::from_toml("[timing]\nwatchdog_poll_ms = 0");
        assert!(matches!(result, Err(LabError::Configuration(_))));
        assert!(LabConfig::from_toml("[timing]\nheartbeat_ms = 0").is_ok());
    }

    #[test]
    fn malformed_toml_is_reported() {
        assert!(LabConfig::from_toml("[serial\nbaud = 1").is_err());
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../configs/lab.toml");
        let config = load_config(path).unwrap();
        assert_eq!(config.serial.port, None);
        assert_eq!(config.timing.no_data_timeout(), Duration::from_secs(3));
        assert_eq!(config.controller, PiSettings::default());
        assert_eq!(config.regulation.target_c, 25.0);
        assert_eq!(config.export.delimiter, ';');
    }
}
