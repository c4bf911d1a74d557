//! Driver configuration.
//!
//! Every interval, settle delay and serial setting the driver uses lives in
//! [`DriverConfig`]. The defaults match the firmware's expectations (38400
//! baud, 100 ms sampling, 500 ms link checks, 10 s calibration). A config may
//! be loaded from a partial JSON file; missing keys keep their default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

/// Default serial baud rate of the firmware
pub const BAUD_RATE: u32 = 38400;

/// Upper bound on channels, one bit each in the sampling bitmask
pub const MAX_CHANNELS: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub baud_rate: u32,
    pub io_timeout_ms: u64,
    pub acquisition_interval_ms: u64,
    pub link_check_interval_ms: u64,
    pub calibration_interval_ms: u64,
    pub sample_settle_ms: u64,
    pub calibration_settle_ms: u64,
    pub command_settle_ms: u64,
    pub handshake_settle_ms: u64,
    pub poll_interval_ms: u64,
    /// Read (and keep) the banner the device prints right after the port opens.
    pub expect_banner: bool,
    pub channel_count: usize,
    pub default_selection: Vec<bool>,
    pub voltage_headroom: f64,
    pub default_voltage_ceiling: f64,
    pub max_events: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            io_timeout_ms: 1000,
            acquisition_interval_ms: 100,
            link_check_interval_ms: 500,
            calibration_interval_ms: 10_000,
            sample_settle_ms: 100,
            calibration_settle_ms: 100,
            command_settle_ms: 500,
            handshake_settle_ms: 2000,
            poll_interval_ms: 10,
            expect_banner: true,
            channel_count: 6,
            default_selection: vec![true; 6],
            voltage_headroom: 1.04,
            default_voltage_ceiling: 5.2,
            max_events: 256,
        }
    }
}

impl DriverConfig {
    /// Load a JSON config file. Keys absent from the file keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Parse and validate JSON config text. Without an explicit
    /// `default_selection`, every channel of `channel_count` is selected.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let explicit_selection = value.get("default_selection").is_some();
        let mut config: DriverConfig = serde_json::from_value(value)?;
        if !explicit_selection {
            config.default_selection = vec![true; config.channel_count];
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_count == 0 || self.channel_count > MAX_CHANNELS {
            return Err(DriverError::Config(format!(
                "channel_count must be within 1..={MAX_CHANNELS}, got {}",
                self.channel_count
            )));
        }
        if self.default_selection.len() != self.channel_count {
            return Err(DriverError::Config(format!(
                "default_selection has {} entries for {} channels",
                self.default_selection.len(),
                self.channel_count
            )));
        }
        if self.acquisition_interval_ms == 0
            || self.link_check_interval_ms == 0
            || self.calibration_interval_ms == 0
        {
            return Err(DriverError::Config("tick intervals must be non-zero".into()));
        }
        if self.baud_rate == 0 {
            return Err(DriverError::Config("baud_rate must be non-zero".into()));
        }
        if self.voltage_headroom.is_nan() || self.voltage_headroom <= 0.0 {
            return Err(DriverError::Config("voltage_headroom must be positive".into()));
        }
        Ok(())
    }

    /// Replace the channel selection with exactly the listed channel indices.
    pub fn select_only(&mut self, channels: &[usize]) -> Result<()> {
        let mut selection = vec![false; self.channel_count];
        for &ch in channels {
            let slot = selection.get_mut(ch).ok_or_else(|| {
                DriverError::Config(format!(
                    "channel {ch} out of range (0..{})",
                    self.channel_count
                ))
            })?;
            *slot = true;
        }
        self.default_selection = selection;
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn acquisition_interval(&self) -> Duration {
        Duration::from_millis(self.acquisition_interval_ms)
    }

    pub fn link_check_interval(&self) -> Duration {
        Duration::from_millis(self.link_check_interval_ms)
    }

    pub fn calibration_interval(&self) -> Duration {
        Duration::from_millis(self.calibration_interval_ms)
    }

    pub fn sample_settle(&self) -> Duration {
        Duration::from_millis(self.sample_settle_ms)
    }

    pub fn calibration_settle(&self) -> Duration {
        Duration::from_millis(self.calibration_settle_ms)
    }

    pub fn command_settle(&self) -> Duration {
        Duration::from_millis(self.command_settle_ms)
    }

    pub fn handshake_settle(&self) -> Duration {
        Duration::from_millis(self.handshake_settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DriverConfig::default();
        config.validate().unwrap();
        assert_eq!(config.baud_rate, 38400);
        assert_eq!(config.acquisition_interval(), Duration::from_millis(100));
        assert_eq!(config.handshake_settle(), Duration::from_secs(2));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: DriverConfig =
            serde_json::from_str(r#"{ "sample_settle_ms": 50, "expect_banner": false }"#).unwrap();
        assert_eq!(config.sample_settle_ms, 50);
        assert!(!config.expect_banner);
        assert_eq!(config.link_check_interval_ms, 500);
        assert_eq!(config.channel_count, 6);
    }

    #[test]
    fn rejects_mismatched_selection() {
        let config = DriverConfig {
            default_selection: vec![true; 3],
            ..DriverConfig::default()
        };
        assert!(matches!(config.validate(), Err(DriverError::Config(_))));
    }

    #[test]
    fn rejects_zero_interval() {
        let config = DriverConfig {
            link_check_interval_ms: 0,
            ..DriverConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn select_only_sets_listed_channels() {
        let mut config = DriverConfig::default();
        config.select_only(&[0, 2]).unwrap();
        assert_eq!(
            config.default_selection,
            vec![true, false, true, false, false, false]
        );
        assert!(config.select_only(&[6]).is_err());
    }

    #[test]
    fn selection_defaults_follow_channel_count_only_when_absent() {
        let config = DriverConfig::from_json_str(
            r#"{ "channel_count": 3, "comment": "default_selection is derived" }"#,
        )
        .unwrap();
        assert_eq!(config.default_selection, vec![true; 3]);

        let config = DriverConfig::from_json_str(
            r#"{ "channel_count": 3, "default_selection": [false, true, false] }"#,
        )
        .unwrap();
        assert_eq!(config.default_selection, vec![false, true, false]);

        assert!(matches!(
            DriverConfig::from_json_str(r#"{ "channel_count": 3, "default_selection": [true] }"#),
            Err(DriverError::Config(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!(
            "analog_serial_config_{}.json",
            std::process::id()
        ));
        std::fs::write(&path, r#"{ "channel_count": 4, "baud_rate": 9600 }"#).unwrap();
        let config = DriverConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.channel_count, 4);
        assert_eq!(config.default_selection, vec![true; 4]);
        assert_eq!(config.baud_rate, 9600);
    }
}
