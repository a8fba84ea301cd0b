//! Configuration for the printer link engine
//!
//! Provides configuration file handling, defaults and validation.
//! Supports JSON and TOML file formats stored in the platform config directory.
//!
//! Configuration is organized into logical sections:
//! - Connection settings (port, baud rate, reset and settle timing)
//! - Transmission settings (credit window, ack timeouts)
//! - Detection, heartbeat and telemetry freshness
//! - SD upload handshake limits
//! - Print supervision (first layer height, cool-down watchdog)

use crate::error::{ConfigError, SettingsError, SettingsResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Serial port path, or "Auto" to probe candidate ports
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout of the serial port in milliseconds
    pub read_timeout_ms: u64,
    /// Write timeout of the serial port in milliseconds
    pub write_timeout_ms: u64,
    /// How long DTR is held low to reset the board
    pub reset_pulse_ms: u64,
    /// Wait after reset before talking to the board
    pub settle_delay_ms: u64,
    /// Use the single-lock synchronous mode even when the port can be split
    pub force_sync_mode: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: "Auto".to_string(),
            baud_rate: 115200,
            read_timeout_ms: 500,
            write_timeout_ms: 1000,
            reset_pulse_ms: 200,
            settle_delay_ms: 2000,
            force_sync_mode: false,
        }
    }
}

/// Flow control settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmissionSettings {
    /// Maximum number of unacknowledged lines
    pub window_size: usize,
    /// Default wait for an acknowledgement in milliseconds
    pub ack_timeout_ms: u64,
    /// Bound on joining I/O threads during disconnect
    pub join_timeout_ms: u64,
}

impl Default for TransmissionSettings {
    fn default() -> Self {
        Self {
            window_size: 32,
            ack_timeout_ms: 8000,
            join_timeout_ms: 2000,
        }
    }
}

/// Printer detection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Delay between reaching Operational and running detection
    pub delay_ms: u64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self { delay_ms: 1000 }
    }
}

/// Heartbeat settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Consecutive wait timeouts before the link is declared lost
    pub max_consecutive_timeouts: u32,
    /// Timeout of the recovery probe in milliseconds
    pub probe_timeout_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            max_consecutive_timeouts: 3,
            probe_timeout_ms: 5000,
        }
    }
}

/// Telemetry freshness settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Cached samples younger than this are returned without a query
    pub cache_fresh_ms: u64,
    /// Temperature samples older than this are stale
    pub temp_stale_ms: u64,
    /// Position samples older than this are stale
    pub position_stale_ms: u64,
    /// Minimum spacing between two auto-report re-arm commands of one kind
    pub rearm_cooldown_ms: u64,
    /// Half-life of the ETA throughput average in seconds
    pub eta_half_life_s: f64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            cache_fresh_ms: 1000,
            temp_stale_ms: 4000,
            position_stale_ms: 6000,
            rearm_cooldown_ms: 5000,
            eta_half_life_s: 20.0,
        }
    }
}

/// SD upload handshake settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Wait for the reply to one body line
    pub line_timeout_ms: u64,
    /// Wait for the reply to M28
    pub open_timeout_ms: u64,
    /// Wait for the reply to M29
    pub close_timeout_ms: u64,
    /// Writes of one numbered line before giving up
    pub max_retries: u32,
    /// Longer lines are split on spaces
    pub max_line_len: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            line_timeout_ms: 2000,
            open_timeout_ms: 7000,
            close_timeout_ms: 5000,
            max_retries: 10,
            max_line_len: 200,
        }
    }
}

/// Print supervision settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintSettings {
    /// Layer height treated as the first layer, in mm
    pub first_layer_height: f64,
    /// Hotend temperature considered cool after a cancel
    pub cool_hotend_c: f64,
    /// Bed temperature considered cool after a cancel
    pub cool_bed_c: f64,
    /// How long the cool readings must hold
    pub cool_stable_s: u64,
    /// Interval between cool-down checks
    pub cool_check_interval_s: u64,
    /// Give up waiting for cool-down after this long
    pub cool_timeout_s: u64,
}

impl Default for PrintSettings {
    fn default() -> Self {
        Self {
            first_layer_height: 0.2,
            cool_hotend_c: 50.0,
            cool_bed_c: 40.0,
            cool_stable_s: 7,
            cool_check_interval_s: 5,
            cool_timeout_s: 1800,
        }
    }
}

/// Complete engine configuration
///
/// Aggregates all settings sections and provides file I/O operations.
/// Missing sections and keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Flow control
    pub transmission: TransmissionSettings,
    /// Detection timing
    pub detection: DetectionSettings,
    /// Heartbeat
    pub heartbeat: HeartbeatSettings,
    /// Telemetry freshness
    pub telemetry: TelemetrySettings,
    /// SD upload
    pub upload: UploadSettings,
    /// Print supervision
    pub print: PrintSettings,
}

/// Default location of the configuration file
pub fn default_config_path() -> SettingsResult<PathBuf> {
    let dir = dirs::config_dir().ok_or_else(|| {
        SettingsError::ConfigDirectory("no configuration directory on this platform".to_string())
    })?;
    Ok(dir.join("printerlink").join("config.toml"))
}

impl Config {
    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let content = std::fs::read_to_string(path)?;

        let config: Self = match extension(path) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            other => {
                return Err(
                    ConfigError::UnsupportedFormat(other.unwrap_or("").to_string()).into(),
                )
            }
        };

        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load the file at `path` if it exists, otherwise return defaults
    pub fn load_or_default(path: &Path) -> SettingsResult<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::info!(
                "No configuration at {}, using defaults",
                path.display()
            );
            Ok(Self::default())
        }
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = match extension(path) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string_pretty(self)?,
            other => {
                return Err(
                    ConfigError::UnsupportedFormat(other.unwrap_or("").to_string()).into(),
                )
            }
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn out_of_range(key: &str, value: impl ToString) -> ConfigError {
            ConfigError::ValueOutOfRange {
                key: key.to_string(),
                value: value.to_string(),
            }
        }

        if self.connection.baud_rate == 0 {
            return Err(out_of_range("connection.baud_rate", 0));
        }
        if self.connection.read_timeout_ms == 0 {
            return Err(out_of_range("connection.read_timeout_ms", 0));
        }
        if self.transmission.window_size == 0 {
            return Err(out_of_range("transmission.window_size", 0));
        }
        if self.transmission.ack_timeout_ms == 0 {
            return Err(out_of_range("transmission.ack_timeout_ms", 0));
        }
        if self.heartbeat.max_consecutive_timeouts == 0 {
            return Err(out_of_range("heartbeat.max_consecutive_timeouts", 0));
        }
        if self.telemetry.eta_half_life_s.is_nan() || self.telemetry.eta_half_life_s <= 0.0 {
            return Err(out_of_range(
                "telemetry.eta_half_life_s",
                self.telemetry.eta_half_life_s,
            ));
        }
        if self.upload.max_retries == 0 {
            return Err(out_of_range("upload.max_retries", 0));
        }
        if self.upload.max_line_len < 16 {
            return Err(out_of_range("upload.max_line_len", self.upload.max_line_len));
        }
        if self.print.first_layer_height.is_nan() || self.print.first_layer_height <= 0.0 {
            return Err(out_of_range(
                "print.first_layer_height",
                self.print.first_layer_height,
            ));
        }
        Ok(())
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.connection.port, "Auto");
        assert_eq!(config.connection.baud_rate, 115200);
        assert_eq!(config.transmission.window_size, 32);
        assert_eq!(config.detection.delay_ms, 1000);
        assert_eq!(config.telemetry.eta_half_life_s, 20.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_window() {
        let mut config = Config::default();
        config.transmission.window_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValueOutOfRange { .. })
        ));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [connection]
            port = "/dev/ttyACM0"

            [transmission]
            window_size = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.port, "/dev/ttyACM0");
        assert_eq!(config.connection.baud_rate, 115200);
        assert_eq!(config.transmission.window_size, 4);
        assert_eq!(config.transmission.ack_timeout_ms, 8000);
        assert_eq!(config.upload.max_line_len, 200);
    }

    #[test]
    fn test_default_config_path_name() {
        if let Ok(path) = default_config_path() {
            assert!(path.ends_with("printerlink/config.toml"));
        }
    }
}
