//! PrinterLink Settings Crate
//!
//! Typed engine configuration with defaults, validation and file persistence.

pub mod config;
pub mod error;

pub use config::{
    default_config_path, Config, ConnectionSettings, DetectionSettings, HeartbeatSettings,
    PrintSettings, TelemetrySettings, TransmissionSettings, UploadSettings,
};
pub use error::{ConfigError, SettingsError, SettingsResult};
