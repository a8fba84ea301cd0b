//! Telemetry samples reported by the printer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of periodically sampled telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    /// Heater temperatures (M105 / M155)
    Temperature,
    /// Axis position (M114 / M154)
    Position,
    /// SD print status (M27)
    SdStatus,
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temperature => write!(f, "temperature"),
            Self::Position => write!(f, "position"),
            Self::SdStatus => write!(f, "sd_status"),
        }
    }
}

/// One heater reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TemperatureData {
    /// Measured temperature in °C
    pub actual: f64,
    /// Set point in °C
    pub target: f64,
}

impl TemperatureData {
    /// Create a reading
    pub fn new(actual: f64, target: f64) -> Self {
        Self { actual, target }
    }
}

/// All heater readings from one report line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSample {
    /// Tool heaters keyed by name ("tool0", "tool1", "resin", ...)
    pub tools: BTreeMap<String, TemperatureData>,
    /// Heated bed
    pub bed: Option<TemperatureData>,
    /// Heated chamber
    pub chamber: Option<TemperatureData>,
    /// When the line was received
    pub timestamp: DateTime<Utc>,
}

impl TemperatureSample {
    /// Empty sample stamped now
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            bed: None,
            chamber: None,
            timestamp: Utc::now(),
        }
    }

    /// True when no heater was reported
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.bed.is_none() && self.chamber.is_none()
    }

    /// Reading of a tool heater by name
    pub fn tool(&self, name: &str) -> Option<TemperatureData> {
        self.tools.get(name).copied()
    }
}

impl Default for TemperatureSample {
    fn default() -> Self {
        Self::new()
    }
}

/// Axis position sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    /// X coordinate in mm
    pub x: f64,
    /// Y coordinate in mm
    pub y: f64,
    /// Z coordinate in mm
    pub z: f64,
    /// Extruder position in mm
    pub e: f64,
    /// When the line was received
    pub timestamp: DateTime<Utc>,
}

impl PositionSample {
    /// Create a sample stamped now
    pub fn new(x: f64, y: f64, z: f64, e: f64) -> Self {
        Self {
            x,
            y,
            z,
            e,
            timestamp: Utc::now(),
        }
    }
}

impl Default for PositionSample {
    fn default() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }
}

impl fmt::Display for PositionSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "X:{:.3} Y:{:.3} Z:{:.3} E:{:.3}",
            self.x, self.y, self.z, self.e
        )
    }
}

/// Progress of an SD card print
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SdProgress {
    /// A job is (or was last seen) printing from SD
    pub active: bool,
    /// Completion in percent
    pub completion: f64,
    /// Bytes consumed so far
    pub printed_bytes: u64,
    /// File size in bytes
    pub total_bytes: u64,
    /// Estimated seconds remaining
    pub eta_sec: Option<f64>,
    /// Time of the last progress report
    pub last_update: Option<DateTime<Utc>>,
}

impl SdProgress {
    /// True once printed bytes reached the file size
    pub fn is_complete(&self) -> bool {
        self.total_bytes > 0 && self.printed_bytes >= self.total_bytes
    }
}

/// Firmware identification from the M115 reply or boot banner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FirmwareInfo {
    /// FIRMWARE_NAME, or a bare name found in the banner
    pub name: Option<String>,
    /// FIRMWARE_VERSION
    pub version: Option<String>,
    /// PROTOCOL_VERSION
    pub protocol_version: Option<String>,
    /// MACHINE_TYPE
    pub machine_type: Option<String>,
    /// EXTRUDER_COUNT
    pub extruder_count: Option<u32>,
    /// UUID
    pub uuid: Option<String>,
    /// Every KEY:VALUE pair of the representative M115 line
    pub fields: BTreeMap<String, String>,
    /// `Cap:NAME:0|1` lines of the M115 reply
    pub capabilities: BTreeMap<String, bool>,
}

/// One entry of an SD card listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdFile {
    /// Name as the firmware addresses it (M23 argument)
    pub name: String,
    /// Long name when the firmware reports one, otherwise `name`
    pub display_name: String,
    /// File size in bytes
    pub size: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature_sample() {
        let mut sample = TemperatureSample::new();
        assert!(sample.is_empty());
        sample
            .tools
            .insert("tool0".to_string(), TemperatureData::new(200.5, 210.0));
        assert!(!sample.is_empty());
        assert_eq!(sample.tool("tool0").map(|t| t.target), Some(210.0));
        assert!(sample.tool("tool1").is_none());
    }

    #[test]
    fn test_sd_progress_complete() {
        let mut progress = SdProgress::default();
        assert!(!progress.is_complete());
        progress.printed_bytes = 1000;
        progress.total_bytes = 1000;
        assert!(progress.is_complete());
    }
}
