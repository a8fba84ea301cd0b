//! Printer and firmware identification
//!
//! Supported families:
//! - FDM printers on Marlin-compatible firmware
//! - Resin (SLA/MSLA) printers
//! - Klipper hosts
//!
//! Detection classifies the device from its banner text and selects a
//! `PrinterHandler` that supplies the status queries, initialization
//! commands, specialised parse rules and capability metadata.

pub mod capabilities;
pub mod detector;
pub mod handlers;

pub use capabilities::{detect_capabilities, PrinterCapabilities};
pub use detector::{detect_firmware, detect_printer_type, PrinterDetector};
pub use handlers::{create_handler, PrinterHandler};

use serde::{Deserialize, Serialize};

/// Mechanical family of the printer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterType {
    /// Filament (fused deposition)
    #[default]
    Fdm,
    /// Resin (SLA / MSLA)
    Sla,
    /// Pellet extrusion
    Pellet,
    /// Several independent tool heads
    MultiHead,
    /// Belt printer
    Belt,
    /// Delta kinematics
    Delta,
    /// Polar kinematics
    Polar,
    /// Unknown/generic
    Unknown,
}

impl std::fmt::Display for PrinterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fdm => write!(f, "fdm"),
            Self::Sla => write!(f, "sla"),
            Self::Pellet => write!(f, "pellet"),
            Self::MultiHead => write!(f, "multi_head"),
            Self::Belt => write!(f, "belt"),
            Self::Delta => write!(f, "delta"),
            Self::Polar => write!(f, "polar"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Firmware running on the controller board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareType {
    /// Marlin (default, most common)
    Marlin,
    /// Klipper
    Klipper,
    /// RepRapFirmware (Duet)
    RepRap,
    /// Smoothieware
    Smoothieware,
    /// GRBL
    Grbl,
    /// Repetier
    Repetier,
    /// ChiTu boards (resin printers)
    Chitubox,
    /// Elegoo resin firmware
    Elegoo,
    /// Anycubic resin firmware
    Anycubic,
    /// Unknown/generic
    #[default]
    Unknown,
}

impl std::fmt::Display for FirmwareType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Marlin => write!(f, "marlin"),
            Self::Klipper => write!(f, "klipper"),
            Self::RepRap => write!(f, "reprap"),
            Self::Smoothieware => write!(f, "smoothieware"),
            Self::Grbl => write!(f, "grbl"),
            Self::Repetier => write!(f, "repetier"),
            Self::Chitubox => write!(f, "chitubox"),
            Self::Elegoo => write!(f, "elegoo"),
            Self::Anycubic => write!(f, "anycubic"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome of printer detection; fixed for the lifetime of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Mechanical family
    pub printer_type: PrinterType,
    /// Firmware
    pub firmware_type: FirmwareType,
}

/// Identification summary returned by the query surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PrinterTypeInfo {
    /// Detected printer type, empty before detection
    pub printer_type: String,
    /// Detected firmware type, empty before detection
    pub firmware_type: String,
    /// Firmware name from the banner
    pub firmware_name: String,
    /// Firmware version from the banner
    pub firmware_version: String,
}
