//! Printer capability metadata
//!
//! Handlers start from defaults per printer family; `detect_capabilities`
//! refines them from configuration dumps (M503, M115 capability lines).

use super::FirmwareType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Hardware features and limits of a printer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterCapabilities {
    /// Heated bed present
    pub heated_bed: bool,
    /// Heated chamber present
    pub heated_chamber: bool,
    /// Bed probing / mesh leveling
    pub auto_leveling: bool,
    /// Filament runout sensor
    pub filament_sensor: bool,
    /// Power-loss recovery
    pub power_recovery: bool,
    /// More than one extruder
    pub multi_extruder: bool,
    /// Mixing hot end
    pub mixing_extruder: bool,
    /// UV light source (resin)
    pub uv_led: bool,
    /// Resin vat
    pub resin_tank: bool,
    /// FEP film sensor
    pub fep_sensor: bool,
    /// Number of extruders
    pub max_extruders: u32,
    /// Maximum hot end temperature in °C
    pub max_temp_hotend: f64,
    /// Maximum bed temperature in °C
    pub max_temp_bed: f64,
    /// Maximum chamber temperature in °C
    pub max_temp_chamber: f64,
    /// Build volume (X, Y, Z) in mm
    pub build_volume: (f64, f64, f64),
    /// Smallest supported layer height in mm
    pub layer_height_min: f64,
    /// Largest supported layer height in mm
    pub layer_height_max: f64,
    /// Maximum UV power in percent
    pub uv_power_max: u32,
}

impl Default for PrinterCapabilities {
    fn default() -> Self {
        Self {
            heated_bed: false,
            heated_chamber: false,
            auto_leveling: false,
            filament_sensor: false,
            power_recovery: false,
            multi_extruder: false,
            mixing_extruder: false,
            uv_led: false,
            resin_tank: false,
            fep_sensor: false,
            max_extruders: 1,
            max_temp_hotend: 300.0,
            max_temp_bed: 120.0,
            max_temp_chamber: 80.0,
            build_volume: (200.0, 200.0, 200.0),
            layer_height_min: 0.1,
            layer_height_max: 0.4,
            uv_power_max: 100,
        }
    }
}

/// Derive capability flags from configuration text
///
/// Flags are only ever switched on; limits keep their defaults unless the
/// text reveals more than one extruder.
pub fn detect_capabilities<S: AsRef<str>>(
    firmware: FirmwareType,
    config_lines: &[S],
) -> PrinterCapabilities {
    static EXTRUDER_REGEX: OnceLock<Regex> = OnceLock::new();
    let extruder_regex =
        EXTRUDER_REGEX.get_or_init(|| Regex::new(r"extruder\d+").expect("invalid regex pattern"));

    let text = config_lines
        .iter()
        .map(|l| l.as_ref())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let has_word = |word: &str| {
        text.split(|c: char| !c.is_ascii_alphanumeric())
            .any(|w| w == word)
    };

    let mut caps = PrinterCapabilities::default();

    if text.contains("heated_bed") || text.contains("temp_bed") {
        caps.heated_bed = true;
    }
    if text.contains("heated_chamber") || text.contains("temp_chamber") {
        caps.heated_chamber = true;
    }
    if text.contains("auto_bed_leveling") || text.contains("autolevel:1") || has_word("abl") {
        caps.auto_leveling = true;
    }
    if text.contains("filament_sensor") || text.contains("runout") {
        caps.filament_sensor = true;
    }
    if text.contains("power_loss") || text.contains("power_recovery") {
        caps.power_recovery = true;
    }

    let extruders = extruder_regex.find_iter(&text).count() as u32;
    if extruders > 1 {
        caps.multi_extruder = true;
        caps.max_extruders = extruders;
    }

    if text.contains("uv_led") || text.contains("resin") {
        caps.uv_led = true;
        caps.resin_tank = true;
    }
    if text.contains("fep") {
        caps.fep_sensor = true;
    }

    if firmware == FirmwareType::Klipper {
        caps.auto_leveling = true;
    }

    caps
}
