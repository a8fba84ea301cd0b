//! Printer handler strategies
//!
//! A handler is selected once per connection from the detection result. It
//! supplies the commands issued at connect and for status polling, the
//! firmware-specific parse rules, and capability metadata. A handler parse
//! miss always falls through to the generic parser.

use super::{FirmwareType, PrinterCapabilities, PrinterType};
use crate::protocol::parser;
use printerlink_core::{PositionSample, TemperatureData, TemperatureSample};
use regex::Regex;
use std::sync::OnceLock;

/// Handler family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// FDM printer on Marlin or compatible firmware
    FdmMarlin,
    /// Resin printer
    Sla,
    /// Klipper host
    Klipper,
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FdmMarlin => write!(f, "fdm_marlin"),
            Self::Sla => write!(f, "sla"),
            Self::Klipper => write!(f, "klipper"),
        }
    }
}

/// Printer handler selected after detection
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterHandler {
    kind: HandlerKind,
    printer_type: PrinterType,
    firmware_type: FirmwareType,
    capabilities: PrinterCapabilities,
}

/// Select the handler for a detection result
///
/// Resin printers always get the SLA handler whatever the firmware; Klipper
/// hosts get the Klipper handler; everything else, including undetected
/// devices, is treated as FDM/Marlin.
pub fn create_handler(printer_type: PrinterType, firmware_type: FirmwareType) -> PrinterHandler {
    let kind = if printer_type == PrinterType::Sla {
        HandlerKind::Sla
    } else if firmware_type == FirmwareType::Klipper {
        HandlerKind::Klipper
    } else {
        HandlerKind::FdmMarlin
    };
    tracing::info!(
        "Selected {} handler for {} printer on {} firmware",
        kind,
        printer_type,
        firmware_type
    );
    PrinterHandler::new(kind, printer_type, firmware_type)
}

impl PrinterHandler {
    /// Create a handler with the family defaults
    pub fn new(kind: HandlerKind, printer_type: PrinterType, firmware_type: FirmwareType) -> Self {
        let mut capabilities = PrinterCapabilities::default();
        match kind {
            HandlerKind::FdmMarlin => {
                capabilities.heated_bed = true;
            }
            HandlerKind::Sla => {
                capabilities.uv_led = true;
                capabilities.resin_tank = true;
                capabilities.layer_height_min = 0.01;
                capabilities.layer_height_max = 0.2;
            }
            HandlerKind::Klipper => {
                capabilities.heated_bed = true;
                capabilities.auto_leveling = true;
            }
        }
        Self {
            kind,
            printer_type,
            firmware_type,
            capabilities,
        }
    }

    /// Handler family
    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Printer type this handler was created for
    pub fn printer_type(&self) -> PrinterType {
        self.printer_type
    }

    /// Firmware this handler was created for
    pub fn firmware_type(&self) -> FirmwareType {
        self.firmware_type
    }

    /// Capability metadata
    pub fn capabilities(&self) -> &PrinterCapabilities {
        &self.capabilities
    }

    /// Fold detected capabilities into the family defaults
    ///
    /// Flags are OR-ed; the extruder count takes the larger value.
    pub fn merge_capabilities(&mut self, detected: &PrinterCapabilities) {
        let caps = &mut self.capabilities;
        caps.heated_bed |= detected.heated_bed;
        caps.heated_chamber |= detected.heated_chamber;
        caps.auto_leveling |= detected.auto_leveling;
        caps.filament_sensor |= detected.filament_sensor;
        caps.power_recovery |= detected.power_recovery;
        caps.multi_extruder |= detected.multi_extruder;
        caps.mixing_extruder |= detected.mixing_extruder;
        caps.uv_led |= detected.uv_led;
        caps.resin_tank |= detected.resin_tank;
        caps.fep_sensor |= detected.fep_sensor;
        caps.max_extruders = caps.max_extruders.max(detected.max_extruders);
    }

    /// Commands used to poll printer status
    pub fn status_commands(&self) -> &'static [&'static str] {
        match self.kind {
            HandlerKind::FdmMarlin => &["M105", "M114", "M119", "M27"],
            HandlerKind::Sla => &["M105", "M114", "M6054", "M6055", "M6056"],
            HandlerKind::Klipper => &["STATUS", "GET_POSITION", "TEMPERATURE_WAIT"],
        }
    }

    /// Commands queued once after detection
    pub fn init_commands(&self) -> &'static [&'static str] {
        match self.kind {
            HandlerKind::FdmMarlin => &["M115", "M503", "M105", "M114", "M119"],
            HandlerKind::Sla => &["M115", "M105", "M114", "M6054"],
            HandlerKind::Klipper => &["STATUS", "GET_POSITION", "HELP"],
        }
    }

    /// Handler-specific temperature rule
    pub fn parse_temperature(&self, line: &str) -> Option<TemperatureSample> {
        match self.kind {
            HandlerKind::FdmMarlin => parser::parse_temperature(line),
            HandlerKind::Sla => parse_resin_temperature(line),
            HandlerKind::Klipper => parse_klipper_temperature(line),
        }
    }

    /// Handler-specific position rule
    ///
    /// FDM/Marlin has none; the generic M114 parser covers it.
    pub fn parse_position(&self, line: &str) -> Option<PositionSample> {
        match self.kind {
            HandlerKind::FdmMarlin => None,
            HandlerKind::Sla => parse_resin_position(line),
            HandlerKind::Klipper => parse_klipper_position(line),
        }
    }
}

fn number_regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("invalid regex pattern"))
}

fn parse_resin_temperature(line: &str) -> Option<TemperatureSample> {
    static RESIN_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = number_regex(&RESIN_REGEX, r"T:(-?\d+\.?\d*)\s*/(-?\d+\.?\d*)");
    let caps = regex.captures(line)?;
    let actual = caps[1].parse().ok()?;
    let target = caps[2].parse().ok()?;
    let mut sample = TemperatureSample::new();
    sample
        .tools
        .insert("resin".to_string(), TemperatureData::new(actual, target));
    Some(sample)
}

fn parse_resin_position(line: &str) -> Option<PositionSample> {
    static Z_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = number_regex(&Z_REGEX, r"Z:(-?\d+\.?\d*)");
    let z = regex.captures(line)?[1].parse().ok()?;
    Some(PositionSample::new(0.0, 0.0, z, 0.0))
}

fn parse_klipper_temperature(line: &str) -> Option<TemperatureSample> {
    static EXTRUDER_REGEX: OnceLock<Regex> = OnceLock::new();
    static BED_REGEX: OnceLock<Regex> = OnceLock::new();
    let extruder = number_regex(
        &EXTRUDER_REGEX,
        r"extruder:\s*target=(-?\d+\.?\d*)\s*temp=(-?\d+\.?\d*)",
    );
    let bed = number_regex(
        &BED_REGEX,
        r"heater_bed:\s*target=(-?\d+\.?\d*)\s*temp=(-?\d+\.?\d*)",
    );

    // target comes first in Klipper's report
    let read = |re: &Regex| -> Option<TemperatureData> {
        let caps = re.captures(line)?;
        let target = caps[1].parse().ok()?;
        let actual = caps[2].parse().ok()?;
        Some(TemperatureData::new(actual, target))
    };

    let mut sample = TemperatureSample::new();
    if let Some(data) = read(extruder) {
        sample.tools.insert("tool0".to_string(), data);
    }
    sample.bed = read(bed);

    if sample.is_empty() {
        None
    } else {
        Some(sample)
    }
}

fn parse_klipper_position(line: &str) -> Option<PositionSample> {
    static STEPPER_REGEX: OnceLock<Regex> = OnceLock::new();
    if !(line.contains("mcu:") && line.contains("stepper_")) {
        return None;
    }
    let regex = number_regex(&STEPPER_REGEX, r"stepper_([xyze]):(-?\d+\.?\d*)");

    let mut position = PositionSample::default();
    let mut found = false;
    for caps in regex.captures_iter(line) {
        let Ok(value) = caps[2].parse::<f64>() else {
            continue;
        };
        found = true;
        match &caps[1] {
            "x" => position.x = value,
            "y" => position.y = value,
            "z" => position.z = value,
            _ => position.e = value,
        }
    }
    found.then_some(position)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_selection() {
        assert_eq!(
            create_handler(PrinterType::Sla, FirmwareType::Klipper).kind(),
            HandlerKind::Sla
        );
        assert_eq!(
            create_handler(PrinterType::Fdm, FirmwareType::Klipper).kind(),
            HandlerKind::Klipper
        );
        assert_eq!(
            create_handler(PrinterType::Delta, FirmwareType::Marlin).kind(),
            HandlerKind::FdmMarlin
        );
        assert_eq!(
            create_handler(PrinterType::Fdm, FirmwareType::Unknown).kind(),
            HandlerKind::FdmMarlin
        );
    }

    #[test]
    fn test_command_sets() {
        let fdm = create_handler(PrinterType::Fdm, FirmwareType::Marlin);
        assert_eq!(fdm.status_commands(), &["M105", "M114", "M119", "M27"]);
        assert_eq!(fdm.init_commands()[1], "M503");

        let sla = create_handler(PrinterType::Sla, FirmwareType::Chitubox);
        assert!(sla.status_commands().contains(&"M6055"));
        assert!(sla.capabilities().uv_led);

        let klipper = create_handler(PrinterType::Fdm, FirmwareType::Klipper);
        assert_eq!(klipper.init_commands(), &["STATUS", "GET_POSITION", "HELP"]);
    }

    #[test]
    fn test_sla_rules() {
        let sla = create_handler(PrinterType::Sla, FirmwareType::Marlin);
        let sample = sla.parse_temperature("T:28.5 /30.0").unwrap();
        assert_eq!(sample.tool("resin"), Some(TemperatureData::new(28.5, 30.0)));
        assert!(sample.tool("tool0").is_none());

        let pos = sla.parse_position("Z:12.5").unwrap();
        assert_eq!((pos.x, pos.z), (0.0, 12.5));
        assert!(sla.parse_position("ok").is_none());
    }

    #[test]
    fn test_klipper_rules() {
        let klipper = create_handler(PrinterType::Fdm, FirmwareType::Klipper);
        let sample = klipper
            .parse_temperature("extruder: target=200.0 temp=195.5 heater_bed: target=60.0 temp=58.2")
            .unwrap();
        assert_eq!(sample.tool("tool0"), Some(TemperatureData::new(195.5, 200.0)));
        assert_eq!(sample.bed, Some(TemperatureData::new(58.2, 60.0)));

        let pos = klipper
            .parse_position("mcu: stepper_x:10.5 stepper_y:20.0 stepper_z:1.2")
            .unwrap();
        assert_eq!((pos.x, pos.y, pos.z), (10.5, 20.0, 1.2));
        assert!(klipper.parse_position("stepper_x:10.5").is_none());
        assert!(klipper.parse_temperature("T:200 /200").is_none());
    }

    #[test]
    fn test_fdm_has_no_position_rule() {
        let fdm = create_handler(PrinterType::Fdm, FirmwareType::Marlin);
        assert!(fdm.parse_position("X:1 Y:2 Z:3 E:0").is_none());
        assert!(fdm.parse_temperature("T:200 /210 B:60 /60").is_some());
    }

    #[test]
    fn test_merge_capabilities() {
        let mut handler = create_handler(PrinterType::Fdm, FirmwareType::Marlin);
        let detected = PrinterCapabilities {
            filament_sensor: true,
            multi_extruder: true,
            max_extruders: 2,
            ..Default::default()
        };
        handler.merge_capabilities(&detected);
        let caps = handler.capabilities();
        assert!(caps.heated_bed && caps.filament_sensor && caps.multi_extruder);
        assert_eq!(caps.max_extruders, 2);
    }
}
