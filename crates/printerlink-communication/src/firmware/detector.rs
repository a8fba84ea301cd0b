//! Firmware and printer type detection from banner text

use super::{DetectionResult, FirmwareType, PrinterType};
use regex::Regex;
use std::sync::OnceLock;

/// Ordered firmware signature table; the first matching entry wins.
const FIRMWARE_PATTERNS: &[(FirmwareType, &[&str])] = &[
    (
        FirmwareType::Marlin,
        &[r"FIRMWARE_NAME:Marlin", r"Marlin \d+\.\d+\.\d+", r"echo:Marlin"],
    ),
    (
        FirmwareType::Klipper,
        &[r"Klipper", r"// Klipper", r"printer\.cfg"],
    ),
    (
        FirmwareType::RepRap,
        &[r"RepRapFirmware", r"FIRMWARE_NAME:RepRapFirmware", r"Duet"],
    ),
    (FirmwareType::Smoothieware, &[r"Smoothieware", r"Smoothie"]),
    (FirmwareType::Grbl, &[r"\bGrbl \d+\.\d+"]),
    (FirmwareType::Repetier, &[r"Repetier"]),
    (FirmwareType::Chitubox, &[r"ChiTuBox", r"CTB-"]),
    (FirmwareType::Elegoo, &[r"Elegoo", r"Mars", r"Saturn"]),
    (FirmwareType::Anycubic, &[r"Anycubic", r"Photon"]),
];

/// Printer type keywords, checked in order; no match means FDM.
const PRINTER_TYPE_KEYWORDS: &[(PrinterType, &[&str])] = &[
    (
        PrinterType::Sla,
        &[
            "resin", "uv", "photon", "mars", "saturn", "elegoo", "anycubic", "sla", "lcd",
            "msla", "fep",
        ],
    ),
    (PrinterType::Delta, &["delta", "kossel", "rostock", "flsun"]),
    (PrinterType::Belt, &["belt", "conveyor", "blackbelt"]),
    (PrinterType::Polar, &["polar", "theta"]),
];

fn firmware_regexes() -> &'static [(FirmwareType, Vec<Regex>)] {
    static REGEXES: OnceLock<Vec<(FirmwareType, Vec<Regex>)>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        FIRMWARE_PATTERNS
            .iter()
            .map(|(firmware, patterns)| {
                let compiled = patterns
                    .iter()
                    .map(|p| Regex::new(&format!("(?i){}", p)).expect("invalid regex pattern"))
                    .collect();
                (*firmware, compiled)
            })
            .collect()
    })
}

/// Identify the firmware from received lines
///
/// Lines are joined and lowercased; signatures match case-insensitively.
pub fn detect_firmware<S: AsRef<str>>(lines: &[S]) -> FirmwareType {
    let text = join_lower(lines);
    for (firmware, patterns) in firmware_regexes() {
        if patterns.iter().any(|re| re.is_match(&text)) {
            tracing::info!("Firmware detected: {}", firmware);
            return *firmware;
        }
    }
    FirmwareType::Unknown
}

/// Classify the printer from banner text
///
/// Keywords match whole words of the lowercased text, so `fep_sensor`
/// matches `fep` while `Juvenile` does not match `uv`.
pub fn detect_printer_type(text: &str) -> PrinterType {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    for (printer_type, keywords) in PRINTER_TYPE_KEYWORDS {
        if keywords.iter().any(|k| words.contains(k)) {
            tracing::info!("Printer type detected: {}", printer_type);
            return *printer_type;
        }
    }
    PrinterType::Fdm
}

fn join_lower<S: AsRef<str>>(lines: &[S]) -> String {
    lines
        .iter()
        .map(|l| l.as_ref())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// One-shot detector
///
/// The first call to [`PrinterDetector::detect_once`] fixes the result;
/// later calls return `None` and never change it.
#[derive(Debug, Default)]
pub struct PrinterDetector {
    result: Option<DetectionResult>,
}

impl PrinterDetector {
    /// Create a detector that has not run yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Run detection if it has not run yet
    pub fn detect_once<S: AsRef<str>>(&mut self, lines: &[S]) -> Option<DetectionResult> {
        if self.result.is_some() {
            tracing::debug!("Detection already ran, ignoring new banner text");
            return None;
        }
        let firmware_type = detect_firmware(lines);
        let printer_type = detect_printer_type(&join_lower(lines));
        let result = DetectionResult {
            printer_type,
            firmware_type,
        };
        self.result = Some(result);
        Some(result)
    }

    /// Result of the detection, if it ran
    pub fn result(&self) -> Option<DetectionResult> {
        self.result
    }
}
