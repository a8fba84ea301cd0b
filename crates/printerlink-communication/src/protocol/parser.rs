//! Generic Marlin-style response parsing
//!
//! Stateless line parsers shared by the dispatcher and the handlers:
//! temperature reports, position reports, M115 key/value banners,
//! capability lines and device error lines.

use printerlink_core::{FirmwareInfo, PositionSample, TemperatureData, TemperatureSample};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Parse a temperature report such as `ok T:200.0 /210.0 B:60.0 /60.0 T1:180 /185`.
///
/// `T` without an index maps to `tool0` unless an explicit `T0` is present;
/// `T{n}` maps to `tool{n}`, `B` to the bed and `C` to the chamber. Probe
/// readings (`P`) are ignored.
pub fn parse_temperature(line: &str) -> Option<TemperatureSample> {
    static TEMP_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = TEMP_REGEX.get_or_init(|| {
        Regex::new(r"([TBCP])(\d*):\s*(-?\d+\.?\d*)\s*/\s*(-?\d+\.?\d*)")
            .expect("invalid regex pattern")
    });

    let mut sample = TemperatureSample::new();
    let mut matched = false;

    for caps in regex.captures_iter(line) {
        let (Ok(actual), Ok(target)) = (caps[3].parse::<f64>(), caps[4].parse::<f64>()) else {
            continue;
        };
        matched = true;
        let data = TemperatureData::new(actual, target);
        match &caps[1] {
            "T" if caps[2].is_empty() => {
                sample.tools.entry("tool0".to_string()).or_insert(data);
            }
            "T" => {
                sample.tools.insert(format!("tool{}", &caps[2]), data);
            }
            "B" => sample.bed = Some(data),
            "C" => sample.chamber = Some(data),
            _ => {}
        }
    }

    if matched && !sample.is_empty() {
        Some(sample)
    } else {
        None
    }
}

/// Parse an M114 position report
///
/// Everything from `Count` onwards is dropped first so stepper counts cannot
/// overwrite coordinates. The report must start with `X:`; missing axes read
/// as zero.
pub fn parse_position(line: &str) -> Option<PositionSample> {
    static AXIS_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = AXIS_REGEX.get_or_init(|| {
        Regex::new(r"([XYZE]):\s*(-?\d+\.?\d*)").expect("invalid regex pattern")
    });

    let coords = match line.find("Count") {
        Some(idx) => &line[..idx],
        None => line,
    }
    .trim();

    if !coords.starts_with("X:") {
        return None;
    }

    let mut position = PositionSample::default();
    for caps in regex.captures_iter(coords) {
        let Ok(value) = caps[2].parse::<f64>() else {
            continue;
        };
        match &caps[1] {
            "X" => position.x = value,
            "Y" => position.y = value,
            "Z" => position.z = value,
            "E" => position.e = value,
            _ => {}
        }
    }
    Some(position)
}

/// Split one line into `KEY:VALUE` pairs
///
/// Keys are upper-case words followed by a colon at the start of the line or
/// after whitespace. A value runs up to the next key.
pub fn parse_kv_tokens(line: &str) -> BTreeMap<String, String> {
    static KEY_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = KEY_REGEX.get_or_init(|| {
        Regex::new(r"(?:^|\s)([A-Z][A-Z0-9_]+):").expect("invalid regex pattern")
    });

    let keys: Vec<(String, usize, usize)> = regex
        .captures_iter(line)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?;
            Some((key.as_str().to_string(), whole.start(), whole.end()))
        })
        .collect();

    let mut fields = BTreeMap::new();
    for (i, (key, _, value_start)) in keys.iter().enumerate() {
        let value_end = keys.get(i + 1).map(|next| next.1).unwrap_or(line.len());
        let value = line[*value_start..value_end].trim().to_string();
        fields.insert(key.clone(), value);
    }
    fields
}

/// Key/value pairs of the representative M115 line
///
/// The first line carrying at least two keys is preferred; otherwise the
/// first line is used as-is.
pub fn extract_m115_kv<S: AsRef<str>>(lines: &[S]) -> BTreeMap<String, String> {
    for line in lines {
        let fields = parse_kv_tokens(line.as_ref());
        if fields.len() >= 2 {
            return fields;
        }
    }
    lines
        .first()
        .map(|line| parse_kv_tokens(line.as_ref()))
        .unwrap_or_default()
}

/// Build firmware info from M115 key/value pairs
pub fn firmware_info_from_fields(fields: BTreeMap<String, String>) -> FirmwareInfo {
    let get = |key: &str| fields.get(key).filter(|v| !v.is_empty()).cloned();
    let mut name = get("FIRMWARE_NAME");
    let mut version = get("FIRMWARE_VERSION");

    // Marlin packs the version into the name: "Marlin 2.1.2 (Github)"
    if version.is_none() {
        if let Some(full) = name.clone() {
            let mut parts = full.splitn(2, ' ');
            let base = parts.next().unwrap_or_default().to_string();
            if let Some(rest) = parts.next() {
                let candidate = rest.split_whitespace().next().unwrap_or_default();
                if candidate.starts_with(|c: char| c.is_ascii_digit()) {
                    version = Some(candidate.to_string());
                    name = Some(base);
                }
            }
        }
    }

    FirmwareInfo {
        name,
        version,
        protocol_version: get("PROTOCOL_VERSION"),
        machine_type: get("MACHINE_TYPE"),
        extruder_count: get("EXTRUDER_COUNT").and_then(|v| v.parse().ok()),
        uuid: get("UUID"),
        fields,
        capabilities: BTreeMap::new(),
    }
}

/// Parse a `Cap:NAME:0|1` capability line
pub fn parse_capability_line(line: &str) -> Option<(String, bool)> {
    let rest = line.trim().strip_prefix("Cap:")?;
    let (name, flag) = rest.rsplit_once(':')?;
    let enabled = match flag.trim() {
        "1" => true,
        "0" => false,
        _ => return None,
    };
    Some((name.trim().to_string(), enabled))
}

/// Bare firmware names reported outside M115 (`// Klipper state: Ready`)
pub fn bare_firmware_name(line: &str) -> Option<&'static str> {
    if line.contains("RepRapFirmware") {
        Some("RepRapFirmware")
    } else if line.contains("Klipper") {
        Some("Klipper")
    } else {
        None
    }
}

/// Device-reported error or alarm line (`Error:`, `!!`, `ALARM`)
///
/// Line-number and checksum complaints are not errors: they announce the
/// `Resend:` request that follows.
pub fn is_error_line(line: &str) -> bool {
    if is_resend_notice(line) {
        return false;
    }
    line.starts_with("Error:") || line.starts_with("!!") || line.contains("ALARM")
}

/// `Error:` line preceding a resend request
pub fn is_resend_notice(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.starts_with("error") && (lower.contains("last line") || lower.contains("checksum"))
}

/// Bare acknowledgement
pub fn is_ok_line(line: &str) -> bool {
    line.starts_with("ok")
}
