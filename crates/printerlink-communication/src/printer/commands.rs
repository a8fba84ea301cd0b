//! G-code lines for the command surface

/// Tool index addressing the heated bed in [`set_temperature`]
pub const BED_TOOL: i32 = -1;

/// Park and cool-down sequence queued by a print cancel
pub const CANCEL_SEQUENCE: &[&str] = &[
    "G91",
    "G1 Z10 F600",
    "G90",
    "G1 X0 Y200 F6000",
    "M104 S0",
    "M140 S0",
    "M106 S0",
];

/// Stop SD printing and remount the card
pub const SD_CANCEL_SEQUENCE: &[&str] = &["M25", "M26 S0", "M22", "M21"];

/// Emergency stop
pub const EMERGENCY_STOP: &str = "M112";

/// `G28` for all axes, or `G28 {axes}`
pub fn home_axes(axes: &str) -> String {
    let axes = axes.trim();
    if axes.is_empty() {
        "G28".to_string()
    } else {
        format!("G28 {}", axes)
    }
}

/// Heater set point; [`BED_TOOL`] selects the bed
pub fn set_temperature(tool: i32, celsius: f64) -> String {
    if tool == BED_TOOL {
        format!("M140 S{}", celsius)
    } else {
        format!("M104 T{} S{}", tool, celsius)
    }
}

/// Linear move with only the given words
pub fn move_axis(
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    e: Option<f64>,
    feedrate: Option<f64>,
) -> String {
    let mut command = String::from("G1");
    for (letter, value) in [('X', x), ('Y', y), ('Z', z), ('E', e), ('F', feedrate)] {
        if let Some(value) = value {
            command.push_str(&format!(" {}{}", letter, value));
        }
    }
    command
}

/// Select a file on the SD card
pub fn sd_select(name: &str) -> String {
    format!("M23 {}", name.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_axes() {
        assert_eq!(home_axes(""), "G28");
        assert_eq!(home_axes(" X Y "), "G28 X Y");
    }

    #[test]
    fn test_set_temperature() {
        assert_eq!(set_temperature(0, 210.0), "M104 T0 S210");
        assert_eq!(set_temperature(1, 200.5), "M104 T1 S200.5");
        assert_eq!(set_temperature(BED_TOOL, 60.0), "M140 S60");
    }

    #[test]
    fn test_move_axis() {
        assert_eq!(move_axis(None, None, None, None, None), "G1");
        assert_eq!(
            move_axis(Some(10.0), None, Some(0.2), None, Some(1500.0)),
            "G1 X10 Z0.2 F1500"
        );
        assert_eq!(move_axis(None, Some(-5.5), None, Some(1.25), None), "G1 Y-5.5 E1.25");
    }

    #[test]
    fn test_sd_select() {
        assert_eq!(sd_select(" CUBE~1.GCO"), "M23 CUBE~1.GCO");
    }
}
