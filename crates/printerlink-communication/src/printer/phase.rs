//! Print phase inference from transmitted G-code

use chrono::Utc;
use printerlink_core::{PhaseSnapshot, PrintPhase};
use regex::Regex;
use std::sync::OnceLock;

/// Extra height above the first layer still counted as first layer
const FIRST_LAYER_TOLERANCE: f64 = 0.05;

fn home_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*G28\b").expect("invalid regex pattern"))
}

fn level_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*G29\b").expect("invalid regex pattern"))
}

fn heat_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:M104|M109|M140|M190)\b").expect("invalid regex pattern")
    })
}

fn prime_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)prime|purge").expect("invalid regex pattern"))
}

fn extrude_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*G1\b.*\bE(-?\d+\.?\d*)").expect("invalid regex pattern")
    })
}

fn z_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bZ(-?\d+\.?\d*)").expect("invalid regex pattern"))
}

/// Tracks the coarse phase of the running job
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    first_layer_height: f64,
    snapshot: PhaseSnapshot,
}

impl PhaseTracker {
    /// Tracker in the `Unknown` phase
    pub fn new(first_layer_height: f64) -> Self {
        Self {
            first_layer_height,
            snapshot: PhaseSnapshot {
                phase: PrintPhase::Unknown,
                since: Utc::now(),
            },
        }
    }

    /// Current phase and when it was entered
    pub fn snapshot(&self) -> PhaseSnapshot {
        self.snapshot
    }

    /// Force a phase
    pub fn set(&mut self, phase: PrintPhase) {
        if phase != self.snapshot.phase {
            tracing::debug!("Print phase {} -> {}", self.snapshot.phase, phase);
            self.snapshot = PhaseSnapshot {
                phase,
                since: Utc::now(),
            };
        }
    }

    /// Update from one transmitted line
    pub fn on_transmit(&mut self, line: &str) {
        if home_regex().is_match(line) {
            self.set(PrintPhase::Homing);
        } else if level_regex().is_match(line) {
            self.set(PrintPhase::Leveling);
        } else if heat_regex().is_match(line) {
            self.set(PrintPhase::Heating);
        } else if prime_regex().is_match(line) {
            self.set(PrintPhase::Priming);
        } else if self.is_first_layer(line) {
            self.set(PrintPhase::FirstLayer);
        } else if extrude_regex().is_match(line)
            && !matches!(
                self.snapshot.phase,
                PrintPhase::FirstLayer | PrintPhase::Printing
            )
        {
            self.set(PrintPhase::Printing);
        }
    }

    fn is_first_layer(&self, line: &str) -> bool {
        if !extrude_regex().is_match(line) {
            return false;
        }
        z_regex()
            .captures(line)
            .and_then(|caps| caps[1].parse::<f64>().ok())
            .map(|z| (0.0..=self.first_layer_height + FIRST_LAYER_TOLERANCE).contains(&z))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_sequence() {
        let mut tracker = PhaseTracker::new(0.2);
        assert_eq!(tracker.snapshot().phase, PrintPhase::Unknown);

        tracker.on_transmit("M140 S60");
        assert_eq!(tracker.snapshot().phase, PrintPhase::Heating);
        tracker.on_transmit("G28");
        assert_eq!(tracker.snapshot().phase, PrintPhase::Homing);
        tracker.on_transmit("G29");
        assert_eq!(tracker.snapshot().phase, PrintPhase::Leveling);
        tracker.on_transmit("G1 X0.1 Y20 Z0.3 F5000 ; prime line");
        assert_eq!(tracker.snapshot().phase, PrintPhase::Priming);
        tracker.on_transmit("G1 X10 Y10 Z0.2 E0.5");
        assert_eq!(tracker.snapshot().phase, PrintPhase::FirstLayer);
        tracker.on_transmit("G1 X20 Y10 E1.0");
        assert_eq!(tracker.snapshot().phase, PrintPhase::FirstLayer);
        tracker.on_transmit("G1 X20 Y10 Z0.6 E1.5");
        assert_eq!(tracker.snapshot().phase, PrintPhase::Printing);
    }

    #[test]
    fn test_first_layer_tolerance() {
        let mut tracker = PhaseTracker::new(0.2);
        tracker.on_transmit("G1 Z0.25 E0.1");
        assert_eq!(tracker.snapshot().phase, PrintPhase::FirstLayer);

        let mut tracker = PhaseTracker::new(0.2);
        tracker.on_transmit("G1 Z0.26 E0.1");
        assert_eq!(tracker.snapshot().phase, PrintPhase::Printing);
    }

    #[test]
    fn test_travel_moves_ignored() {
        let mut tracker = PhaseTracker::new(0.2);
        tracker.on_transmit("G1 X10 Y10 F3000");
        tracker.on_transmit("M105");
        assert_eq!(tracker.snapshot().phase, PrintPhase::Unknown);
    }

    #[test]
    fn test_since_changes_only_on_new_phase() {
        let mut tracker = PhaseTracker::new(0.2);
        tracker.on_transmit("G28");
        let since = tracker.snapshot().since;
        tracker.on_transmit("G28 X");
        assert_eq!(tracker.snapshot().since, since);
    }
}
