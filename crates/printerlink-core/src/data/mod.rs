//! Data models for link state, printer status and telemetry
//!
//! This module provides:
//! - The connection state machine (`LinkState`)
//! - Printer status snapshots derived from the state
//! - Telemetry samples (temperature, position, SD progress)
//! - Firmware identification and SD card listings
//! - Print phase tracking values

pub mod telemetry;

pub use telemetry::{
    FirmwareInfo, PositionSample, SdFile, SdProgress, TelemetryKind, TemperatureData,
    TemperatureSample,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of the printer link
///
/// Exactly one value is active at a time. Only the communicator facade
/// mutates it and every change is published as one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No link open
    #[default]
    Disconnected,
    /// Port is being opened and the board is settling
    Connecting,
    /// Connected and ready for commands
    Operational,
    /// A print job is running
    Printing,
    /// A print job is paused
    Paused,
    /// Device fault or heartbeat loss (recoverable)
    Error,
    /// Cancel sequence running, waiting for the machine to cool down
    Cancelling,
    /// Print finished, final moves running
    Finishing,
}

impl LinkState {
    /// Lowercase identifier used in logs and serialized payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Operational => "operational",
            Self::Printing => "printing",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Cancelling => "cancelling",
            Self::Finishing => "finishing",
        }
    }

    /// True for every state with an open link
    pub fn is_connected(&self) -> bool {
        !matches!(self, LinkState::Disconnected | LinkState::Connecting)
    }

    /// True when the printer can run or is running jobs
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            LinkState::Operational | LinkState::Printing | LinkState::Paused
        )
    }

    /// Check if a transition from this state to `target` is valid.
    ///
    /// - Disconnected can only go to Connecting
    /// - Connecting can go to Operational, Error, or back to Disconnected
    /// - Any state can go to Error or Disconnected
    /// - Error returns to Operational once a recovery probe succeeds
    pub fn can_transition_to(&self, target: LinkState) -> bool {
        use LinkState::*;
        if *self == target {
            return true;
        }
        match (self, target) {
            (Disconnected, Connecting) => true,
            (Connecting, Operational | Error | Disconnected) => true,
            (_, Disconnected) => true,
            (Disconnected, _) => false,
            (_, Error) => true,
            (Connecting, _) => false,
            (Error, Operational | Connecting) => true,
            (Error, _) => false,
            (Operational, Printing | Paused | Cancelling | Connecting) => true,
            (Printing, Paused | Operational | Cancelling | Finishing) => true,
            (Paused, Printing | Operational | Cancelling) => true,
            (Cancelling, Operational) => true,
            (Finishing, Operational) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Operational => write!(f, "Operational"),
            Self::Printing => write!(f, "Printing"),
            Self::Paused => write!(f, "Paused"),
            Self::Error => write!(f, "Error"),
            Self::Cancelling => write!(f, "Cancelling"),
            Self::Finishing => write!(f, "Finishing"),
        }
    }
}

/// Boolean view of a `LinkState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StatusFlags {
    /// Operational, Printing or Paused
    pub operational: bool,
    /// Printing
    pub printing: bool,
    /// Paused
    pub paused: bool,
    /// Error
    pub error: bool,
    /// Operational and idle
    pub ready: bool,
    /// Disconnected or Error
    pub closed_or_error: bool,
}

impl From<LinkState> for StatusFlags {
    fn from(state: LinkState) -> Self {
        Self {
            operational: state.is_operational(),
            printing: state == LinkState::Printing,
            paused: state == LinkState::Paused,
            error: state == LinkState::Error,
            ready: state == LinkState::Operational,
            closed_or_error: matches!(state, LinkState::Disconnected | LinkState::Error),
        }
    }
}

/// Printer status snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterStatus {
    /// Current link state
    pub state: LinkState,
    /// Derived flags
    pub flags: StatusFlags,
    /// Last device error line, kept while in the Error state
    pub error_message: Option<String>,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
}

impl PrinterStatus {
    /// Build a snapshot for `state`
    pub fn new(state: LinkState, error_message: Option<String>) -> Self {
        Self {
            state,
            flags: state.into(),
            error_message,
            timestamp: Utc::now(),
        }
    }
}

impl Default for PrinterStatus {
    fn default() -> Self {
        Self::new(LinkState::Disconnected, None)
    }
}

/// Coarse phase of the running job, inferred from transmitted G-code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrintPhase {
    /// Nothing observed yet
    #[default]
    Unknown,
    /// Start-up commands
    Initializing,
    /// G28
    Homing,
    /// Heater set or wait commands
    Heating,
    /// G29 bed probing
    Leveling,
    /// Prime or purge line
    Priming,
    /// Extruding at first-layer height
    FirstLayer,
    /// Extruding above the first layer
    Printing,
    /// End-of-job moves
    Finishing,
    /// No job
    Idle,
}

impl fmt::Display for PrintPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Initializing => "initializing",
            Self::Homing => "homing",
            Self::Heating => "heating",
            Self::Leveling => "leveling",
            Self::Priming => "priming",
            Self::FirstLayer => "first_layer",
            Self::Printing => "printing",
            Self::Finishing => "finishing",
            Self::Idle => "idle",
        };
        write!(f, "{}", s)
    }
}

/// Phase plus the time it was entered
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseSnapshot {
    /// Current phase
    pub phase: PrintPhase,
    /// When the phase was entered
    pub since: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_flags() {
        let flags = StatusFlags::from(LinkState::Printing);
        assert!(flags.operational);
        assert!(flags.printing);
        assert!(!flags.ready);

        let flags = StatusFlags::from(LinkState::Operational);
        assert!(flags.ready);
        assert!(!flags.closed_or_error);

        let flags = StatusFlags::from(LinkState::Error);
        assert!(flags.error);
        assert!(flags.closed_or_error);
        assert!(!flags.operational);
    }

    #[test]
    fn test_state_transitions() {
        use LinkState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Printing));
        assert!(Connecting.can_transition_to(Operational));
        assert!(Operational.can_transition_to(Printing));
        assert!(Printing.can_transition_to(Error));
        assert!(Error.can_transition_to(Operational));
        assert!(!Error.can_transition_to(Printing));
        assert!(Cancelling.can_transition_to(Operational));
        assert!(Paused.can_transition_to(Disconnected));
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&LinkState::Operational).unwrap();
        assert_eq!(json, "\"operational\"");
        assert_eq!(LinkState::Cancelling.as_str(), "cancelling");
        assert_eq!(PrintPhase::FirstLayer.to_string(), "first_layer");
    }
}
