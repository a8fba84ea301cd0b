//! Printer listener interface
//!
//! Defines the callback trait for printer events

use crate::data::{PositionSample, PrinterStatus, TemperatureSample};

/// Handle for a registered printer listener.
///
/// Uniquely identifies a listener subscription. Can be used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrinterListenerHandle(pub String);

impl PrinterListenerHandle {
    /// Fresh random handle
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for PrinterListenerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener trait for printer events
///
/// Implement this trait to receive notifications. Every method has an empty
/// default so implementors only override what they need. Callbacks run on
/// engine threads and must not block for long.
pub trait PrinterListener: Send + Sync {
    /// Called when the link state changes
    fn on_state_change(&self, _status: &PrinterStatus) {}

    /// Called for every parsed temperature report
    fn on_temperature_update(&self, _sample: &TemperatureSample) {}

    /// Called for every parsed position report
    fn on_position_update(&self, _position: &PositionSample) {}

    /// Called for every received line that is not telemetry
    fn on_response(&self, _line: &str) {}

    /// Called when the device or the link reports an error
    fn on_error(&self, _message: &str) {}
}
