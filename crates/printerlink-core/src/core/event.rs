//! Event system for printer communication
//!
//! Provides:
//! - Event types for link state, telemetry and device messages
//! - Event dispatcher for publishing events to async subscribers

use crate::data::{LinkState, PositionSample, SdProgress, TemperatureSample};
use tokio::sync::broadcast;

/// Printer event types
#[derive(Debug, Clone)]
pub enum PrinterEvent {
    /// Link state changed
    StateChanged {
        /// State before the change.
        old: LinkState,
        /// State after the change.
        new: LinkState,
    },
    /// Temperature report parsed
    Temperature(TemperatureSample),
    /// Position report parsed
    Position(PositionSample),
    /// Any other line received from the device
    Response(String),
    /// Device or link error
    Error(String),
    /// SD print progress updated
    SdProgress(SdProgress),
    /// Printer and firmware detection finished
    Detected {
        /// Detected printer type.
        printer_type: String,
        /// Detected firmware.
        firmware: String,
    },
}

impl std::fmt::Display for PrinterEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrinterEvent::StateChanged { old, new } => write!(f, "State: {} -> {}", old, new),
            PrinterEvent::Temperature(sample) => {
                write!(f, "Temperature: {} heaters", sample.tools.len())
            }
            PrinterEvent::Position(pos) => write!(f, "Position: {}", pos),
            PrinterEvent::Response(line) => write!(f, "Response: {}", line),
            PrinterEvent::Error(msg) => write!(f, "Error: {}", msg),
            PrinterEvent::SdProgress(p) => write!(f, "SD progress: {:.1}%", p.completion),
            PrinterEvent::Detected {
                printer_type,
                firmware,
            } => write!(f, "Detected {} / {}", printer_type, firmware),
        }
    }
}

/// Event dispatcher for publishing events to subscribers
#[derive(Clone)]
pub struct EventDispatcher {
    tx: broadcast::Sender<PrinterEvent>,
}

impl EventDispatcher {
    /// Create a new event dispatcher
    ///
    /// # Arguments
    /// * `buffer_size` - Size of the broadcast buffer
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PrinterEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of subscribers that received it; zero when nobody listens.
    pub fn publish(&self, event: PrinterEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let dispatcher = EventDispatcher::default();
        assert_eq!(dispatcher.subscriber_count(), 0);
        assert_eq!(dispatcher.publish(PrinterEvent::Response("ok".into())), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let dispatcher = EventDispatcher::new(8);
        let mut rx = dispatcher.subscribe();
        dispatcher.publish(PrinterEvent::StateChanged {
            old: LinkState::Connecting,
            new: LinkState::Operational,
        });
        dispatcher.publish(PrinterEvent::Error("Error:Thermal Runaway".into()));

        match rx.recv().await.unwrap() {
            PrinterEvent::StateChanged { old, new } => {
                assert_eq!(old, LinkState::Connecting);
                assert_eq!(new, LinkState::Operational);
            }
            other => panic!("unexpected event {}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), PrinterEvent::Error(_)));
    }
}
