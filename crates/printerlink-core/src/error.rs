//! Error handling for PrinterLink
//!
//! Errors are split by the layer that raises them:
//! - Connection errors (the serial link failed to open, read or write)
//! - Protocol errors (the device reported a fault or broke the handshake)
//! - Firmware errors (a feature is not available for the detected firmware)
//!
//! Waiting for an acknowledgement that never arrives is not an error at the
//! transport level; waiters receive `false`/`None` instead.

use thiserror::Error;

/// Connection (link) error type
///
/// Any of these is fatal to the current connection.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// No usable port was found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The requested port, or "Auto" when auto-detection found nothing.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Writing to the link failed
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// The reason for the write failure.
        reason: String,
    },

    /// Reading from the link failed
    #[error("Read failed: {reason}")]
    ReadFailed {
        /// The reason for the read failure.
        reason: String,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// Operation requires an open link
    #[error("Not connected")]
    NotConnected,

    /// Connection timeout
    #[error("Connection timeout after {timeout_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },
}

/// Protocol error type
///
/// Raised when the device answers with an error or alarm, or when a
/// handshake cannot be completed. The link stays open.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Device reported `Error:`, `!!` or an alarm
    #[error("Device error: {line}")]
    DeviceError {
        /// The raw line reported by the device.
        line: String,
    },

    /// A numbered line could not be delivered within the retry budget
    #[error("Line N{line_number} not accepted after {attempts} attempts")]
    RetriesExhausted {
        /// The line number that was being sent.
        line_number: u64,
        /// How many times it was written.
        attempts: u32,
    },

    /// Device sent something that does not fit the current exchange
    #[error("Unexpected reply: {reply}")]
    UnexpectedReply {
        /// The reply text.
        reply: String,
    },

    /// Engine is in a state that does not allow the operation
    #[error("Invalid state for {operation}: {state}")]
    InvalidState {
        /// The rejected operation.
        operation: String,
        /// The state the engine was in.
        state: String,
    },
}

/// Firmware error type
#[derive(Error, Debug, Clone)]
pub enum FirmwareError {
    /// Unsupported feature
    #[error("Feature not supported by {firmware}: {feature}")]
    UnsupportedFeature {
        /// The firmware that does not support the feature.
        firmware: String,
        /// The unsupported feature name.
        feature: String,
    },

    /// Detection has not produced a result yet
    #[error("Printer detection has not run yet")]
    NotDetected,
}

/// Main error type for PrinterLink
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Firmware error
    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Connection(ConnectionError::Timeout { .. }) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Io(_))
    }

    /// Check if this is a protocol error
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Check if this is a firmware error
    pub fn is_firmware_error(&self) -> bool {
        matches!(self, Error::Firmware(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConnectionError::FailedToOpen {
            port: "/dev/ttyUSB0".to_string(),
            reason: "busy".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to open port /dev/ttyUSB0: busy");

        let err = ProtocolError::RetriesExhausted {
            line_number: 12,
            attempts: 10,
        };
        assert_eq!(err.to_string(), "Line N12 not accepted after 10 attempts");
    }

    #[test]
    fn test_error_classification() {
        let err: Error = ConnectionError::Timeout { timeout_ms: 500 }.into();
        assert!(err.is_timeout());
        assert!(err.is_connection_error());

        let err: Error = ProtocolError::DeviceError {
            line: "Error:Printer halted".to_string(),
        }
        .into();
        assert!(err.is_protocol_error());
        assert!(!err.is_timeout());

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read");
        let err: Error = io.into();
        assert!(err.is_timeout());

        assert!(Error::from(FirmwareError::NotDetected).is_firmware_error());
    }
}
