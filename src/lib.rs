//! # PrinterLink
//!
//! Serial G-code protocol engine for 3D printers:
//! - Credit-window command delivery with barrier commands and per-line acks
//! - Temperature, position, firmware and SD status parsing
//! - Printer and firmware detection with per-family handlers
//! - SD card listing, printing and checksummed uploads
//!
//! ## Architecture
//!
//! PrinterLink is organized as a workspace with multiple crates:
//!
//! 1. **printerlink-core** - State machine, telemetry types, errors, events, ETA estimation
//! 2. **printerlink-communication** - Serial link, transmission controller, parsing,
//!    detection and the printer communicator
//! 3. **printerlink-settings** - Typed configuration and persistence
//! 4. **printerlink** - Re-exports and the monitor binary

pub use printerlink_communication::{communication, firmware, printer, protocol};
pub use printerlink_core::data;

pub use printerlink_core::{
    ConnectionError, Error, EventDispatcher, FirmwareError, FirmwareInfo, LinkState,
    PhaseSnapshot, PositionSample, PrintPhase, PrinterEvent, PrinterListener,
    PrinterListenerHandle, PrinterStatus, ProtocolError, Result, SdFile, SdProgress,
    TelemetryKind, TemperatureData, TemperatureSample,
};

pub use printerlink_communication::{
    list_ports, EngineConfig, LinkMode, MockDevice, PrintProgress, PrinterCapabilities,
    PrinterCommunicator, PrinterTypeInfo, SerialPortInfo, UploadReport,
};

pub use printerlink_settings::{default_config_path, Config, SettingsError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Console output with target, level, thread and line information.
/// `RUST_LOG` overrides the INFO default. A second call leaves the
/// installed subscriber in place.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true);

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Logging already initialized");
    }

    Ok(())
}
