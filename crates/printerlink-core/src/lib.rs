//! # PrinterLink Core
//!
//! Core types, errors and utilities for PrinterLink.
//! Provides the link state machine, telemetry data models, events,
//! listener callbacks and print progress estimation.

pub mod core;
pub mod data;
pub mod error;
pub mod progress;
pub mod types;

pub use crate::core::{EventDispatcher, PrinterEvent, PrinterListener, PrinterListenerHandle};

pub use data::{
    FirmwareInfo, LinkState, PhaseSnapshot, PositionSample, PrintPhase, PrinterStatus, SdFile,
    SdProgress, StatusFlags, TelemetryKind, TemperatureData, TemperatureSample,
};

pub use error::{ConnectionError, Error, FirmwareError, ProtocolError, Result};

pub use progress::{fmt_hms, parse_m27, Clock, EtaEstimator, EtaReport, ManualClock, SystemClock};

pub use types::{thread_safe_rw_map, ThreadSafeRwMap};
