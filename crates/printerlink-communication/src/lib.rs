//! # PrinterLink Communication
//!
//! Serial protocol engine for 3D printers speaking G-code.
//! Provides the flow-controlled transmission controller, response parsing
//! and dispatch, printer and firmware detection with per-family handlers,
//! the SD card sub-protocol and the `PrinterCommunicator` facade.

pub mod communication;
pub mod firmware;
pub mod printer;
pub mod protocol;

pub use communication::{
    is_barrier, list_ports, ControllerConfig, CoolingConfig, EngineConfig, LinkMode,
    LinkObserver, LinkOpener, MockDevice, SerialLink, SerialOpener, SerialPortInfo,
    TransmissionController, UploadConfig,
};

pub use firmware::{
    create_handler, detect_capabilities, detect_firmware, detect_printer_type, DetectionResult,
    FirmwareType, PrinterCapabilities, PrinterDetector, PrinterHandler, PrinterType,
    PrinterTypeInfo,
};

pub use printer::{PrintProgress, PrinterCommunicator, UploadReport};

pub use protocol::{DispatchEvent, ResponseDispatcher};
