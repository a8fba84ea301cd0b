//! Printer communicator and its helpers
//!
//! - `communicator`: the facade and state machine
//! - `commands`: G-code lines for the command surface
//! - `sd_card`: numbered, checksummed SD upload
//! - `autoreport`: auto-report probing and re-arming
//! - `heartbeat`: consecutive-timeout tracking
//! - `cooldown`: cooling watchdog after a cancel
//! - `phase`: print phase inference

pub mod autoreport;
pub mod commands;
pub mod communicator;
pub mod cooldown;
pub mod heartbeat;
pub mod phase;
pub mod sd_card;

pub use autoreport::AutoReport;
pub use communicator::{PrintProgress, PrinterCommunicator, AUTO_PORT, CONNECT_COMMANDS};
pub use cooldown::{CoolingStatus, CoolingWatch};
pub use heartbeat::{Heartbeat, HeartbeatVerdict};
pub use phase::PhaseTracker;
pub use sd_card::UploadReport;
