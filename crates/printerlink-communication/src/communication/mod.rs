//! Connection and transmission
//!
//! - `serial`: link trait, real serial port, port discovery, line splitting
//! - `mock`: scripted in-memory device
//! - `window` / `ack` / `queue`: flow-control primitives
//! - `controller`: sender/receiver loops, primary and fallback modes
//! - `session`: exclusive raw access for synchronous exchanges

pub mod ack;
pub mod controller;
pub mod mock;
pub mod queue;
pub mod serial;
pub mod session;
pub mod window;

pub use ack::AckTable;
pub use controller::{LinkEvent, LinkMode, LinkObserver, TransmissionController};
pub use mock::{MockDevice, MockLink};
pub use queue::{OutboundMessage, SendQueue};
pub use serial::{
    list_ports, LineBuffer, LinkOpener, LinkTimeouts, RealSerialLink, SerialLink, SerialOpener,
    SerialPortInfo,
};
pub use session::LinkSession;
pub use window::{FlowWindow, WindowWait};

use printerlink_settings::Config;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

/// Commands that must run on an empty window and be acked before anything
/// else is sent: heat-and-wait, finish moves, dwell, home, probe, emergency stop.
pub fn is_barrier(line: &str) -> bool {
    static BARRIER_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = BARRIER_REGEX.get_or_init(|| {
        Regex::new(r"(?i)^(?:M109|M190|M400|G4|G28|G29|M112)\b").expect("invalid regex pattern")
    });
    regex.is_match(line.trim())
}

/// Transmission controller settings
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Read and write timeouts of the port
    pub timeouts: LinkTimeouts,
    /// DTR low time when resetting the board
    pub reset_pulse: Duration,
    /// Wait after reset before talking to the board
    pub settle_delay: Duration,
    /// Never use primary mode
    pub force_sync_mode: bool,
    /// Credits in primary mode
    pub window_size: usize,
    /// Longest wait for one ack before its credit is reclaimed
    pub ack_timeout: Duration,
    /// Bound on joining the worker threads
    pub join_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ControllerConfig {
    fn from(config: &Config) -> Self {
        Self {
            baud_rate: config.connection.baud_rate,
            timeouts: LinkTimeouts {
                read: Duration::from_millis(config.connection.read_timeout_ms),
                write: Duration::from_millis(config.connection.write_timeout_ms),
            },
            reset_pulse: Duration::from_millis(config.connection.reset_pulse_ms),
            settle_delay: Duration::from_millis(config.connection.settle_delay_ms),
            force_sync_mode: config.connection.force_sync_mode,
            window_size: config.transmission.window_size,
            ack_timeout: Duration::from_millis(config.transmission.ack_timeout_ms),
            join_timeout: Duration::from_millis(config.transmission.join_timeout_ms),
        }
    }
}

/// SD upload settings
#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    /// Wait for the ack of one body line
    pub line_timeout: Duration,
    /// Wait for the ack of M28
    pub open_timeout: Duration,
    /// Wait for the ack of M29
    pub close_timeout: Duration,
    /// Retries of one line before giving up
    pub max_retries: u32,
    /// Body lines longer than this are split on spaces
    pub max_line_len: usize,
}

/// Cooling watchdog thresholds used after a cancel
#[derive(Debug, Clone, PartialEq)]
pub struct CoolingConfig {
    /// Hot end considered cool at or below this
    pub hotend_c: f64,
    /// Bed considered cool at or below this
    pub bed_c: f64,
    /// How long the printer must stay cool
    pub stable: Duration,
    /// Interval between checks
    pub check_interval: Duration,
    /// Give up after this long
    pub timeout: Duration,
}

/// Everything the engine needs, resolved from [`Config`]
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Port name, or "Auto"
    pub port: String,
    /// Controller settings
    pub controller: ControllerConfig,
    /// Delay between connect and detection
    pub detection_delay: Duration,
    /// Consecutive wait timeouts before the link is declared lost
    pub max_consecutive_timeouts: u32,
    /// Bound on the recovery probe
    pub probe_timeout: Duration,
    /// Cached samples younger than this are served without a query
    pub cache_fresh: Duration,
    /// Temperature samples older than this are stale
    pub temp_stale: Duration,
    /// Position samples older than this are stale
    pub position_stale: Duration,
    /// Minimum interval between auto-report re-arms
    pub rearm_cooldown: Duration,
    /// ETA smoothing half-life in seconds
    pub eta_half_life_s: f64,
    /// SD upload settings
    pub upload: UploadConfig,
    /// First layer height for phase tracking
    pub first_layer_height: f64,
    /// Cooling watchdog
    pub cooling: CoolingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        let ms = Duration::from_millis;
        let secs = Duration::from_secs;
        Self {
            port: config.connection.port.clone(),
            controller: ControllerConfig::from(config),
            detection_delay: ms(config.detection.delay_ms),
            max_consecutive_timeouts: config.heartbeat.max_consecutive_timeouts,
            probe_timeout: ms(config.heartbeat.probe_timeout_ms),
            cache_fresh: ms(config.telemetry.cache_fresh_ms),
            temp_stale: ms(config.telemetry.temp_stale_ms),
            position_stale: ms(config.telemetry.position_stale_ms),
            rearm_cooldown: ms(config.telemetry.rearm_cooldown_ms),
            eta_half_life_s: config.telemetry.eta_half_life_s,
            upload: UploadConfig {
                line_timeout: ms(config.upload.line_timeout_ms),
                open_timeout: ms(config.upload.open_timeout_ms),
                close_timeout: ms(config.upload.close_timeout_ms),
                max_retries: config.upload.max_retries,
                max_line_len: config.upload.max_line_len,
            },
            first_layer_height: config.print.first_layer_height,
            cooling: CoolingConfig {
                hotend_c: config.print.cool_hotend_c,
                bed_c: config.print.cool_bed_c,
                stable: secs(config.print.cool_stable_s),
                check_interval: secs(config.print.cool_check_interval_s),
                timeout: secs(config.print.cool_timeout_s),
            },
        }
    }
}
