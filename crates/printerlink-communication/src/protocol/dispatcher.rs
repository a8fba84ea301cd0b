//! Response dispatcher
//!
//! Turns one received line into typed events and keeps the latest samples.
//! Precedence, first match wins:
//! 1. SD listing capture
//! 2. temperature (handler, then generic) and position (generic, then handler)
//! 3. firmware banner
//! 4. device error
//! 5. bare `ok`
//! 6. anything else is a generic response
//!
//! SD progress is tracked on every line regardless of the above.

use super::parser;
use super::sd::{parse_file_list, SdProgressTracker, BEGIN_FILE_LIST, END_FILE_LIST};
use crate::firmware::PrinterHandler;
use parking_lot::{Mutex, RwLock};
use printerlink_core::{
    EtaEstimator, FirmwareInfo, PositionSample, SdFile, SdProgress, TelemetryKind,
    TemperatureSample,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Banner lines kept for detection and capability scanning
const MAX_BANNER_LINES: usize = 200;

/// Typed outcome of dispatching one line
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// Heater readings
    Temperature(TemperatureSample),
    /// Axis position
    Position(PositionSample),
    /// Firmware identification changed
    Firmware(FirmwareInfo),
    /// A complete SD listing was received
    SdListing(Vec<SdFile>),
    /// Device reported an error or alarm
    DeviceError(String),
    /// Any other line
    Response(String),
    /// SD progress changed
    SdProgress(SdProgress),
}

#[derive(Default)]
struct Snapshots {
    temperature: Option<TemperatureSample>,
    position: Option<PositionSample>,
    last_temperature_line: Option<String>,
    last_position_line: Option<String>,
    firmware: FirmwareInfo,
    sd_files: Vec<SdFile>,
    last_seen: HashMap<TelemetryKind, Instant>,
}

struct ListingCapture {
    active: bool,
    lines: Vec<String>,
}

/// Line dispatcher with the cached snapshot state
pub struct ResponseDispatcher {
    handler: RwLock<Option<PrinterHandler>>,
    snapshots: RwLock<Snapshots>,
    listing: Mutex<ListingCapture>,
    sd_progress: Mutex<SdProgressTracker>,
    banner: Mutex<Vec<String>>,
}

impl ResponseDispatcher {
    /// Create a dispatcher; `eta_half_life_s` configures the SD ETA estimator
    pub fn new(eta_half_life_s: f64) -> Self {
        Self {
            handler: RwLock::new(None),
            snapshots: RwLock::new(Snapshots::default()),
            listing: Mutex::new(ListingCapture {
                active: false,
                lines: Vec::new(),
            }),
            sd_progress: Mutex::new(SdProgressTracker::new(EtaEstimator::new(eta_half_life_s))),
            banner: Mutex::new(Vec::new()),
        }
    }

    /// Install the handler chosen by detection
    pub fn set_handler(&self, handler: PrinterHandler) {
        *self.handler.write() = Some(handler);
    }

    /// Active handler, if detection ran
    pub fn handler(&self) -> Option<PrinterHandler> {
        self.handler.read().clone()
    }

    /// Forget everything learned on the previous connection
    pub fn reset(&self) {
        *self.handler.write() = None;
        *self.snapshots.write() = Snapshots::default();
        let mut listing = self.listing.lock();
        listing.active = false;
        listing.lines.clear();
        self.sd_progress.lock().reset();
        self.banner.lock().clear();
    }

    /// Dispatch one received line
    pub fn dispatch(&self, raw: &str) -> Vec<DispatchEvent> {
        let line = raw.trim();
        if line.is_empty() {
            return Vec::new();
        }

        {
            let mut banner = self.banner.lock();
            if banner.len() < MAX_BANNER_LINES {
                banner.push(line.to_string());
            }
        }

        let mut events = Vec::with_capacity(2);
        if let Some(event) = self.classify(line) {
            events.push(event);
        }
        if let Some(progress) = self.sd_progress.lock().observe(line) {
            self.touch(TelemetryKind::SdStatus);
            events.push(DispatchEvent::SdProgress(progress));
        }
        events
    }

    fn classify(&self, line: &str) -> Option<DispatchEvent> {
        if let Some(event) = self.capture_listing(line) {
            return event;
        }

        if let Some(sample) = self.match_temperature(line) {
            tracing::debug!("Temperature report: {}", line);
            let mut snapshots = self.snapshots.write();
            snapshots.temperature = Some(sample.clone());
            snapshots.last_temperature_line = Some(line.to_string());
            snapshots
                .last_seen
                .insert(TelemetryKind::Temperature, Instant::now());
            return Some(DispatchEvent::Temperature(sample));
        }

        if let Some(sample) = self.match_position(line) {
            tracing::debug!("Position report: {}", sample);
            let mut snapshots = self.snapshots.write();
            snapshots.position = Some(sample);
            snapshots.last_position_line = Some(line.to_string());
            snapshots
                .last_seen
                .insert(TelemetryKind::Position, Instant::now());
            return Some(DispatchEvent::Position(sample));
        }

        if let Some(info) = self.match_firmware(line) {
            return Some(DispatchEvent::Firmware(info));
        }

        if parser::is_error_line(line) {
            tracing::error!("Device error: {}", line);
            return Some(DispatchEvent::DeviceError(line.to_string()));
        }

        if parser::is_ok_line(line) {
            return None;
        }

        Some(DispatchEvent::Response(line.to_string()))
    }

    /// `Some(event)` when the line belongs to a listing block
    fn capture_listing(&self, line: &str) -> Option<Option<DispatchEvent>> {
        let mut listing = self.listing.lock();
        if line.eq_ignore_ascii_case(BEGIN_FILE_LIST) {
            listing.active = true;
            listing.lines.clear();
            return Some(None);
        }
        if !listing.active {
            return None;
        }
        if line.eq_ignore_ascii_case(END_FILE_LIST) {
            listing.active = false;
            let files = parse_file_list(&listing.lines);
            listing.lines.clear();
            tracing::info!("SD listing: {} files", files.len());
            self.snapshots.write().sd_files = files.clone();
            return Some(Some(DispatchEvent::SdListing(files)));
        }
        listing.lines.push(line.to_string());
        Some(None)
    }

    fn match_temperature(&self, line: &str) -> Option<TemperatureSample> {
        let from_handler = self
            .handler
            .read()
            .as_ref()
            .and_then(|h| h.parse_temperature(line));
        from_handler.or_else(|| parser::parse_temperature(line))
    }

    fn match_position(&self, line: &str) -> Option<PositionSample> {
        parser::parse_position(line).or_else(|| {
            self.handler
                .read()
                .as_ref()
                .and_then(|h| h.parse_position(line))
        })
    }

    fn match_firmware(&self, line: &str) -> Option<FirmwareInfo> {
        let mut snapshots = self.snapshots.write();

        if line.starts_with("FIRMWARE_NAME:") {
            let mut info = parser::firmware_info_from_fields(parser::parse_kv_tokens(line));
            info.capabilities = std::mem::take(&mut snapshots.firmware.capabilities);
            tracing::info!(
                "Firmware: {} {}",
                info.name.as_deref().unwrap_or("unknown"),
                info.version.as_deref().unwrap_or("")
            );
            snapshots.firmware = info.clone();
            return Some(info);
        }

        if let Some((name, enabled)) = parser::parse_capability_line(line) {
            snapshots.firmware.capabilities.insert(name, enabled);
            return Some(snapshots.firmware.clone());
        }

        if let Some(name) = parser::bare_firmware_name(line) {
            if snapshots.firmware.name.is_none() {
                snapshots.firmware.name = Some(name.to_string());
            }
            return Some(snapshots.firmware.clone());
        }

        None
    }

    fn touch(&self, kind: TelemetryKind) {
        self.snapshots.write().last_seen.insert(kind, Instant::now());
    }

    /// Latest temperature sample
    pub fn temperature(&self) -> Option<TemperatureSample> {
        self.snapshots.read().temperature.clone()
    }

    /// Latest position sample
    pub fn position(&self) -> Option<PositionSample> {
        self.snapshots.read().position
    }

    /// Raw text of the latest temperature report
    pub fn last_temperature_line(&self) -> Option<String> {
        self.snapshots.read().last_temperature_line.clone()
    }

    /// Raw text of the latest position report
    pub fn last_position_line(&self) -> Option<String> {
        self.snapshots.read().last_position_line.clone()
    }

    /// Firmware identification gathered so far
    pub fn firmware_info(&self) -> FirmwareInfo {
        self.snapshots.read().firmware.clone()
    }

    /// Last SD listing
    pub fn sd_files(&self) -> Vec<SdFile> {
        self.snapshots.read().sd_files.clone()
    }

    /// SD progress snapshot
    pub fn sd_progress(&self) -> SdProgress {
        self.sd_progress.lock().progress().clone()
    }

    /// Formatted SD remaining time
    pub fn sd_eta_string(&self) -> String {
        self.sd_progress.lock().eta_string()
    }

    /// Drop the SD job state
    pub fn reset_sd_progress(&self) {
        self.sd_progress.lock().reset();
    }

    /// Age of the newest sample of a kind
    pub fn time_since_last(&self, kind: TelemetryKind) -> Option<Duration> {
        self.snapshots
            .read()
            .last_seen
            .get(&kind)
            .map(|at| at.elapsed())
    }

    /// Lines received since the connection opened (bounded)
    pub fn banner_lines(&self) -> Vec<String> {
        self.banner.lock().clone()
    }
}

impl Default for ResponseDispatcher {
    fn default() -> Self {
        Self::new(20.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::{create_handler, FirmwareType, PrinterType};

    #[test]
    fn test_precedence_and_cache() {
        let dispatcher = ResponseDispatcher::default();
        let events = dispatcher.dispatch("ok T:210.0 /210.0 B:60.0 /60.0");
        assert!(matches!(events.as_slice(), [DispatchEvent::Temperature(_)]));
        assert_eq!(
            dispatcher.last_temperature_line().as_deref(),
            Some("ok T:210.0 /210.0 B:60.0 /60.0")
        );
        assert!(dispatcher
            .time_since_last(TelemetryKind::Temperature)
            .is_some());
        assert!(dispatcher.time_since_last(TelemetryKind::Position).is_none());

        assert!(dispatcher.dispatch("ok").is_empty());
        assert!(dispatcher.dispatch("   ").is_empty());
        assert_eq!(
            dispatcher.dispatch("echo:busy: processing"),
            vec![DispatchEvent::Response("echo:busy: processing".to_string())]
        );
    }

    #[test]
    fn test_position_count_suffix() {
        let dispatcher = ResponseDispatcher::default();
        dispatcher.dispatch("X:10.00 Y:20.00 Z:5.00 E:0.00 Count X:800 Y:1600 Z:4000");
        let pos = dispatcher.position().unwrap();
        assert_eq!((pos.x, pos.y, pos.z, pos.e), (10.0, 20.0, 5.0, 0.0));
    }

    #[test]
    fn test_handler_first_for_temperature() {
        let dispatcher = ResponseDispatcher::default();
        dispatcher.set_handler(create_handler(PrinterType::Sla, FirmwareType::Unknown));
        dispatcher.dispatch("T:25.0 /30.0");
        let sample = dispatcher.temperature().unwrap();
        assert!(sample.tool("resin").is_some());

        // SLA position falls through from the generic parser
        dispatcher.dispatch("echo: Z:4.5");
        assert_eq!(dispatcher.position().map(|p| p.z), Some(4.5));
    }

    #[test]
    fn test_error_line() {
        let dispatcher = ResponseDispatcher::default();
        let events = dispatcher.dispatch("Error:Heating failed, system stopped!");
        assert_eq!(
            events,
            vec![DispatchEvent::DeviceError(
                "Error:Heating failed, system stopped!".to_string()
            )]
        );
    }

    #[test]
    fn test_firmware_banner() {
        let dispatcher = ResponseDispatcher::default();
        dispatcher.dispatch("Cap:AUTOREPORT_TEMP:1");
        let events = dispatcher
            .dispatch("FIRMWARE_NAME:Marlin 2.1.2 (Github) MACHINE_TYPE:Ender-3 EXTRUDER_COUNT:1");
        let Some(DispatchEvent::Firmware(info)) = events.first() else {
            panic!("expected firmware event, got {:?}", events);
        };
        assert_eq!(info.name.as_deref(), Some("Marlin"));
        assert_eq!(info.machine_type.as_deref(), Some("Ender-3"));
        assert_eq!(info.capabilities.get("AUTOREPORT_TEMP"), Some(&true));
    }

    #[test]
    fn test_sd_listing_block() {
        let dispatcher = ResponseDispatcher::default();
        assert!(dispatcher.dispatch("Begin file list").is_empty());
        assert!(dispatcher.dispatch("PART.GCO 1024").is_empty());
        assert!(dispatcher.dispatch("X:1 TEST.GCO 5").is_empty());
        let events = dispatcher.dispatch("End file list");
        let Some(DispatchEvent::SdListing(files)) = events.first() else {
            panic!("expected listing, got {:?}", events);
        };
        assert_eq!(files.len(), 2);
        assert_eq!(dispatcher.sd_files()[0].size, Some(1024));
        assert!(dispatcher.position().is_none());
    }

    #[test]
    fn test_sd_progress_alongside_response() {
        let dispatcher = ResponseDispatcher::default();
        let events = dispatcher.dispatch("SD printing byte 250/1000");
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], DispatchEvent::SdProgress(_)));
        assert!((dispatcher.sd_progress().completion - 25.0).abs() < 1e-9);
    }
}
