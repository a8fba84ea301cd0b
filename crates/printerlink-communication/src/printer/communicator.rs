//! Printer communicator
//!
//! The facade owning the link state machine. It wires the transmission
//! controller to the response dispatcher, runs detection once per
//! connection, fans parsed events out to listeners and the broadcast
//! dispatcher, and offers the command and query surface.

use super::autoreport::{self, AutoReport, AUTO_REPORT_KINDS};
use super::commands;
use super::cooldown::{CoolingStatus, CoolingWatch};
use super::heartbeat::{Heartbeat, HeartbeatVerdict};
use super::phase::PhaseTracker;
use super::sd_card::{self, UploadReport};
use crate::communication::{
    EngineConfig, LinkMode, LinkObserver, LinkOpener, SerialOpener, TransmissionController,
};
use crate::firmware::{
    create_handler, detect_capabilities, PrinterCapabilities, PrinterDetector, PrinterTypeInfo,
};
use crate::protocol::{DispatchEvent, ResponseDispatcher};
use parking_lot::{Mutex, RwLock};
use printerlink_core::{
    thread_safe_rw_map, ConnectionError, EventDispatcher, FirmwareError, FirmwareInfo, LinkState, PhaseSnapshot,
    PositionSample, PrintPhase, PrinterEvent, PrinterListener, PrinterListenerHandle,
    PrinterStatus, ProtocolError, Result, SdFile, SdProgress, TelemetryKind, TemperatureSample,
    ThreadSafeRwMap,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::BufRead;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Queued once the link is up
pub const CONNECT_COMMANDS: &[&str] = &["M115", "M503", "M105", "M114"];

/// Port value asking for automatic selection
pub const AUTO_PORT: &str = "Auto";

/// Bound on one auto-report probe exchange
const PROBE_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// SD print progress with formatted estimates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintProgress {
    /// Raw SD progress
    pub sd: SdProgress,
    /// Remaining time as `HH:MM:SS`, `--:--:--` when unknown
    pub eta: String,
    /// Current print phase
    pub phase: PhaseSnapshot,
}

struct StateSlot {
    state: LinkState,
    error: Option<String>,
}

/// State shared between the facade, the collector thread and helper threads
struct EngineCore {
    config: EngineConfig,
    dispatcher: ResponseDispatcher,
    state: RwLock<StateSlot>,
    listeners: ThreadSafeRwMap<String, Arc<dyn PrinterListener>>,
    events: EventDispatcher,
    phase: Mutex<PhaseTracker>,
    heartbeat: Mutex<Heartbeat>,
    autoreport: Mutex<AutoReport>,
    detector: Mutex<PrinterDetector>,
    link: RwLock<Option<(String, u32)>>,
    last_ack: Mutex<Option<String>>,
}

impl EngineCore {
    fn new(config: EngineConfig) -> Self {
        Self {
            dispatcher: ResponseDispatcher::new(config.eta_half_life_s),
            state: RwLock::new(StateSlot {
                state: LinkState::Disconnected,
                error: None,
            }),
            listeners: thread_safe_rw_map(),
            events: EventDispatcher::default(),
            phase: Mutex::new(PhaseTracker::new(config.first_layer_height)),
            heartbeat: Mutex::new(Heartbeat::new(config.max_consecutive_timeouts)),
            autoreport: Mutex::new(AutoReport::new(config.rearm_cooldown)),
            detector: Mutex::new(PrinterDetector::new()),
            link: RwLock::new(None),
            last_ack: Mutex::new(None),
            config,
        }
    }

    fn state(&self) -> LinkState {
        self.state.read().state
    }

    fn status(&self) -> PrinterStatus {
        let slot = self.state.read();
        PrinterStatus::new(slot.state, slot.error.clone())
    }

    /// Move to `target`; false when the transition is not allowed
    fn transition(&self, target: LinkState, error: Option<String>) -> bool {
        let (old, status) = {
            let mut slot = self.state.write();
            let old = slot.state;
            if !old.can_transition_to(target) {
                tracing::warn!("Rejected state change {} -> {}", old, target);
                return false;
            }
            if old == target && error.is_none() {
                return true;
            }
            slot.state = target;
            slot.error = if target == LinkState::Error { error } else { None };
            (old, PrinterStatus::new(slot.state, slot.error.clone()))
        };

        if old != target {
            tracing::info!("State {} -> {}", old, target);
            self.events.publish(PrinterEvent::StateChanged { old, new: target });
        }
        self.notify(|l| l.on_state_change(&status));
        true
    }

    fn fail(&self, message: &str) {
        tracing::error!("{}", message);
        if self.state() != LinkState::Disconnected {
            self.transition(LinkState::Error, Some(message.to_string()));
        }
        self.notify(|l| l.on_error(message));
        self.events.publish(PrinterEvent::Error(message.to_string()));
    }

    /// Call every listener; a panicking listener does not affect the others
    fn notify<F>(&self, call: F)
    where
        F: Fn(&dyn PrinterListener),
    {
        let listeners: Vec<_> = self.listeners.read().values().cloned().collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))).is_err() {
                tracing::error!("Printer listener panicked");
            }
        }
    }

    fn handle_event(&self, event: DispatchEvent) {
        match event {
            DispatchEvent::Temperature(sample) => {
                self.notify(|l| l.on_temperature_update(&sample));
                self.events.publish(PrinterEvent::Temperature(sample));
            }
            DispatchEvent::Position(position) => {
                self.notify(|l| l.on_position_update(&position));
                self.events.publish(PrinterEvent::Position(position));
            }
            DispatchEvent::Firmware(info) => {
                tracing::debug!("Firmware info: {:?} {:?}", info.name, info.version);
            }
            DispatchEvent::SdListing(files) => {
                tracing::debug!("SD listing with {} files", files.len());
            }
            DispatchEvent::DeviceError(line) => self.fail(&line),
            DispatchEvent::Response(line) => {
                self.notify(|l| l.on_response(&line));
                self.events.publish(PrinterEvent::Response(line));
            }
            DispatchEvent::SdProgress(progress) => {
                self.on_sd_progress(&progress);
                self.events.publish(PrinterEvent::SdProgress(progress));
            }
        }
    }

    fn on_sd_progress(&self, progress: &SdProgress) {
        match self.state() {
            LinkState::Printing if progress.is_complete() => {
                if self.transition(LinkState::Finishing, None) {
                    self.phase.lock().set(PrintPhase::Finishing);
                }
            }
            LinkState::Printing | LinkState::Finishing if !progress.active => {
                if self.transition(LinkState::Operational, None) {
                    self.phase.lock().set(PrintPhase::Idle);
                }
            }
            _ => {}
        }
    }
}

impl LinkObserver for EngineCore {
    fn on_line(&self, line: &str) {
        if line.to_lowercase().starts_with("ok") {
            *self.last_ack.lock() = Some(line.to_string());
            self.heartbeat.lock().record_success();
        }
        for event in self.dispatcher.dispatch(line) {
            self.handle_event(event);
        }
    }

    fn on_transmit(&self, line: &str) {
        self.phase.lock().on_transmit(line);
    }

    fn on_link_failure(&self, reason: &str) {
        let message = ConnectionError::ConnectionLost {
            reason: reason.to_string(),
        }
        .to_string();
        self.fail(&message);
    }
}

/// Cancellable helper thread
struct Task {
    cancel: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Task {
    /// Run `work` after `delay` unless cancelled first
    fn delayed<F>(name: &str, delay: Duration, work: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(name, move |cancel| {
            if let Err(RecvTimeoutError::Timeout) = cancel.recv_timeout(delay) {
                work();
            }
        })
    }

    /// Run `work` with a receiver that disconnects on cancel
    fn spawn<F>(name: &str, work: F) -> Result<Self>
    where
        F: FnOnce(mpsc::Receiver<()>) + Send + 'static,
    {
        let (cancel, cancelled) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || work(cancelled))?;
        Ok(Self { cancel, handle })
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn cancel(self) {
        drop(self.cancel);
        if self.handle.thread().id() == thread::current().id() {
            return;
        }
        if self.handle.join().is_err() {
            tracing::error!("Helper thread panicked");
        }
    }
}

/// Serial protocol engine for one printer
pub struct PrinterCommunicator {
    core: Arc<EngineCore>,
    controller: Arc<TransmissionController>,
    detection: Mutex<Option<Task>>,
    cooling: Mutex<Option<Task>>,
    reconnect: Mutex<Option<Task>>,
}

impl PrinterCommunicator {
    /// Communicator on real serial ports
    pub fn new(config: EngineConfig) -> Self {
        Self::with_opener(config, Arc::new(SerialOpener))
    }

    /// Communicator opening links through `opener`
    pub fn with_opener(config: EngineConfig, opener: Arc<dyn LinkOpener>) -> Self {
        let core = Arc::new(EngineCore::new(config));
        let controller = Arc::new(TransmissionController::new(
            core.config.controller.clone(),
            opener,
            core.clone(),
        ));
        Self {
            core,
            controller,
            detection: Mutex::new(None),
            cooling: Mutex::new(None),
            reconnect: Mutex::new(None),
        }
    }

    /// Engine settings
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    // ---- listeners -------------------------------------------------------

    /// Register a listener
    pub fn add_listener(&self, listener: Arc<dyn PrinterListener>) -> PrinterListenerHandle {
        let handle = PrinterListenerHandle::new();
        self.core
            .listeners
            .write()
            .insert(handle.0.clone(), listener);
        tracing::debug!("Registered printer listener {}", handle.0);
        handle
    }

    /// Unregister a listener; false when the handle is unknown
    pub fn remove_listener(&self, handle: &PrinterListenerHandle) -> bool {
        self.core.listeners.write().remove(&handle.0).is_some()
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.core.listeners.read().len()
    }

    /// Subscribe to the broadcast event stream
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PrinterEvent> {
        self.core.events.subscribe()
    }

    // ---- lifecycle -------------------------------------------------------

    /// Open the link and start detection
    ///
    /// `port` defaults to the configured port; "Auto" tries every candidate
    /// port in turn. `baud` defaults to the configured baud rate.
    pub fn connect(&self, port: Option<&str>, baud: Option<u32>) -> Result<()> {
        self.stop_tasks();
        if self.controller.is_connected() {
            self.controller.disconnect();
        }
        self.core.transition(LinkState::Disconnected, None);

        self.core.dispatcher.reset();
        *self.core.detector.lock() = PrinterDetector::new();
        self.core.heartbeat.lock().reset();
        self.core.autoreport.lock().clear();
        *self.core.phase.lock() = PhaseTracker::new(self.core.config.first_layer_height);

        let requested = port.unwrap_or(&self.core.config.port).trim().to_string();
        let baud = baud.unwrap_or(self.core.config.controller.baud_rate);
        let candidates = if requested.is_empty() || requested.eq_ignore_ascii_case(AUTO_PORT) {
            let ports = self.controller.candidate_ports();
            if ports.is_empty() {
                let err = ConnectionError::PortNotFound {
                    port: AUTO_PORT.to_string(),
                };
                self.core.fail(&err.to_string());
                return Err(err.into());
            }
            ports
        } else {
            vec![requested]
        };

        let mut last_error = None;
        for candidate in candidates {
            match open_link(&self.core, &self.controller, &candidate, baud) {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    tracing::warn!("Could not connect on {}: {}", candidate, e);
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            self.core.fail(&e.to_string());
            return Err(e);
        }

        let core = self.core.clone();
        let controller = self.controller.clone();
        let task = Task::delayed("printerlink-detect", self.core.config.detection_delay, move || {
            run_detection(&core, &controller)
        })?;
        *self.detection.lock() = Some(task);
        Ok(())
    }

    /// Stop everything and release the link
    pub fn disconnect(&self) {
        self.stop_tasks();
        self.controller.disconnect();
        *self.core.link.write() = None;
        self.core.transition(LinkState::Disconnected, None);
    }

    fn stop_tasks(&self) {
        for slot in [&self.reconnect, &self.detection, &self.cooling] {
            let task = slot.lock().take();
            if let Some(task) = task {
                task.cancel();
            }
        }
    }

    /// Link open and healthy
    pub fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    /// Delivery mode of the open link
    pub fn link_mode(&self) -> Option<LinkMode> {
        self.controller.mode()
    }

    /// Port of the open link
    pub fn port(&self) -> Option<String> {
        self.controller.port()
    }

    /// Bounded recovery from the Error state
    ///
    /// Reopens the link when it failed, then sends an M105 probe; returns to
    /// Operational when the probe is acknowledged.
    pub fn recover(&self) -> Result<bool> {
        if !self.controller.is_connected() {
            let link = self.core.link.read().clone();
            let Some((port, baud)) = link else {
                return Err(ConnectionError::NotConnected.into());
            };
            open_link(&self.core, &self.controller, &port, baud)?;
        }

        let probe = self.core.config.probe_timeout;
        let acked = match self.controller.mode() {
            Some(LinkMode::Fallback) => self.controller.transact("M105", probe)?.is_some(),
            _ => {
                let id = self.controller.enqueue_tracked("M105", false, true)?;
                self.controller.wait_ack(id, probe)
            }
        };
        if acked {
            self.core.heartbeat.lock().record_success();
            if self.core.state() == LinkState::Error {
                self.core.transition(LinkState::Operational, None);
            }
            tracing::info!("Recovery probe acknowledged");
        } else {
            tracing::warn!("Recovery probe got no reply within {:?}", probe);
        }
        Ok(acked)
    }

    // ---- commands --------------------------------------------------------

    /// Queue a line; `priority` puts it ahead of everything not yet sent
    pub fn send_command(&self, line: &str, priority: bool) -> Result<u64> {
        self.controller.enqueue(line, false, priority)
    }

    /// Send a line and wait for its acknowledgement
    ///
    /// For M105 and M114 the most recent temperature or position line is
    /// returned instead of the bare ack. Returns `Ok(None)` on timeout.
    pub fn send_command_and_wait(&self, line: &str, timeout: Duration) -> Result<Option<String>> {
        let line = line.trim();
        let reply = match self.controller.mode() {
            Some(LinkMode::Fallback) => self.controller.transact(line, timeout)?,
            _ => {
                let id = self.controller.enqueue_tracked(line, false, false)?;
                if self.controller.wait_ack(id, timeout) {
                    let command = line
                        .split_whitespace()
                        .next()
                        .unwrap_or_default()
                        .to_uppercase();
                    let cached = match command.as_str() {
                        "M105" => self.core.dispatcher.last_temperature_line(),
                        "M114" => self.core.dispatcher.last_position_line(),
                        _ => None,
                    };
                    cached
                        .or_else(|| self.core.last_ack.lock().clone())
                        .or_else(|| Some("ok".to_string()))
                } else {
                    None
                }
            }
        };

        match reply {
            Some(reply) => {
                self.core.heartbeat.lock().record_success();
                Ok(Some(reply))
            }
            None => {
                tracing::debug!("No reply to {} within {:?}", line, timeout);
                self.on_wait_timeout();
                Ok(None)
            }
        }
    }

    fn on_wait_timeout(&self) {
        let verdict = self.core.heartbeat.lock().record_timeout();
        if verdict != HeartbeatVerdict::Reconnect {
            return;
        }
        self.core.fail("Heartbeat lost: no reply to consecutive commands");

        let link = self.core.link.read().clone();
        let Some((port, baud)) = link else {
            return;
        };
        let mut slot = self.reconnect.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        if let Some(done) = slot.take() {
            done.cancel();
        }

        let core = self.core.clone();
        let controller = self.controller.clone();
        let spawned = Task::spawn("printerlink-reconnect", move |cancelled| {
            let is_cancelled =
                || matches!(cancelled.try_recv(), Err(TryRecvError::Disconnected));
            tracing::warn!("Reconnecting to {}", port);
            controller.disconnect();
            if is_cancelled() {
                return;
            }
            if let Err(e) = open_link(&core, &controller, &port, baud) {
                core.fail(&format!("Reconnect failed: {}", e));
                return;
            }
            if is_cancelled() {
                controller.disconnect();
            }
        });
        match spawned {
            Ok(task) => *slot = Some(task),
            Err(e) => tracing::error!("Could not start reconnect: {}", e),
        }
    }

    /// Consecutive wait timeouts counted by the heartbeat
    pub fn consecutive_timeouts(&self) -> u32 {
        self.core.heartbeat.lock().consecutive_timeouts()
    }

    /// Home all axes, or the given ones ("X Y")
    pub fn home_axes(&self, axes: &str) -> Result<u64> {
        self.send_command(&commands::home_axes(axes), false)
    }

    /// Set a heater; tool -1 is the bed
    pub fn set_temperature(&self, tool: i32, celsius: f64) -> Result<u64> {
        self.send_command(&commands::set_temperature(tool, celsius), false)
    }

    /// Linear move with the given words
    pub fn move_axis(
        &self,
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        e: Option<f64>,
        feedrate: Option<f64>,
    ) -> Result<u64> {
        self.send_command(&commands::move_axis(x, y, z, e, feedrate), false)
    }

    /// M112 ahead of everything else; pending lines are dropped
    ///
    /// A barrier still waiting for its ack is released so M112 goes out at once.
    pub fn emergency_stop(&self) -> Result<u64> {
        self.controller.clear_queue();
        let id = self
            .controller
            .enqueue(commands::EMERGENCY_STOP, true, true)?;
        self.controller.interrupt();
        self.core.fail("Emergency stop");
        Ok(id)
    }

    /// Drop lines not yet sent
    pub fn clear_command_queue(&self) -> usize {
        self.controller.clear_queue()
    }

    /// Lines waiting to be sent
    pub fn queue_len(&self) -> usize {
        self.controller.queue_len()
    }

    /// Lines sent but not yet acknowledged
    pub fn in_flight(&self) -> usize {
        self.controller.in_flight()
    }

    /// Abort the host-driven job: park, cool down, then return to Operational
    pub fn cancel_print(&self) -> Result<()> {
        self.require_transition(LinkState::Cancelling, "cancel_print")?;
        self.controller.clear_queue();
        for line in commands::CANCEL_SEQUENCE {
            self.controller.enqueue(line, false, false)?;
        }
        self.core.transition(LinkState::Cancelling, None);
        self.core.dispatcher.reset_sd_progress();
        self.start_cooling_watch()
    }

    fn start_cooling_watch(&self) -> Result<()> {
        let cooling = self.cooling.lock().take();
        if let Some(task) = cooling {
            task.cancel();
        }

        let core = self.core.clone();
        let controller = self.controller.clone();
        let task = Task::spawn("printerlink-cooling", move |cancelled| {
            let config = core.config.cooling.clone();
            tracing::info!(
                "Cooling down (hot end <= {:.0}C, bed <= {:.0}C)",
                config.hotend_c,
                config.bed_c
            );
            let mut watch = CoolingWatch::new(config, Instant::now());
            loop {
                let polled = core.autoreport.lock().is_supported(TelemetryKind::Temperature);
                if polled != Some(true) && controller.is_connected() {
                    if let Err(e) = controller.enqueue("M105", false, false) {
                        tracing::warn!("Could not queue cooling poll: {}", e);
                    }
                }
                match cancelled.recv_timeout(watch.config().check_interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => return,
                }
                let sample = core.dispatcher.temperature();
                match watch.check(sample.as_ref(), Instant::now()) {
                    CoolingStatus::Cooling => {}
                    CoolingStatus::Cooled => {
                        tracing::info!("Cooling finished");
                        break;
                    }
                    CoolingStatus::TimedOut => {
                        tracing::warn!("Cooling did not finish in time");
                        break;
                    }
                }
            }
            if core.state() == LinkState::Cancelling {
                core.transition(LinkState::Operational, None);
                core.phase.lock().set(PrintPhase::Idle);
            }
        })?;
        *self.cooling.lock() = Some(task);
        Ok(())
    }

    /// Pause the SD print
    pub fn pause_print(&self) -> Result<()> {
        self.require_transition(LinkState::Paused, "pause_print")?;
        self.send_command("M25", false)?;
        self.core.transition(LinkState::Paused, None);
        Ok(())
    }

    /// Resume the SD print
    pub fn resume_print(&self) -> Result<()> {
        self.require_transition(LinkState::Printing, "resume_print")?;
        self.send_command("M24", false)?;
        self.core.transition(LinkState::Printing, None);
        Ok(())
    }

    fn require_transition(&self, target: LinkState, operation: &str) -> Result<()> {
        let state = self.core.state();
        if !self.controller.is_connected() {
            return Err(ConnectionError::NotConnected.into());
        }
        if state == target || !state.can_transition_to(target) {
            return Err(ProtocolError::InvalidState {
                operation: operation.to_string(),
                state: state.to_string(),
            }
            .into());
        }
        Ok(())
    }

    // ---- SD card -----------------------------------------------------------

    /// Request the SD listing and return the parsed files
    pub fn sd_list(&self, timeout: Duration) -> Result<Vec<SdFile>> {
        self.send_command_and_wait("M20", timeout)?;
        Ok(self.core.dispatcher.sd_files())
    }

    /// Files of the last SD listing
    pub fn sd_files(&self) -> Vec<SdFile> {
        self.core.dispatcher.sd_files()
    }

    /// Select `name` and start printing it
    pub fn sd_print(&self, name: &str) -> Result<()> {
        self.require_transition(LinkState::Printing, "sd_print")?;
        self.core.dispatcher.reset_sd_progress();
        self.send_command(&commands::sd_select(name), false)?;
        self.send_command("M24", false)?;
        self.core.transition(LinkState::Printing, None);
        self.core.phase.lock().set(PrintPhase::Initializing);
        Ok(())
    }

    /// Pause the SD print
    pub fn sd_pause(&self) -> Result<()> {
        self.pause_print()
    }

    /// Resume the SD print
    pub fn sd_resume(&self) -> Result<()> {
        self.resume_print()
    }

    /// Stop the SD print, rewind and remount the card
    pub fn sd_cancel(&self) -> Result<()> {
        for line in commands::SD_CANCEL_SEQUENCE {
            self.send_command(line, false)?;
        }
        self.core.dispatcher.reset_sd_progress();
        if matches!(
            self.core.state(),
            LinkState::Printing | LinkState::Paused | LinkState::Finishing
        ) {
            self.core.transition(LinkState::Operational, None);
        }
        self.core.phase.lock().set(PrintPhase::Idle);
        Ok(())
    }

    /// Queue the status queries of the detected handler
    ///
    /// Returns the ids of the queued lines.
    pub fn poll_status(&self) -> Result<Vec<u64>> {
        let handler = self
            .core
            .dispatcher
            .handler()
            .ok_or(FirmwareError::NotDetected)?;
        handler
            .status_commands()
            .iter()
            .map(|line| self.send_command(line, false))
            .collect()
    }

    /// Ask for an SD status report
    pub fn poll_sd_status(&self) -> Result<u64> {
        self.send_command("M27", false)
    }

    /// Upload G-code to the SD card as `name`
    ///
    /// Auto-reports are switched off for the transfer and re-enabled
    /// afterwards for every kind the device supports.
    pub fn sd_upload<R: BufRead>(&self, name: &str, source: R) -> Result<UploadReport> {
        let state = self.core.state();
        if state != LinkState::Operational {
            return Err(ProtocolError::InvalidState {
                operation: "sd_upload".to_string(),
                state: state.to_string(),
            }
            .into());
        }
        let result = sd_card::upload(&self.controller, name, source, &self.core.config.upload);

        let supported = self.core.autoreport.lock().support();
        for kind in AUTO_REPORT_KINDS {
            if supported.get(&kind) == Some(&true) {
                let command = autoreport::enable_command(kind);
                if let Err(e) = self.controller.enqueue(command, false, false) {
                    tracing::warn!("Could not re-enable {} auto-report: {}", kind, e);
                }
            }
        }
        result
    }

    // ---- telemetry -------------------------------------------------------

    /// Probe which auto-reports the device supports
    pub fn probe_autoreport(&self) -> Result<HashMap<TelemetryKind, bool>> {
        for kind in AUTO_REPORT_KINDS {
            let lines =
                autoreport::exchange(&self.controller, autoreport::enable_command(kind), PROBE_EXCHANGE_TIMEOUT)?;
            let supported = autoreport::reply_accepts(&lines);
            self.core.autoreport.lock().record(kind, supported);
        }
        self.controller.sync_observer(self.core.config.controller.ack_timeout);
        Ok(self.core.autoreport.lock().support())
    }

    /// Probe outcome for `kind`, `None` before probing
    pub fn autoreport_supported(&self, kind: TelemetryKind) -> Option<bool> {
        self.core.autoreport.lock().is_supported(kind)
    }

    /// Re-send the auto-report enable command for `kind`
    ///
    /// Returns false while the cooldown runs or when the device does not
    /// support auto-reporting `kind`.
    pub fn rearm_autoreport(&self, kind: TelemetryKind) -> Result<bool> {
        if !self.core.autoreport.lock().try_rearm(kind, Instant::now()) {
            return Ok(false);
        }
        tracing::debug!("Re-arming {} auto-report", kind);
        self.controller
            .enqueue(autoreport::disable_command(kind), false, false)?;
        self.controller
            .enqueue(autoreport::enable_command(kind), false, false)?;
        Ok(true)
    }

    /// Age of the newest sample of `kind`
    pub fn time_since_last(&self, kind: TelemetryKind) -> Option<Duration> {
        self.core.dispatcher.time_since_last(kind)
    }

    /// True when no sample of `kind` arrived within its stale threshold
    pub fn is_stale(&self, kind: TelemetryKind) -> bool {
        let threshold = match kind {
            TelemetryKind::Temperature => self.core.config.temp_stale,
            TelemetryKind::Position => self.core.config.position_stale,
            TelemetryKind::SdStatus => self.core.config.temp_stale,
        };
        self.time_since_last(kind)
            .map(|age| age > threshold)
            .unwrap_or(true)
    }

    /// Temperatures, queried with M105 unless the cache is fresh
    pub fn get_temperature(&self) -> Option<TemperatureSample> {
        self.refresh(TelemetryKind::Temperature, "M105");
        self.core.dispatcher.temperature()
    }

    /// Position, queried with M114 unless the cache is fresh
    pub fn get_position(&self) -> Option<PositionSample> {
        self.refresh(TelemetryKind::Position, "M114");
        self.core.dispatcher.position()
    }

    fn refresh(&self, kind: TelemetryKind, query: &str) {
        let fresh = self
            .time_since_last(kind)
            .map(|age| age < self.core.config.cache_fresh)
            .unwrap_or(false);
        if fresh || !self.controller.is_connected() {
            return;
        }
        if let Err(e) = self.send_command_and_wait(query, self.core.config.probe_timeout) {
            tracing::debug!("{} refresh failed: {}", query, e);
        }
    }

    // ---- queries ---------------------------------------------------------

    /// Current state snapshot
    pub fn get_printer_status(&self) -> PrinterStatus {
        self.core.status()
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        self.core.state()
    }

    /// Cached temperatures without a round trip
    pub fn get_temperature_info(&self) -> Option<TemperatureSample> {
        self.core.dispatcher.temperature()
    }

    /// Detected printer and firmware
    pub fn get_printer_type_info(&self) -> PrinterTypeInfo {
        let firmware = self.core.dispatcher.firmware_info();
        let handler = self.core.dispatcher.handler();
        PrinterTypeInfo {
            printer_type: handler
                .as_ref()
                .map(|h| h.printer_type().to_string())
                .unwrap_or_default(),
            firmware_type: handler
                .as_ref()
                .map(|h| h.firmware_type().to_string())
                .unwrap_or_default(),
            firmware_name: firmware.name.unwrap_or_default(),
            firmware_version: firmware.version.unwrap_or_default(),
        }
    }

    /// Capabilities of the active handler
    pub fn get_capabilities(&self) -> Result<PrinterCapabilities> {
        self.core
            .dispatcher
            .handler()
            .map(|h| h.capabilities().clone())
            .ok_or_else(|| FirmwareError::NotDetected.into())
    }

    /// Firmware identification from M115 and the banner
    pub fn get_firmware_info(&self) -> FirmwareInfo {
        self.core.dispatcher.firmware_info()
    }

    /// Current print phase
    pub fn get_phase_snapshot(&self) -> PhaseSnapshot {
        let snapshot = self.core.phase.lock().snapshot();
        if self.core.state() == LinkState::Finishing && snapshot.phase != PrintPhase::Finishing {
            return PhaseSnapshot {
                phase: PrintPhase::Finishing,
                since: snapshot.since,
            };
        }
        snapshot
    }

    /// SD progress with the ETA
    pub fn get_print_progress(&self) -> PrintProgress {
        PrintProgress {
            sd: self.core.dispatcher.sd_progress(),
            eta: self.core.dispatcher.sd_eta_string(),
            phase: self.get_phase_snapshot(),
        }
    }
}

impl Drop for PrinterCommunicator {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Open the link on `port` and queue the connect commands
fn open_link(
    core: &EngineCore,
    controller: &TransmissionController,
    port: &str,
    baud: u32,
) -> Result<()> {
    core.transition(LinkState::Connecting, None);
    if let Err(e) = controller.connect(port, baud) {
        core.transition(LinkState::Error, Some(e.to_string()));
        return Err(e);
    }
    *core.link.write() = Some((port.to_string(), baud));
    if !core.transition(LinkState::Operational, None) {
        controller.disconnect();
        return Err(ConnectionError::ConnectionLost {
            reason: format!("link state changed to {} while connecting", core.state()),
        }
        .into());
    }
    core.phase.lock().set(PrintPhase::Initializing);

    for line in CONNECT_COMMANDS {
        controller.enqueue(line, false, false)?;
    }
    Ok(())
}

/// Classify the printer from the banner and install its handler
fn run_detection(core: &EngineCore, controller: &TransmissionController) {
    let lines = core.dispatcher.banner_lines();
    let Some(result) = core.detector.lock().detect_once(&lines) else {
        return;
    };

    let mut handler = create_handler(result.printer_type, result.firmware_type);
    handler.merge_capabilities(&detect_capabilities(result.firmware_type, &lines));
    tracing::info!(
        "Detected {} printer on {} firmware, using {} handler",
        result.printer_type,
        result.firmware_type,
        handler.kind()
    );

    for line in handler.init_commands() {
        if CONNECT_COMMANDS.contains(line) {
            continue;
        }
        if let Err(e) = controller.enqueue(line, false, false) {
            tracing::warn!("Could not queue init command {}: {}", line, e);
        }
    }
    core.dispatcher.set_handler(handler);
    core.events.publish(PrinterEvent::Detected {
        printer_type: result.printer_type.to_string(),
        firmware: result.firmware_type.to_string(),
    });
}
