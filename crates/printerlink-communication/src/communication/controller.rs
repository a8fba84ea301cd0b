//! Transmission controller
//!
//! Owns the physical link and delivers queued lines in submission order.
//!
//! Primary mode splits the port into independent read and write handles and
//! runs a sender and a receiver thread. At most `window_size` lines are
//! unacknowledged at once, and barrier lines go out on an empty window and
//! hold everything behind them until acked.
//!
//! Fallback mode keeps a single handle shared under one lock and a window of
//! one, so exactly one line is in flight. Synchronous queries use
//! [`TransmissionController::transact`].
//!
//! Received lines, acks and failures travel to a collector thread over an
//! mpsc channel; the collector calls the [`LinkObserver`] and then signals
//! the [`AckTable`], so the line carrying a reply is always observed before
//! the waiter on its ack wakes up.

use super::ack::AckTable;
use super::queue::{OutboundMessage, SendQueue};
use super::serial::{is_idle_error, LineBuffer, LinkOpener, SerialLink};
use super::session::LinkSession;
use super::window::{FlowWindow, WindowWait};
use super::{is_barrier, ControllerConfig};
use parking_lot::{Mutex, MutexGuard, RwLock};
use printerlink_core::{ConnectionError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Poll interval of the worker loops
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sleep of a paused receiver
const PAUSE_POLL: Duration = Duration::from_millis(5);

/// Shared handle on one half of the link
pub(crate) type LinkHandle = Arc<Mutex<Box<dyn SerialLink>>>;

/// How lines are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Independent sender and receiver with a credit window
    Primary,
    /// One shared handle, one line in flight
    Fallback,
}

impl std::fmt::Display for LinkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Events from the worker threads to the collector
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A received line
    Line(String),
    /// The message with this id was acknowledged
    Ack(u64),
    /// The device reported an error or alarm
    DeviceError(String),
    /// A line was written to the device
    Transmitted(String),
    /// The link failed; the controller stops
    LinkFailed(String),
    /// Signal this ack id once every earlier event was handled
    Flush(u64),
    /// Stop the collector
    Shutdown,
}

/// Receives link activity on the collector thread
///
/// Callbacks must not block on acks: acks are published by the same thread
/// after the callback returns.
pub trait LinkObserver: Send + Sync {
    /// A line was received
    fn on_line(&self, line: &str);

    /// A queued line was written
    fn on_transmit(&self, _line: &str) {}

    /// The receiver classified a line as an error or alarm
    fn on_device_error(&self, _line: &str) {}

    /// Reading or writing failed
    fn on_link_failure(&self, reason: &str);
}

struct LinkHalves {
    reader: LinkHandle,
    writer: LinkHandle,
    mode: LinkMode,
    port: String,
}

struct Workers {
    sender: JoinHandle<()>,
    receiver: JoinHandle<()>,
    collector: JoinHandle<()>,
    events: UnboundedSender<LinkEvent>,
}

/// State shared between the controller, its threads and sessions
pub(crate) struct Shared {
    pub(crate) config: ControllerConfig,
    pub(crate) queue: SendQueue,
    pub(crate) window: FlowWindow,
    pub(crate) acks: AckTable,
    pub(crate) running: AtomicBool,
    pub(crate) failed: AtomicBool,
    pub(crate) tx_inhibit: AtomicBool,
    pub(crate) rx_paused: AtomicBool,
    /// Set to release a sender held by a barrier
    interrupt: AtomicBool,
    /// Held by the sender for one message, or by a session
    pub(crate) send_gate: Mutex<()>,
    /// Held by the receiver for one read, or by a session
    pub(crate) rx_gate: Mutex<()>,
    next_id: AtomicU64,
    link: RwLock<Option<LinkHalves>>,
    events: RwLock<Option<UnboundedSender<LinkEvent>>>,
}

impl Shared {
    pub(crate) fn emit(&self, event: LinkEvent) {
        if let Some(events) = self.events.read().as_ref() {
            let _ = events.send(event);
        }
    }

    pub(crate) fn halves(&self) -> Option<(LinkHandle, LinkHandle, LinkMode)> {
        self.link
            .read()
            .as_ref()
            .map(|h| (h.reader.clone(), h.writer.clone(), h.mode))
    }
}

/// Flow-controlled line transmitter over one serial link
pub struct TransmissionController {
    shared: Arc<Shared>,
    opener: Arc<dyn LinkOpener>,
    observer: Arc<dyn LinkObserver>,
    workers: Mutex<Option<Workers>>,
}

impl TransmissionController {
    /// Create a disconnected controller
    pub fn new(
        config: ControllerConfig,
        opener: Arc<dyn LinkOpener>,
        observer: Arc<dyn LinkObserver>,
    ) -> Self {
        let window = FlowWindow::new(config.window_size);
        Self {
            shared: Arc::new(Shared {
                config,
                queue: SendQueue::new(),
                window,
                acks: AckTable::new(),
                running: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                tx_inhibit: AtomicBool::new(false),
                rx_paused: AtomicBool::new(false),
                interrupt: AtomicBool::new(false),
                send_gate: Mutex::new(()),
                rx_gate: Mutex::new(()),
                next_id: AtomicU64::new(1),
                link: RwLock::new(None),
                events: RwLock::new(None),
            }),
            opener,
            observer,
            workers: Mutex::new(None),
        }
    }

    /// Controller settings
    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    /// Candidate ports of the opener, for automatic selection
    pub fn candidate_ports(&self) -> Vec<String> {
        self.opener.candidates()
    }

    /// Open `port`, reset the board and start the worker threads
    ///
    /// Blocks for the reset pulse and the settle delay.
    pub fn connect(&self, port: &str, baud: u32) -> Result<LinkMode> {
        if self.shared.running.load(Ordering::SeqCst) {
            self.disconnect();
        }

        let config = &self.shared.config;
        let mut link = self.opener.open(port, baud, config.timeouts)?;

        let io_err = |e: std::io::Error| ConnectionError::FailedToOpen {
            port: port.to_string(),
            reason: e.to_string(),
        };
        link.set_dtr(false).map_err(io_err)?;
        thread::sleep(config.reset_pulse);
        link.set_dtr(true).map_err(io_err)?;
        link.clear_buffers().map_err(io_err)?;
        thread::sleep(config.settle_delay);

        let split = if config.force_sync_mode {
            None
        } else {
            link.try_split()
        };
        let reader: LinkHandle = Arc::new(Mutex::new(link));
        let (writer, mode) = match split {
            Some(write_half) => (Arc::new(Mutex::new(write_half)) as LinkHandle, LinkMode::Primary),
            None => (reader.clone(), LinkMode::Fallback),
        };
        let capacity = match mode {
            LinkMode::Primary => config.window_size,
            LinkMode::Fallback => 1,
        };

        self.shared.window.reset(capacity);
        self.shared.queue.reopen();
        self.shared.acks.clear();
        self.shared.failed.store(false, Ordering::SeqCst);
        self.shared.tx_inhibit.store(false, Ordering::SeqCst);
        self.shared.rx_paused.store(false, Ordering::SeqCst);
        self.shared.interrupt.store(false, Ordering::SeqCst);
        *self.shared.link.write() = Some(LinkHalves {
            reader,
            writer,
            mode,
            port: port.to_string(),
        });

        let (events, inbox) = unbounded_channel();
        *self.shared.events.write() = Some(events.clone());
        self.shared.running.store(true, Ordering::SeqCst);

        let sender = {
            let shared = self.shared.clone();
            thread::Builder::new()
                .name("printerlink-tx".to_string())
                .spawn(move || sender_loop(shared))?
        };
        let receiver = {
            let shared = self.shared.clone();
            thread::Builder::new()
                .name("printerlink-rx".to_string())
                .spawn(move || receiver_loop(shared))?
        };
        let collector = {
            let shared = self.shared.clone();
            let observer = self.observer.clone();
            thread::Builder::new()
                .name("printerlink-events".to_string())
                .spawn(move || collector_loop(shared, observer, inbox))?
        };

        *self.workers.lock() = Some(Workers {
            sender,
            receiver,
            collector,
            events,
        });

        tracing::info!(
            "Connected to {} at {} baud ({} mode, window {})",
            port,
            baud,
            mode,
            capacity
        );
        Ok(mode)
    }

    /// Stop the worker threads and release the link
    ///
    /// Safe while the loops are active; each thread is joined with a bounded
    /// wait and left detached if it does not finish in time.
    pub fn disconnect(&self) {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        self.shared.window.close();
        self.shared.queue.close();

        let workers = self.workers.lock().take();
        if let Some(workers) = workers {
            let _ = workers.events.send(LinkEvent::Shutdown);
            let deadline = Instant::now() + self.shared.config.join_timeout;
            for (name, handle) in [
                ("sender", workers.sender),
                ("receiver", workers.receiver),
                ("collector", workers.collector),
            ] {
                join_bounded(name, handle, deadline);
            }
        }

        *self.shared.events.write() = None;
        *self.shared.link.write() = None;
        self.shared.acks.clear();
        if was_running {
            tracing::info!("Disconnected");
        }
    }

    /// Link open and worker threads healthy
    pub fn is_connected(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst) && !self.shared.failed.load(Ordering::SeqCst)
    }

    /// Delivery mode of the open link
    pub fn mode(&self) -> Option<LinkMode> {
        self.shared.link.read().as_ref().map(|h| h.mode)
    }

    /// Name of the open port
    pub fn port(&self) -> Option<String> {
        self.shared.link.read().as_ref().map(|h| h.port.clone())
    }

    /// Queue a line; never blocks
    ///
    /// Lines matching the barrier set are flagged automatically. `priority`
    /// puts the line ahead of everything not yet sent.
    pub fn enqueue(&self, line: &str, barrier: bool, priority: bool) -> Result<u64> {
        self.enqueue_inner(line, barrier, priority, false)
    }

    /// Queue a line and register an ack waiter before it can be sent
    pub fn enqueue_tracked(&self, line: &str, barrier: bool, priority: bool) -> Result<u64> {
        self.enqueue_inner(line, barrier, priority, true)
    }

    fn enqueue_inner(&self, line: &str, barrier: bool, priority: bool, track: bool) -> Result<u64> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected.into());
        }
        let line = line.trim();
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        if track {
            self.shared.acks.register(id);
        }
        let message = OutboundMessage {
            id,
            line: line.to_string(),
            barrier: barrier || is_barrier(line),
            enqueued_at: Instant::now(),
        };
        tracing::debug!(id, barrier = message.barrier, priority, "Queued {}", line);
        if priority {
            self.shared.queue.push_front(message);
        } else {
            self.shared.queue.push_back(message);
        }
        Ok(id)
    }

    /// Wait for the ack of `id`; false on timeout
    pub fn wait_ack(&self, id: u64, timeout: Duration) -> bool {
        self.shared.acks.wait(id, timeout)
    }

    /// Drop lines not yet sent
    pub fn clear_queue(&self) -> usize {
        let dropped = self.shared.queue.clear();
        if dropped > 0 {
            tracing::info!("Dropped {} queued lines", dropped);
        }
        dropped
    }

    /// Release a sender held by a barrier
    ///
    /// Unacked lines are dropped from the window and the next queued line
    /// goes out. The flag is consumed by the next barrier wait.
    pub fn interrupt(&self) {
        self.shared.interrupt.store(true, Ordering::SeqCst);
        tracing::warn!("Barrier wait interrupted");
    }

    /// Lines waiting in the software queue
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Lines written but not yet acked
    pub fn in_flight(&self) -> usize {
        self.shared.window.in_flight()
    }

    /// Credit window capacity
    pub fn window_capacity(&self) -> usize {
        self.shared.window.capacity()
    }

    /// Largest in-flight count since connect
    pub fn window_high_water(&self) -> usize {
        self.shared.window.high_water()
    }

    /// Take exclusive raw access to the link
    ///
    /// The sender stops after its current line, the window drains (bounded by
    /// `drain_timeout`) and the receiver pauses. Normal operation resumes when
    /// the session is dropped.
    pub fn exclusive_session(&self, drain_timeout: Duration) -> Result<LinkSession<'_>> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected.into());
        }
        LinkSession::begin(&self.shared, drain_timeout)
    }

    /// Write `line` and read until a reply recognizable for it arrives
    ///
    /// M105 waits for a temperature report, M114 for a position report and
    /// everything else for `ok`. Every line read is still dispatched. Returns
    /// the matching line, else the last line seen, else `None`.
    pub fn transact(&self, line: &str, timeout: Duration) -> Result<Option<String>> {
        let line = line.trim();
        let command = line
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_uppercase();
        let matches = |reply: &str| {
            let ok = reply.to_lowercase().starts_with("ok");
            match command.as_str() {
                "M105" => reply.contains("T:") || ok,
                "M114" => reply.contains("X:") || ok,
                _ => ok,
            }
        };

        let reply = {
            let mut session = self.exclusive_session(self.shared.config.ack_timeout)?;
            session.write_line(line)?;
            let deadline = Instant::now() + timeout;
            let mut last = None;
            let mut matched = None;
            while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
                match session.read_line(remaining)? {
                    Some(reply) if matches(&reply) => {
                        matched = Some(reply);
                        break;
                    }
                    Some(reply) => last = Some(reply),
                    None => break,
                }
            }
            if matched.is_none() {
                tracing::debug!("No matching reply to {} within {:?}", line, timeout);
            }
            matched.or(last)
        };

        self.sync_observer(self.shared.config.ack_timeout);
        Ok(reply)
    }

    /// Wait until the observer has handled every line received so far
    ///
    /// Must not be called from an observer callback.
    pub fn sync_observer(&self, timeout: Duration) -> bool {
        if !self.shared.running.load(Ordering::SeqCst) {
            return false;
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.acks.register(id);
        self.shared.emit(LinkEvent::Flush(id));
        self.shared.acks.wait(id, timeout)
    }
}

impl Drop for TransmissionController {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn join_bounded(name: &str, handle: JoinHandle<()>, deadline: Instant) {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!("{} thread did not stop in time, detaching", name);
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        tracing::error!("{} thread panicked", name);
    }
}

/// Wait for a free credit
///
/// Credits unacked for `ack_timeout` are reclaimed; their late acks are still
/// matched in order.
fn wait_credit(shared: &Shared) -> bool {
    loop {
        match shared.window.wait_for_credit(shared.config.ack_timeout) {
            WindowWait::Ready => return true,
            WindowWait::Closed => return false,
            WindowWait::TimedOut => {
                let stale = shared.window.reclaim_stale();
                tracing::warn!(
                    "No ack within {:?}, reclaiming {} stale credits",
                    shared.config.ack_timeout,
                    stale
                );
            }
        }
    }
}

/// Wait for an empty window on behalf of a barrier
///
/// Never reclaims: only an ack, a stop or an interrupt ends the wait.
fn wait_barrier(shared: &Shared, line: &str) -> bool {
    let started = Instant::now();
    let mut warned = false;
    loop {
        if !shared.running.load(Ordering::SeqCst) {
            return false;
        }
        if shared.interrupt.swap(false, Ordering::SeqCst) {
            let dropped = shared.window.reclaim_all();
            tracing::warn!(
                "Barrier {} interrupted, dropping {} unacked lines",
                line,
                dropped.len()
            );
            return true;
        }
        match shared.window.wait_for_drain(POLL_INTERVAL) {
            WindowWait::Ready => return true,
            WindowWait::Closed => return false,
            WindowWait::TimedOut => {
                if !warned && started.elapsed() >= shared.config.ack_timeout {
                    warned = true;
                    tracing::warn!(
                        "Barrier {} still waiting on {} unacked lines after {:?}",
                        line,
                        shared.window.in_flight(),
                        shared.config.ack_timeout
                    );
                }
            }
        }
    }
}

fn sender_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        if shared.tx_inhibit.load(Ordering::SeqCst) {
            thread::sleep(PAUSE_POLL);
            continue;
        }
        let Some(message) = shared.queue.pop_wait(POLL_INTERVAL) else {
            continue;
        };

        let gate = loop {
            if !shared.running.load(Ordering::SeqCst) {
                return;
            }
            if let Some(gate) = shared.send_gate.try_lock_for(POLL_INTERVAL) {
                break gate;
            }
        };
        // a session started between pop and gate
        if shared.tx_inhibit.load(Ordering::SeqCst) {
            shared.queue.push_front(message);
            MutexGuard::unlock_fair(gate);
            continue;
        }

        let sent = transmit(&shared, &message);
        MutexGuard::unlock_fair(gate);
        if !sent {
            return;
        }
    }
}

fn transmit(shared: &Shared, message: &OutboundMessage) -> bool {
    if message.barrier && !wait_barrier(shared, &message.line) {
        return false;
    }
    if !wait_credit(shared) || !shared.window.push(message.id) {
        return false;
    }

    let Some((_, writer, _)) = shared.halves() else {
        return false;
    };
    let written = {
        let mut link = writer.lock();
        let mut frame = Vec::with_capacity(message.line.len() + 1);
        frame.extend_from_slice(message.line.as_bytes());
        frame.push(b'\n');
        link.write_all(&frame).and_then(|_| link.flush())
    };

    if let Err(e) = written {
        tracing::error!("Write failed: {}", e);
        shared.failed.store(true, Ordering::SeqCst);
        shared.emit(LinkEvent::LinkFailed(
            ConnectionError::WriteFailed {
                reason: e.to_string(),
            }
            .to_string(),
        ));
        return false;
    }

    tracing::trace!("TX [{}]: {}", message.id, message.line);
    shared.emit(LinkEvent::Transmitted(message.line.clone()));

    if message.barrier {
        return wait_barrier(shared, &message.line);
    }
    true
}

fn receiver_loop(shared: Arc<Shared>) {
    let mut lines = LineBuffer::new();
    let mut buf = [0u8; 1024];

    while shared.running.load(Ordering::SeqCst) {
        if shared.rx_paused.load(Ordering::SeqCst) {
            thread::sleep(PAUSE_POLL);
            continue;
        }
        let Some(gate) = shared.rx_gate.try_lock_for(POLL_INTERVAL) else {
            continue;
        };
        if shared.rx_paused.load(Ordering::SeqCst) {
            MutexGuard::unlock_fair(gate);
            continue;
        }
        let Some((reader, _, _)) = shared.halves() else {
            MutexGuard::unlock_fair(gate);
            break;
        };

        let read = {
            let Some(mut link) = reader.try_lock_for(POLL_INTERVAL) else {
                MutexGuard::unlock_fair(gate);
                continue;
            };
            let read = link.read(&mut buf);
            MutexGuard::unlock_fair(link);
            read
        };
        MutexGuard::unlock_fair(gate);

        match read {
            Ok(0) => {}
            Ok(n) => {
                for line in lines.push(&buf[..n]) {
                    handle_received(&shared, line);
                }
            }
            Err(e) if is_idle_error(&e) => {}
            Err(e) => {
                if shared.running.load(Ordering::SeqCst) {
                    tracing::error!("Read failed: {}", e);
                    shared.failed.store(true, Ordering::SeqCst);
                    shared.emit(LinkEvent::LinkFailed(
                        ConnectionError::ReadFailed {
                            reason: e.to_string(),
                        }
                        .to_string(),
                    ));
                }
                break;
            }
        }
    }
}

fn handle_received(shared: &Shared, line: String) {
    tracing::trace!("RX: {}", line);
    let lower = line.to_lowercase();
    let is_ack = lower.starts_with("ok") || line.starts_with("start");
    let is_error = !is_ack
        && (lower.starts_with("error") || line.contains("!!") || lower.contains("alarm"));

    shared.emit(LinkEvent::Line(line.clone()));

    if is_ack {
        if let Some(id) = shared.window.pop_oldest() {
            shared.emit(LinkEvent::Ack(id));
        }
    } else if is_error {
        shared.emit(LinkEvent::DeviceError(line));
    }
}

fn collector_loop(
    shared: Arc<Shared>,
    observer: Arc<dyn LinkObserver>,
    mut inbox: UnboundedReceiver<LinkEvent>,
) {
    while let Some(event) = inbox.blocking_recv() {
        match event {
            LinkEvent::Line(line) => observer.on_line(&line),
            LinkEvent::Ack(id) => {
                shared.acks.publish(id);
            }
            LinkEvent::DeviceError(line) => observer.on_device_error(&line),
            LinkEvent::Transmitted(line) => observer.on_transmit(&line),
            LinkEvent::LinkFailed(reason) => observer.on_link_failure(&reason),
            LinkEvent::Flush(id) => {
                shared.acks.publish(id);
            }
            LinkEvent::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::mock::MockDevice;
    use crate::communication::serial::LinkTimeouts;

    struct Recorder {
        lines: Mutex<Vec<String>>,
        sent: Mutex<Vec<String>>,
        failures: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                lines: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
            })
        }
    }

    impl LinkObserver for Recorder {
        fn on_line(&self, line: &str) {
            self.lines.lock().push(line.to_string());
        }
        fn on_transmit(&self, line: &str) {
            self.sent.lock().push(line.to_string());
        }
        fn on_link_failure(&self, reason: &str) {
            self.failures.lock().push(reason.to_string());
        }
    }

    fn test_config(window_size: usize) -> ControllerConfig {
        ControllerConfig {
            baud_rate: 115200,
            timeouts: LinkTimeouts::default(),
            reset_pulse: Duration::ZERO,
            settle_delay: Duration::ZERO,
            force_sync_mode: false,
            window_size,
            ack_timeout: Duration::from_secs(2),
            join_timeout: Duration::from_secs(1),
        }
    }

    fn controller(device: &MockDevice, window: usize) -> (TransmissionController, Arc<Recorder>) {
        let recorder = Recorder::new();
        let controller = TransmissionController::new(
            test_config(window),
            Arc::new(device.clone()),
            recorder.clone(),
        );
        (controller, recorder)
    }

    #[test]
    fn test_connect_resets_board() {
        let device = MockDevice::marlin();
        let (controller, _) = controller(&device, 4);
        let mode = controller.connect("/dev/ttyMOCK0", 115200).unwrap();
        assert_eq!(mode, LinkMode::Primary);
        assert_eq!(device.dtr_history(), vec![false, true]);
        assert_eq!(device.clear_count(), 1);
        assert_eq!(controller.window_capacity(), 4);
        controller.disconnect();
        assert!(!controller.is_connected());
    }

    #[test]
    fn test_fallback_when_not_splittable() {
        let device = MockDevice::marlin();
        device.set_splittable(false);
        let (controller, _) = controller(&device, 8);
        assert_eq!(
            controller.connect("/dev/ttyMOCK0", 115200).unwrap(),
            LinkMode::Fallback
        );
        assert_eq!(controller.window_capacity(), 1);

        let id = controller.enqueue_tracked("G1 X10", false, false).unwrap();
        assert!(controller.wait_ack(id, Duration::from_secs(2)));
    }

    #[test]
    fn test_ack_after_reply_line() {
        let device = MockDevice::marlin();
        let (controller, recorder) = controller(&device, 4);
        controller.connect("/dev/ttyMOCK0", 115200).unwrap();

        let id = controller.enqueue_tracked("M114", false, false).unwrap();
        assert!(controller.wait_ack(id, Duration::from_secs(2)));
        let lines = recorder.lines.lock().clone();
        assert!(lines.iter().any(|l| l.starts_with("X:0.00")));
        assert_eq!(recorder.sent.lock().as_slice(), ["M114"]);
    }

    #[test]
    fn test_enqueue_requires_connection() {
        let device = MockDevice::marlin();
        let (controller, _) = controller(&device, 4);
        let err = controller.enqueue("M105", false, false).unwrap_err();
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_write_failure_reported() {
        let device = MockDevice::marlin();
        let (controller, recorder) = controller(&device, 4);
        controller.connect("/dev/ttyMOCK0", 115200).unwrap();
        device.set_fail_writes(true);
        controller.enqueue("M105", false, false).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while recorder.failures.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(recorder.failures.lock().len(), 1);
        assert!(!controller.is_connected());
    }

    #[test]
    fn test_transact_fallback_query() {
        let device = MockDevice::marlin();
        device.set_splittable(false);
        let (controller, recorder) = controller(&device, 4);
        controller.connect("/dev/ttyMOCK0", 115200).unwrap();

        let reply = controller
            .transact("M105", Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert!(reply.contains("T:"));

        let reply = controller
            .transact("M114", Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert!(reply.starts_with("X:"));

        thread::sleep(Duration::from_millis(100));
        assert!(recorder.lines.lock().iter().any(|l| l.starts_with("ok T:")));
    }

    #[test]
    fn test_transact_silent_device() {
        let device = MockDevice::new();
        let (controller, _) = controller(&device, 4);
        controller.connect("/dev/ttyMOCK0", 115200).unwrap();
        let reply = controller
            .transact("M105", Duration::from_millis(100))
            .unwrap();
        assert!(reply.is_none());
    }
}
