//! Exclusive raw access to the link
//!
//! While a session is alive the sender is parked behind its gate, the
//! in-flight window is empty and the receiver is paused, so every byte read
//! belongs to the session. Lines read are still forwarded to the observer.

use super::controller::{LinkEvent, LinkHandle, Shared};
use super::serial::{is_idle_error, LineBuffer};
use super::window::WindowWait;
use parking_lot::MutexGuard;
use printerlink_core::{ConnectionError, Result};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// Exclusive session on a connected link; normal operation resumes on drop
pub struct LinkSession<'a> {
    shared: &'a Shared,
    _send_gate: MutexGuard<'a, ()>,
    _rx_gate: Option<MutexGuard<'a, ()>>,
    reader: LinkHandle,
    writer: LinkHandle,
    lines: LineBuffer,
    pending: VecDeque<String>,
}

impl<'a> LinkSession<'a> {
    pub(crate) fn begin(shared: &'a Shared, drain_timeout: Duration) -> Result<Self> {
        shared.tx_inhibit.store(true, Ordering::SeqCst);

        let gate_timeout = drain_timeout + shared.config.ack_timeout;
        let Some(send_gate) = shared.send_gate.try_lock_for(gate_timeout) else {
            shared.tx_inhibit.store(false, Ordering::SeqCst);
            return Err(ConnectionError::Timeout {
                timeout_ms: gate_timeout.as_millis() as u64,
            }
            .into());
        };

        let drained = shared.window.wait_for_drain(drain_timeout) != WindowWait::TimedOut;
        if !drained || shared.window.reclaimed() > 0 {
            let stale = shared.window.reclaim_all();
            tracing::warn!(
                "Window not drained within {:?}, dropping {} stale credits",
                drain_timeout,
                stale.len()
            );
        }

        shared.rx_paused.store(true, Ordering::SeqCst);
        let rx_gate = shared.rx_gate.try_lock_for(gate_timeout);
        if rx_gate.is_none() {
            tracing::warn!("Receiver did not pause in time");
        }

        let Some((reader, writer, _)) = shared.halves() else {
            shared.rx_paused.store(false, Ordering::SeqCst);
            shared.tx_inhibit.store(false, Ordering::SeqCst);
            return Err(ConnectionError::NotConnected.into());
        };

        tracing::debug!("Exclusive link session started");
        Ok(Self {
            shared,
            _send_gate: send_gate,
            _rx_gate: rx_gate,
            reader,
            writer,
            lines: LineBuffer::new(),
            pending: VecDeque::new(),
        })
    }

    /// Write raw bytes
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let mut link = self.writer.lock();
        link.write_all(data)
            .and_then(|_| link.flush())
            .map_err(|e| {
                ConnectionError::WriteFailed {
                    reason: e.to_string(),
                }
                .into()
            })
    }

    /// Write one line followed by `\n`
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        tracing::trace!("TX (session): {}", line);
        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');
        self.write_raw(&frame)
    }

    /// Next received line, or `None` when nothing arrives within `timeout`
    pub fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 512];
        loop {
            if let Some(line) = self.pending.pop_front() {
                tracing::trace!("RX (session): {}", line);
                self.shared.emit(LinkEvent::Line(line.clone()));
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let read = self.reader.lock().read(&mut buf);
            match read {
                Ok(0) => {}
                Ok(n) => self.pending.extend(self.lines.push(&buf[..n])),
                Err(e) if is_idle_error(&e) => {}
                Err(e) => {
                    return Err(ConnectionError::ReadFailed {
                        reason: e.to_string(),
                    }
                    .into())
                }
            }
        }
    }

    /// Drop unread input
    pub fn clear_input(&mut self) {
        self.pending.clear();
        self.lines.clear();
        let mut buf = [0u8; 512];
        let mut link = self.reader.lock();
        while let Ok(n) = link.read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

impl Drop for LinkSession<'_> {
    fn drop(&mut self) {
        self.shared.rx_paused.store(false, Ordering::SeqCst);
        self.shared.tx_inhibit.store(false, Ordering::SeqCst);
        tracing::debug!("Exclusive link session ended");
    }
}
