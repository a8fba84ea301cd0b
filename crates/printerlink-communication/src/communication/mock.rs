//! Scripted in-memory serial device
//!
//! `MockDevice` stands in for a printer board: every line the host writes is
//! recorded and passed to a responder that returns the device's reply lines.
//! Unsolicited lines can be injected at any time. The device doubles as a
//! [`LinkOpener`] so a whole communicator can run against it.

use super::serial::{LinkOpener, LinkTimeouts, SerialLink};
use parking_lot::{Condvar, Mutex};
use printerlink_core::{ConnectionError, Result};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Reply lines for one written line
pub type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

const MOCK_READ_TIMEOUT: Duration = Duration::from_millis(20);

struct DeviceState {
    inbound: VecDeque<u8>,
    partial: Vec<u8>,
    written: Vec<String>,
    responder: Option<Responder>,
    fail_writes: bool,
    fail_open: bool,
    splittable: bool,
    dtr: Vec<bool>,
    clears: usize,
    opens: usize,
}

struct Shared {
    state: Mutex<DeviceState>,
    readable: Condvar,
}

/// Simulated printer board
#[derive(Clone)]
pub struct MockDevice {
    shared: Arc<Shared>,
}

impl MockDevice {
    /// Device that never answers unless lines are pushed
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DeviceState {
                    inbound: VecDeque::new(),
                    partial: Vec::new(),
                    written: Vec::new(),
                    responder: None,
                    fail_writes: false,
                    fail_open: false,
                    splittable: true,
                    dtr: Vec::new(),
                    clears: 0,
                    opens: 0,
                }),
                readable: Condvar::new(),
            }),
        }
    }

    /// Device answering through `responder`
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        let device = Self::new();
        device.set_responder(responder);
        device
    }

    /// Device behaving like a Marlin FDM board
    pub fn marlin() -> Self {
        Self::with_responder(marlin_responder())
    }

    /// Replace the responder
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        self.shared.state.lock().responder = Some(Box::new(responder));
    }

    /// Whether links opened on this device can be split (primary mode)
    pub fn set_splittable(&self, splittable: bool) {
        self.shared.state.lock().splittable = splittable;
    }

    /// Make every write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.state.lock().fail_writes = fail;
    }

    /// Make opening fail
    pub fn set_fail_open(&self, fail: bool) {
        self.shared.state.lock().fail_open = fail;
    }

    /// Queue an unsolicited line from the device
    pub fn push_line(&self, line: &str) {
        let mut state = self.shared.state.lock();
        state.inbound.extend(line.as_bytes());
        state.inbound.push_back(b'\n');
        self.shared.readable.notify_all();
    }

    /// Lines written by the host so far
    pub fn written_lines(&self) -> Vec<String> {
        self.shared.state.lock().written.clone()
    }

    /// Forget the written lines
    pub fn clear_written(&self) {
        self.shared.state.lock().written.clear();
    }

    /// DTR levels set by the host, in order
    pub fn dtr_history(&self) -> Vec<bool> {
        self.shared.state.lock().dtr.clone()
    }

    /// Number of buffer clears requested
    pub fn clear_count(&self) -> usize {
        self.shared.state.lock().clears
    }

    /// Number of successful opens
    pub fn open_count(&self) -> usize {
        self.shared.state.lock().opens
    }

    /// Host-side link on this device
    pub fn link(&self) -> MockLink {
        MockLink {
            shared: self.shared.clone(),
        }
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkOpener for MockDevice {
    fn open(&self, port: &str, _baud: u32, _timeouts: LinkTimeouts) -> Result<Box<dyn SerialLink>> {
        let mut state = self.shared.state.lock();
        if state.fail_open {
            return Err(ConnectionError::FailedToOpen {
                port: port.to_string(),
                reason: "mock open failure".to_string(),
            }
            .into());
        }
        state.opens += 1;
        Ok(Box::new(self.link()))
    }

    fn candidates(&self) -> Vec<String> {
        vec!["/dev/ttyMOCK0".to_string()]
    }
}

/// Host-side handle on a [`MockDevice`]
pub struct MockLink {
    shared: Arc<Shared>,
}

impl SerialLink for MockLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }

        let mut completed = Vec::new();
        for &byte in data {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&state.partial).trim().to_string();
                state.partial.clear();
                completed.push(line);
            } else {
                state.partial.push(byte);
            }
        }

        for line in completed {
            if line.is_empty() {
                continue;
            }
            state.written.push(line.clone());
            let replies = match state.responder.as_mut() {
                Some(responder) => responder(&line),
                None => Vec::new(),
            };
            for reply in replies {
                state.inbound.extend(reply.as_bytes());
                state.inbound.push_back(b'\n');
            }
        }
        self.shared.readable.notify_all();
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        if state.inbound.is_empty() {
            self.shared
                .readable
                .wait_for(&mut state, MOCK_READ_TIMEOUT);
        }
        if state.inbound.is_empty() {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.shared.state.lock().dtr.push(level);
        Ok(())
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        state.inbound.clear();
        state.partial.clear();
        state.clears += 1;
        Ok(())
    }

    fn name(&self) -> String {
        "mock".to_string()
    }

    fn try_split(&self) -> Option<Box<dyn SerialLink>> {
        if self.shared.state.lock().splittable {
            Some(Box::new(MockLink {
                shared: self.shared.clone(),
            }))
        } else {
            None
        }
    }
}

/// Responder acknowledging like a Marlin FDM board
///
/// Replies to M105, M114, M115, M20, M27 and the auto-report commands with
/// plausible data, answers `ok` to everything else and keeps the upload
/// line-number handshake.
pub fn marlin_responder() -> impl FnMut(&str) -> Vec<String> + Send {
    let mut hotend_target = 0.0_f64;
    let mut bed_target = 0.0_f64;
    move |line: &str| {
        let payload = strip_frame(line);
        let word = payload.split_whitespace().next().unwrap_or("").to_uppercase();
        let arg = |prefix: char| -> Option<f64> {
            payload
                .split_whitespace()
                .skip(1)
                .find_map(|tok| tok.strip_prefix(prefix)?.parse().ok())
        };
        match word.as_str() {
            "M105" => vec![format!(
                "ok T:{:.1} /{:.1} B:{:.1} /{:.1} @:0 B@:0",
                hotend_target.max(20.0),
                hotend_target,
                bed_target.max(20.0),
                bed_target
            )],
            "M104" | "M109" => {
                hotend_target = arg('S').unwrap_or(0.0);
                vec!["ok".to_string()]
            }
            "M140" | "M190" => {
                bed_target = arg('S').unwrap_or(0.0);
                vec!["ok".to_string()]
            }
            "M114" => vec![
                "X:0.00 Y:0.00 Z:0.00 E:0.00 Count X:0 Y:0 Z:0".to_string(),
                "ok".to_string(),
            ],
            "M115" => vec![
                "FIRMWARE_NAME:Marlin 2.1.2 (Github) SOURCE_CODE_URL:github.com/MarlinFirmware/Marlin PROTOCOL_VERSION:1.0 MACHINE_TYPE:Ender-3 EXTRUDER_COUNT:1 UUID:cede2a2f-41a2-4748-9b12-c55c62f367ff".to_string(),
                "Cap:AUTOREPORT_TEMP:1".to_string(),
                "Cap:AUTOREPORT_POS:0".to_string(),
                "ok".to_string(),
            ],
            "M20" => vec![
                "Begin file list".to_string(),
                "CUBE~1.GCO 12345".to_string(),
                "long filename: calibration cube.gcode".to_string(),
                "BENCHY.GCO 987654".to_string(),
                "End file list".to_string(),
                "ok".to_string(),
            ],
            "M27" => vec!["Not SD printing".to_string(), "ok".to_string()],
            "M154" => vec!["echo:Unknown command: \"M154 S1\"".to_string(), "ok".to_string()],
            _ => vec!["ok".to_string()],
        }
    }
}

/// Payload of an `N{n} payload*cs` frame, or the line unchanged
fn strip_frame(line: &str) -> &str {
    let mut payload = line.trim();
    if payload.starts_with('N') {
        if let Some((head, rest)) = payload.split_once(' ') {
            if head[1..].chars().all(|c| c.is_ascii_digit()) {
                payload = rest;
            }
        }
    }
    match payload.rsplit_once('*') {
        Some((body, cs)) if !cs.is_empty() && cs.chars().all(|c| c.is_ascii_digit()) => body,
        _ => payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(link: &mut MockLink) -> String {
        let mut buf = [0u8; 512];
        let mut text = String::new();
        while let Ok(n) = link.read(&mut buf) {
            text.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        text
    }

    #[test]
    fn test_responder_and_record() {
        let device = MockDevice::marlin();
        let mut link = device.link();
        link.write_all(b"M105\n").unwrap();
        let text = read_all(&mut link);
        assert!(text.starts_with("ok T:20.0 /0.0"));
        assert_eq!(device.written_lines(), vec!["M105"]);
    }

    #[test]
    fn test_partial_writes_join() {
        let device = MockDevice::new();
        let mut link = device.link();
        link.write_all(b"G28 ").unwrap();
        assert!(device.written_lines().is_empty());
        link.write_all(b"X Y\r\n").unwrap();
        assert_eq!(device.written_lines(), vec!["G28 X Y"]);
    }

    #[test]
    fn test_read_times_out_when_idle() {
        let device = MockDevice::new();
        let mut link = device.link();
        let mut buf = [0u8; 8];
        let err = link.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        device.push_line("start");
        assert_eq!(read_all(&mut link), "start\n");
    }

    #[test]
    fn test_split_and_failures() {
        let device = MockDevice::new();
        assert!(device.link().try_split().is_some());
        device.set_splittable(false);
        assert!(device.link().try_split().is_none());

        device.set_fail_writes(true);
        assert!(device.link().write_all(b"M105\n").is_err());

        device.set_fail_open(true);
        assert!(device
            .open("/dev/ttyMOCK0", 115200, LinkTimeouts::default())
            .is_err());
    }

    #[test]
    fn test_strip_frame() {
        assert_eq!(strip_frame("N3 G1 X10*45"), "G1 X10");
        assert_eq!(strip_frame("M105"), "M105");
        assert_eq!(strip_frame("NOTAFRAME"), "NOTAFRAME");
    }
}
