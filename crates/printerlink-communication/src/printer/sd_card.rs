//! SD card upload
//!
//! Streams a G-code file into the card with the line-numbered, checksummed
//! handshake Marlin uses for M28/M29 file writes. The whole transfer runs on
//! an exclusive link session.
//!
//! ```text
//! N0 M110 N0*cs        reset the line counter
//! N1 M28 name*cs       open the file
//! N2 G28*cs            body lines, each acked with ok
//! ...
//! Nk M29*cs            close the file
//! ```

use crate::communication::{LinkSession, TransmissionController, UploadConfig};
use crate::protocol::parser;
use printerlink_core::{ProtocolError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Commands sent before the upload so nothing unsolicited interleaves
const QUIET_COMMANDS: &[&str] = &["M155 S0", "M154 S0", "M413 S0"];

/// Wait for the ack of one quiet command
const QUIET_TIMEOUT: Duration = Duration::from_secs(1);

/// Framed lines kept for resend requests
const RESEND_HISTORY: usize = 64;

/// Outcome of a finished upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UploadReport {
    /// Body lines written to the file
    pub lines: u64,
    /// Body bytes written, counting a CRLF per line
    pub bytes: u64,
}

/// XOR of every byte of `text`
pub fn checksum(text: &str) -> u8 {
    text.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// `N{n} {payload}*{checksum}\r\n`
pub fn frame(number: u64, payload: &str) -> String {
    let body = format!("N{} {}", number, payload);
    let cs = checksum(&body);
    format!("{}*{}\r\n", body, cs)
}

fn line_number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^N\d+\s*").expect("invalid regex pattern"))
}

fn trailing_checksum_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\d+\s*$").expect("invalid regex pattern"))
}

fn resend_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)resend:\s*(\d+)").expect("invalid regex pattern"))
}

/// Body line ready for framing; empty when nothing is left
///
/// Drops an existing line number and checksum and any `;` comment. Lines
/// longer than `max_len` are split on spaces.
pub fn normalize_line(raw: &str, max_len: usize) -> Vec<String> {
    let line = raw.trim_end_matches(['\r', '\n']).trim();
    let line = line_number_regex().replace(line, "");
    let line = trailing_checksum_regex().replace(&line, "");
    let line = match line.find(';') {
        Some(idx) => &line[..idx],
        None => &line[..],
    };
    let line = line.trim_end();
    if line.is_empty() {
        return Vec::new();
    }
    if line.len() <= max_len {
        return vec![line.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    for word in line.split_whitespace() {
        if !current.is_empty() && current.len() + 1 + word.len() > max_len {
            parts.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Classified reply to a framed line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadReply {
    /// Line accepted
    Ok,
    /// Device asks to resend from this number
    Resend(u64),
    /// Device rejected the transfer
    Error(String),
    /// Anything else
    Other,
}

/// Classify one received line
pub fn classify_reply(line: &str) -> UploadReply {
    let lower = line.trim().to_lowercase();
    if let Some(caps) = resend_regex().captures(line) {
        if let Ok(n) = caps[1].parse() {
            return UploadReply::Resend(n);
        }
    }
    if lower == "ok" || lower.starts_with("ok ") || lower.ends_with(" ok") {
        return UploadReply::Ok;
    }
    if lower.starts_with("error") && !parser::is_resend_notice(line) {
        return UploadReply::Error(line.trim().to_string());
    }
    UploadReply::Other
}

/// Numbered line sender over a session
struct NumberedSender<'s, 'a> {
    session: &'s mut LinkSession<'a>,
    max_retries: u32,
    history: VecDeque<(u64, String)>,
    next: u64,
    skip_ok: bool,
}

impl<'s, 'a> NumberedSender<'s, 'a> {
    fn new(session: &'s mut LinkSession<'a>, max_retries: u32) -> Self {
        Self {
            session,
            max_retries: max_retries.max(1),
            history: VecDeque::with_capacity(RESEND_HISTORY),
            next: 0,
            skip_ok: false,
        }
    }

    /// Send `payload` as the next numbered line and wait until it is accepted
    fn send(&mut self, payload: &str, timeout: Duration) -> Result<Vec<String>> {
        let number = self.next;
        self.next += 1;
        if self.history.len() == RESEND_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back((number, payload.to_string()));
        self.deliver_from(number, timeout)
    }

    /// Deliver history entries from `start` through the newest one
    fn deliver_from(&mut self, mut start: u64, timeout: Duration) -> Result<Vec<String>> {
        let newest = self.next - 1;
        let mut attempts = 0u32;
        let mut seen = Vec::new();

        while start <= newest {
            let Some(payload) = self
                .history
                .iter()
                .find(|(n, _)| *n == start)
                .map(|(_, p)| p.clone())
            else {
                return Err(ProtocolError::UnexpectedReply {
                    reply: format!("Resend: {}", start),
                }
                .into());
            };

            attempts += 1;
            if attempts > self.max_retries {
                return Err(ProtocolError::RetriesExhausted {
                    line_number: start,
                    attempts: attempts - 1,
                }
                .into());
            }

            tracing::trace!("Upload N{}: {}", start, payload);
            self.session.write_raw(frame(start, &payload).as_bytes())?;

            match self.await_reply(timeout, &mut seen)? {
                Some(UploadReply::Ok) => {
                    start += 1;
                    attempts = 0;
                }
                Some(UploadReply::Resend(n)) => {
                    tracing::debug!("Device requested resend from N{}", n);
                    self.skip_ok = true;
                    if n != start {
                        attempts = 0;
                    }
                    start = n;
                }
                Some(UploadReply::Error(line)) => {
                    return Err(ProtocolError::DeviceError { line }.into());
                }
                Some(UploadReply::Other) | None => {
                    tracing::warn!("No ack for N{} within {:?}, retrying", start, timeout);
                }
            }
        }
        Ok(seen)
    }

    /// First decisive reply, or `None` on timeout
    fn await_reply(
        &mut self,
        timeout: Duration,
        seen: &mut Vec<String>,
    ) -> Result<Option<UploadReply>> {
        let deadline = Instant::now() + timeout;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            let Some(line) = self.session.read_line(remaining)? else {
                break;
            };
            let reply = classify_reply(&line);
            seen.push(line);
            match reply {
                UploadReply::Ok if self.skip_ok => {
                    // the ok trailing a resend request
                    self.skip_ok = false;
                }
                UploadReply::Other => {}
                decisive => {
                    self.skip_ok = false;
                    return Ok(Some(decisive));
                }
            }
        }
        Ok(None)
    }
}

/// Upload `source` to the SD card as `name`
///
/// Normal transmission resumes when this returns, on success or failure.
pub fn upload<R: BufRead>(
    controller: &TransmissionController,
    name: &str,
    mut source: R,
    config: &UploadConfig,
) -> Result<UploadReport> {
    let name = name.trim();
    tracing::info!("Uploading {} to SD card", name);

    let mut session = controller.exclusive_session(config.close_timeout)?;
    session.clear_input();

    for command in QUIET_COMMANDS {
        session.write_line(command)?;
        let deadline = Instant::now() + QUIET_TIMEOUT;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match session.read_line(remaining)? {
                Some(line) if line.to_lowercase().starts_with("ok") => break,
                Some(_) => {}
                None => break,
            }
        }
    }

    let mut sender = NumberedSender::new(&mut session, config.max_retries);
    sender.send("M110 N0", config.line_timeout)?;

    let opened = sender.send(&format!("M28 {}", name), config.open_timeout)?;
    if let Some(line) = opened
        .iter()
        .find(|l| l.to_lowercase().contains("open failed"))
    {
        return Err(ProtocolError::DeviceError { line: line.clone() }.into());
    }

    let mut report = UploadReport::default();
    let mut raw = Vec::new();
    loop {
        raw.clear();
        if source.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&raw);
        for part in normalize_line(&text, config.max_line_len) {
            sender.send(&part, config.line_timeout)?;
            report.lines += 1;
            report.bytes += part.len() as u64 + 2;
        }
    }

    sender.send("M29", config.close_timeout)?;
    tracing::info!(
        "Uploaded {}: {} lines, {} bytes",
        name,
        report.lines,
        report.bytes
    );
    Ok(report)
}
