//! Auto-report support tracking
//!
//! The device can push temperature (M155), position (M154) and SD status
//! (M27 S<n>) reports on its own. Support is probed once per connection;
//! an external policy uses the sample ages and [`AutoReport::try_rearm`] to
//! decide between auto-report and polling.

use crate::communication::TransmissionController;
use printerlink_core::{Result, TelemetryKind};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Every kind that can be auto-reported, in probe order
pub const AUTO_REPORT_KINDS: [TelemetryKind; 3] = [
    TelemetryKind::Temperature,
    TelemetryKind::Position,
    TelemetryKind::SdStatus,
];

/// Command enabling auto-report of `kind`
pub fn enable_command(kind: TelemetryKind) -> &'static str {
    match kind {
        TelemetryKind::Temperature => "M155 S1",
        TelemetryKind::Position => "M154 S1",
        TelemetryKind::SdStatus => "M27 S1",
    }
}

/// Command disabling auto-report of `kind`
pub fn disable_command(kind: TelemetryKind) -> &'static str {
    match kind {
        TelemetryKind::Temperature => "M155 S0",
        TelemetryKind::Position => "M154 S0",
        TelemetryKind::SdStatus => "M27 S0",
    }
}

/// True when the reply lines contain an `ok` and no `unknown command`
pub fn reply_accepts<S: AsRef<str>>(lines: &[S]) -> bool {
    let mut acked = false;
    for line in lines {
        let lower = line.as_ref().to_lowercase();
        if lower.contains("unknown command") {
            return false;
        }
        acked |= lower.starts_with("ok") || lower.ends_with(" ok");
    }
    acked
}

/// Write `command` on an exclusive session and collect lines up to its ack
pub fn exchange(
    controller: &TransmissionController,
    command: &str,
    timeout: Duration,
) -> Result<Vec<String>> {
    let mut session = controller.exclusive_session(controller.config().ack_timeout)?;
    session.write_line(command)?;
    let deadline = Instant::now() + timeout;
    let mut lines = Vec::new();
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match session.read_line(remaining)? {
            Some(line) => {
                let done = line.to_lowercase().starts_with("ok");
                lines.push(line);
                if done {
                    break;
                }
            }
            None => break,
        }
    }
    Ok(lines)
}

/// Probe results and re-arm bookkeeping for one connection
#[derive(Debug, Clone)]
pub struct AutoReport {
    cooldown: Duration,
    supported: HashMap<TelemetryKind, bool>,
    last_rearm: HashMap<TelemetryKind, Instant>,
}

impl AutoReport {
    /// Tracker allowing one re-arm per kind every `cooldown`
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            supported: HashMap::new(),
            last_rearm: HashMap::new(),
        }
    }

    /// Record the outcome of a probe
    pub fn record(&mut self, kind: TelemetryKind, supported: bool) {
        tracing::info!("Auto-report {}: supported={}", kind, supported);
        self.supported.insert(kind, supported);
    }

    /// Probe outcome, `None` before probing
    pub fn is_supported(&self, kind: TelemetryKind) -> Option<bool> {
        self.supported.get(&kind).copied()
    }

    /// All probe outcomes
    pub fn support(&self) -> HashMap<TelemetryKind, bool> {
        self.supported.clone()
    }

    /// Claim a re-arm slot; false while the cooldown runs or when the
    /// probe found no support
    pub fn try_rearm(&mut self, kind: TelemetryKind, now: Instant) -> bool {
        if self.is_supported(kind) == Some(false) {
            return false;
        }
        if let Some(last) = self.last_rearm.get(&kind) {
            if now.saturating_duration_since(*last) < self.cooldown {
                return false;
            }
        }
        self.last_rearm.insert(kind, now);
        true
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.supported.clear();
        self.last_rearm.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_accepts() {
        assert!(reply_accepts(&["ok"]));
        assert!(reply_accepts(&["echo:busy", "ok"]));
        assert!(!reply_accepts(&["echo:Unknown command: \"M154 S1\"", "ok"]));
        assert!(!reply_accepts::<&str>(&[]));
        assert!(!reply_accepts(&["echo:busy"]));
    }

    #[test]
    fn test_commands() {
        assert_eq!(enable_command(TelemetryKind::Temperature), "M155 S1");
        assert_eq!(disable_command(TelemetryKind::Position), "M154 S0");
        assert_eq!(enable_command(TelemetryKind::SdStatus), "M27 S1");
    }

    #[test]
    fn test_rearm_cooldown() {
        let mut report = AutoReport::new(Duration::from_secs(5));
        let start = Instant::now();
        assert!(report.try_rearm(TelemetryKind::Temperature, start));
        assert!(!report.try_rearm(TelemetryKind::Temperature, start + Duration::from_secs(1)));
        assert!(report.try_rearm(TelemetryKind::Position, start));
        assert!(report.try_rearm(TelemetryKind::Temperature, start + Duration::from_secs(5)));
    }

    #[test]
    fn test_unsupported_never_rearmed() {
        let mut report = AutoReport::new(Duration::ZERO);
        report.record(TelemetryKind::Position, false);
        assert_eq!(report.is_supported(TelemetryKind::Position), Some(false));
        assert!(!report.try_rearm(TelemetryKind::Position, Instant::now()));
        report.clear();
        assert_eq!(report.is_supported(TelemetryKind::Position), None);
    }
}
