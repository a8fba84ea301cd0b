//! Remaining-time estimation for SD prints
//!
//! Throughput is smoothed with an exponentially weighted moving average whose
//! weight is expressed as a half-life: a sample taken `half_life` seconds after
//! the previous one carries half of the total weight.

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Rewinds smaller than this are treated as jitter, not a new job
const REWIND_TOLERANCE_BYTES: u64 = 1024;

/// Rates at or below this are treated as "not moving"
const MIN_RATE: f64 = 1e-6;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic tests and replays
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Clock frozen at the current instant
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// Estimator output for one progress sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtaReport {
    /// Completion in percent (0-100)
    pub progress: f64,
    /// Smoothed throughput in bytes per second
    pub rate_bps: f64,
    /// Seconds since the job was first seen
    pub elapsed_s: f64,
    /// Seconds remaining, `None` while unknown
    pub remaining_s: Option<f64>,
    /// `remaining_s` as H:MM:SS
    pub eta_str: String,
    /// `elapsed_s` as H:MM:SS
    pub elapsed_str: String,
}

/// Extract `(done, total)` from an M27 report such as `SD printing byte 500/1000`.
///
/// Returns `None` when the line does not match or the total is zero.
pub fn parse_m27(line: &str) -> Option<(u64, u64)> {
    static M27_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = M27_REGEX.get_or_init(|| {
        Regex::new(r"(?i)\bSD\s+printing\s+byte\s+(\d+)\s*/\s*(\d+)").expect("invalid regex pattern")
    });
    let caps = regex.captures(line)?;
    let done = caps[1].parse::<u64>().ok()?;
    let total = caps[2].parse::<u64>().ok()?;
    if total == 0 {
        return None;
    }
    Some((done, total))
}

/// Format seconds as `H:MM:SS`; unknown or non-finite values become `--:--:--`.
pub fn fmt_hms(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds.filter(|s| s.is_finite()) else {
        return "--:--:--".to_string();
    };
    let total = seconds.round().max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// EWMA throughput and remaining-time estimator
pub struct EtaEstimator {
    half_life_s: f64,
    clock: Arc<dyn Clock>,
    started_at: Option<Instant>,
    last_at: Option<Instant>,
    last_done: Option<u64>,
    total: Option<u64>,
    rate: Option<f64>,
}

impl EtaEstimator {
    /// Create an estimator on the wall clock
    pub fn new(half_life_s: f64) -> Self {
        Self::with_clock(half_life_s, Arc::new(SystemClock))
    }

    /// Create an estimator on an explicit clock. Half-life is clamped to at least 1s.
    pub fn with_clock(half_life_s: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            half_life_s: if half_life_s.is_finite() {
                half_life_s.max(1.0)
            } else {
                1.0
            },
            clock,
            started_at: None,
            last_at: None,
            last_done: None,
            total: None,
            rate: None,
        }
    }

    /// Effective half-life in seconds
    pub fn half_life(&self) -> f64 {
        self.half_life_s
    }

    /// Forget the current job
    pub fn reset(&mut self) {
        self.started_at = None;
        self.last_at = None;
        self.last_done = None;
        self.total = None;
        self.rate = None;
    }

    fn alpha(&self, dt: f64) -> f64 {
        if dt <= 0.0 {
            1.0
        } else {
            1.0 - 0.5_f64.powf(dt / self.half_life_s)
        }
    }

    /// Feed an M27 line; `None` when the line carries no progress.
    pub fn update_line(&mut self, line: &str) -> Option<EtaReport> {
        let (done, total) = parse_m27(line)?;
        Some(self.update(done, total))
    }

    /// Feed a progress sample
    pub fn update(&mut self, done: u64, total: u64) -> EtaReport {
        let now = self.clock.now();

        if let Some(prev_total) = self.total {
            let rewound = self
                .last_done
                .is_some_and(|last| done.saturating_add(REWIND_TOLERANCE_BYTES) < last);
            if total != prev_total || rewound {
                tracing::debug!(done, total, prev_total, "ETA estimator reset for new job");
                self.reset();
            }
        }

        let started_at = *self.started_at.get_or_insert(now);

        if let (Some(last_at), Some(last_done)) = (self.last_at, self.last_done) {
            if done >= last_done {
                let dt = now.duration_since(last_at).as_secs_f64().max(MIN_RATE);
                let sample = (done - last_done) as f64 / dt;
                let alpha = self.alpha(dt);
                self.rate = Some(match self.rate {
                    None => sample,
                    Some(rate) => (1.0 - alpha) * rate + alpha * sample,
                });
            }
        }

        self.last_at = Some(now);
        self.last_done = Some(done);
        self.total = Some(total);

        let progress = if total > 0 {
            100.0 * done as f64 / total as f64
        } else {
            0.0
        };
        let elapsed = now.duration_since(started_at).as_secs_f64();
        let remaining = match self.rate {
            Some(rate) if rate > MIN_RATE && total > 0 => {
                Some(total.saturating_sub(done) as f64 / rate)
            }
            _ => None,
        };

        EtaReport {
            progress,
            rate_bps: self.rate.unwrap_or(0.0),
            elapsed_s: elapsed,
            remaining_s: remaining,
            eta_str: fmt_hms(remaining),
            elapsed_str: fmt_hms(Some(elapsed)),
        }
    }
}

impl Default for EtaEstimator {
    fn default() -> Self {
        Self::new(20.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator(half_life: f64) -> (EtaEstimator, ManualClock) {
        let clock = ManualClock::new();
        (
            EtaEstimator::with_clock(half_life, Arc::new(clock.clone())),
            clock,
        )
    }

    #[test]
    fn test_parse_m27() {
        assert_eq!(parse_m27("SD printing byte 500/1000"), Some((500, 1000)));
        assert_eq!(
            parse_m27("echo: sd printing BYTE 286601 / 8227542"),
            Some((286601, 8227542))
        );
        assert_eq!(parse_m27("SD printing byte 0/0"), None);
        assert_eq!(parse_m27("Not SD printing"), None);
    }

    #[test]
    fn test_fmt_hms() {
        assert_eq!(fmt_hms(Some(3661.2)), "1:01:01");
        assert_eq!(fmt_hms(Some(59.6)), "0:01:00");
        assert_eq!(fmt_hms(Some(-5.0)), "0:00:00");
        assert_eq!(fmt_hms(None), "--:--:--");
        assert_eq!(fmt_hms(Some(f64::NAN)), "--:--:--");
    }

    #[test]
    fn test_half_life_clamped() {
        assert_eq!(EtaEstimator::new(0.2).half_life(), 1.0);
        assert_eq!(EtaEstimator::default().half_life(), 20.0);
    }

    #[test]
    fn test_rate_after_one_half_life() {
        let (mut eta, clock) = estimator(20.0);
        let first = eta.update(0, 1000);
        assert_eq!(first.rate_bps, 0.0);
        assert!(first.remaining_s.is_none());
        assert_eq!(first.eta_str, "--:--:--");

        clock.advance(Duration::from_secs(20));
        let report = eta.update(500, 1000);
        assert!((report.progress - 50.0).abs() < 1e-9);
        assert!((report.rate_bps - 25.0).abs() < 1e-6);
        let remaining = report.remaining_s.unwrap();
        assert!((remaining - 20.0).abs() < 1e-6);
        assert!((report.elapsed_s - 20.0).abs() < 1e-6);
        assert_eq!(report.elapsed_str, "0:00:20");
    }

    #[test]
    fn test_ewma_smoothing() {
        let (mut eta, clock) = estimator(10.0);
        eta.update(0, 10_000);
        clock.advance(Duration::from_secs(10));
        eta.update(1000, 10_000);
        clock.advance(Duration::from_secs(10));
        let report = eta.update(4000, 10_000);
        // 100 B/s then 300 B/s sampled one half-life apart
        assert!((report.rate_bps - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_reset_on_new_job() {
        let (mut eta, clock) = estimator(20.0);
        eta.update(0, 1000);
        clock.advance(Duration::from_secs(10));
        eta.update(800, 1000);

        clock.advance(Duration::from_secs(10));
        let report = eta.update(10, 5000);
        assert_eq!(report.rate_bps, 0.0);
        assert_eq!(report.elapsed_s, 0.0);
    }

    #[test]
    fn test_small_rewind_is_not_reset() {
        let (mut eta, clock) = estimator(20.0);
        eta.update(0, 100_000);
        clock.advance(Duration::from_secs(10));
        eta.update(50_000, 100_000);
        clock.advance(Duration::from_secs(10));
        let report = eta.update(49_500, 100_000);
        assert!(report.rate_bps > 0.0);
        assert!((report.elapsed_s - 20.0).abs() < 1e-6);

        clock.advance(Duration::from_secs(10));
        let report = eta.update(1000, 100_000);
        assert_eq!(report.rate_bps, 0.0);
    }

    #[test]
    fn test_huge_counters_do_not_overflow() {
        let (mut eta, clock) = estimator(20.0);
        eta.update(u64::MAX - 10, u64::MAX);
        clock.advance(Duration::from_secs(1));
        let report = eta.update(u64::MAX - 5, u64::MAX);
        assert!(report.progress > 99.9);
        assert!(report.rate_bps >= 0.0);
    }

    #[test]
    fn test_update_line() {
        let (mut eta, _clock) = estimator(20.0);
        assert!(eta.update_line("ok").is_none());
        let report = eta.update_line("SD printing byte 250/1000").unwrap();
        assert!((report.progress - 25.0).abs() < 1e-9);
    }
}
