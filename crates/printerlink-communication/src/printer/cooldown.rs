//! Cooling watchdog used after a print cancel

use crate::communication::CoolingConfig;
use printerlink_core::TemperatureSample;
use std::time::Instant;

/// Outcome of one watchdog check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoolingStatus {
    /// Still hot, or cool for less than the stable time
    Cooling,
    /// Cool and stable
    Cooled,
    /// Gave up
    TimedOut,
}

/// Decides when the machine has cooled down
///
/// Cool means both heater targets are 0 and the hot end and bed are at or
/// below their thresholds. Missing readings count as cool.
#[derive(Debug, Clone)]
pub struct CoolingWatch {
    config: CoolingConfig,
    started: Instant,
    cool_since: Option<Instant>,
}

impl CoolingWatch {
    /// Watch starting at `now`
    pub fn new(config: CoolingConfig, now: Instant) -> Self {
        Self {
            config,
            started: now,
            cool_since: None,
        }
    }

    /// Settings of the watch
    pub fn config(&self) -> &CoolingConfig {
        &self.config
    }

    /// Evaluate the latest sample
    pub fn check(&mut self, sample: Option<&TemperatureSample>, now: Instant) -> CoolingStatus {
        if self.is_cool(sample) {
            let since = *self.cool_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= self.config.stable {
                return CoolingStatus::Cooled;
            }
        } else {
            self.cool_since = None;
        }

        if now.saturating_duration_since(self.started) > self.config.timeout {
            return CoolingStatus::TimedOut;
        }
        CoolingStatus::Cooling
    }

    fn is_cool(&self, sample: Option<&TemperatureSample>) -> bool {
        let Some(sample) = sample else {
            return true;
        };
        let hotend_ok = sample
            .tools
            .values()
            .next()
            .map(|t| t.target == 0.0 && t.actual <= self.config.hotend_c)
            .unwrap_or(true);
        let bed_ok = sample
            .bed
            .map(|b| b.target == 0.0 && b.actual <= self.config.bed_c)
            .unwrap_or(true);
        hotend_ok && bed_ok
    }
}
