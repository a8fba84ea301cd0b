//! Link heartbeat
//!
//! Counts consecutive synchronous wait timeouts. Reaching the threshold
//! asks for exactly one reconnect; another is allowed only after a wait
//! succeeds again.

/// What the caller should do after recording a timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Below the threshold
    Healthy,
    /// Threshold reached; move to Error and reconnect once
    Reconnect,
    /// Threshold reached earlier and a reconnect was already requested
    AwaitingRecovery,
}

/// Consecutive-timeout counter with a one-shot reconnect latch
#[derive(Debug, Clone)]
pub struct Heartbeat {
    threshold: u32,
    consecutive: u32,
    reconnect_armed: bool,
}

impl Heartbeat {
    /// Counter that trips after `threshold` timeouts in a row
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
            reconnect_armed: true,
        }
    }

    /// Consecutive timeouts so far
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive
    }

    /// Record a wait that got its ack
    pub fn record_success(&mut self) {
        self.consecutive = 0;
        self.reconnect_armed = true;
    }

    /// Record a wait that timed out
    pub fn record_timeout(&mut self) -> HeartbeatVerdict {
        self.consecutive = self.consecutive.saturating_add(1);
        if self.consecutive < self.threshold {
            return HeartbeatVerdict::Healthy;
        }
        self.consecutive = 0;
        if self.reconnect_armed {
            self.reconnect_armed = false;
            HeartbeatVerdict::Reconnect
        } else {
            HeartbeatVerdict::AwaitingRecovery
        }
    }

    /// Forget the count and re-arm the reconnect
    pub fn reset(&mut self) {
        self.record_success();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_reconnect_until_success() {
        let mut heartbeat = Heartbeat::new(3);
        assert_eq!(heartbeat.record_timeout(), HeartbeatVerdict::Healthy);
        assert_eq!(heartbeat.record_timeout(), HeartbeatVerdict::Healthy);
        assert_eq!(heartbeat.record_timeout(), HeartbeatVerdict::Reconnect);
        assert_eq!(heartbeat.consecutive_timeouts(), 0);

        for _ in 0..2 {
            assert_eq!(heartbeat.record_timeout(), HeartbeatVerdict::Healthy);
        }
        assert_eq!(heartbeat.record_timeout(), HeartbeatVerdict::AwaitingRecovery);

        heartbeat.record_success();
        for _ in 0..2 {
            heartbeat.record_timeout();
        }
        assert_eq!(heartbeat.record_timeout(), HeartbeatVerdict::Reconnect);
    }

    #[test]
    fn test_success_resets_count() {
        let mut heartbeat = Heartbeat::new(2);
        heartbeat.record_timeout();
        heartbeat.record_success();
        assert_eq!(heartbeat.record_timeout(), HeartbeatVerdict::Healthy);
    }

    #[test]
    fn test_zero_threshold_clamped() {
        let mut heartbeat = Heartbeat::new(0);
        assert_eq!(heartbeat.record_timeout(), HeartbeatVerdict::Reconnect);
    }
}
