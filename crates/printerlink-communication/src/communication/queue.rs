//! Outbound software queue

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Line waiting to be transmitted
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Sequence id, unique per controller
    pub id: u64,
    /// Line text without terminator
    pub line: String,
    /// Must be sent on an empty window and acked before anything else
    pub barrier: bool,
    /// When the line was queued
    pub enqueued_at: Instant,
}

struct QueueState {
    items: VecDeque<OutboundMessage>,
    closed: bool,
}

/// FIFO of not-yet-sent lines; priority lines jump to the front
pub struct SendQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl SendQueue {
    /// Empty open queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a message
    pub fn push_back(&self, message: OutboundMessage) {
        self.state.lock().items.push_back(message);
        self.available.notify_one();
    }

    /// Put a message ahead of everything not yet sent
    pub fn push_front(&self, message: OutboundMessage) {
        self.state.lock().items.push_front(message);
        self.available.notify_one();
    }

    /// Next message, waiting up to `timeout`; `None` on timeout or close
    pub fn pop_wait(&self, timeout: Duration) -> Option<OutboundMessage> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(message) = state.items.pop_front() {
                return Some(message);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                if state.closed {
                    return None;
                }
                return state.items.pop_front();
            }
        }
    }

    /// Drop every queued message; returns how many were dropped
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.items.len();
        state.items.clear();
        dropped
    }

    /// Queued messages
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and wake the consumer
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// Reopen after a close, dropping leftovers
    pub fn reopen(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.closed = false;
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: u64, line: &str) -> OutboundMessage {
        OutboundMessage {
            id,
            line: line.to_string(),
            barrier: false,
            enqueued_at: Instant::now(),
        }
    }

    #[test]
    fn test_fifo_with_priority() {
        let queue = SendQueue::new();
        queue.push_back(message(1, "G1 X1"));
        queue.push_back(message(2, "G1 X2"));
        queue.push_front(message(3, "M112"));
        let order: Vec<u64> = std::iter::from_fn(|| queue.pop_wait(Duration::from_millis(1)))
            .map(|m| m.id)
            .collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn test_clear_and_close() {
        let queue = SendQueue::new();
        queue.push_back(message(1, "G1"));
        queue.push_back(message(2, "G1"));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());

        queue.push_back(message(3, "G1"));
        queue.close();
        assert!(queue.pop_wait(Duration::from_millis(5)).is_none());
        queue.reopen();
        assert!(queue.is_empty());
        assert!(queue.pop_wait(Duration::from_millis(5)).is_none());
    }
}
