//! Credit window over in-flight messages
//!
//! Credits are `capacity - in_flight`. The sender takes a credit before
//! writing and the receiver returns it when the oldest message is acked.
//!
//! Reclaimed stale ids stop holding credits but stay queued ahead of the
//! window, so a late `ok` still pops the message it belongs to.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct WindowState {
    in_flight: VecDeque<u64>,
    reclaimed: VecDeque<u64>,
    capacity: usize,
    high_water: usize,
    closed: bool,
}

/// Bounded FIFO of unacknowledged message ids
pub struct FlowWindow {
    state: Mutex<WindowState>,
    changed: Condvar,
}

/// Outcome of a bounded window wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowWait {
    /// Condition reached
    Ready,
    /// Timed out with the condition unmet
    TimedOut,
    /// Window closed while waiting
    Closed,
}

impl FlowWindow {
    /// Window with `capacity` credits (at least one)
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(WindowState {
                in_flight: VecDeque::with_capacity(capacity.max(1)),
                reclaimed: VecDeque::new(),
                capacity: capacity.max(1),
                high_water: 0,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Total credits
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Messages currently in flight
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Available credits
    pub fn credits(&self) -> usize {
        let state = self.state.lock();
        state.capacity.saturating_sub(state.in_flight.len())
    }

    /// Largest in-flight count observed since the last reset
    pub fn high_water(&self) -> usize {
        self.state.lock().high_water
    }

    /// True once closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wait until at least one credit is free
    pub fn wait_for_credit(&self, timeout: Duration) -> WindowWait {
        self.wait_until(timeout, |s| s.in_flight.len() < s.capacity)
    }

    /// Wait until nothing is in flight
    pub fn wait_for_drain(&self, timeout: Duration) -> WindowWait {
        self.wait_until(timeout, |s| s.in_flight.is_empty())
    }

    fn wait_until(&self, timeout: Duration, ready: impl Fn(&WindowState) -> bool) -> WindowWait {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return WindowWait::Closed;
            }
            if ready(&state) {
                return WindowWait::Ready;
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return if state.closed {
                    WindowWait::Closed
                } else if ready(&state) {
                    WindowWait::Ready
                } else {
                    WindowWait::TimedOut
                };
            }
        }
    }

    /// Take a credit for `id`; false when no credit is free or the window is closed
    pub fn push(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.in_flight.len() >= state.capacity {
            return false;
        }
        state.in_flight.push_back(id);
        state.high_water = state.high_water.max(state.in_flight.len());
        true
    }

    /// Reclaimed ids still owed an ack
    pub fn reclaimed(&self) -> usize {
        self.state.lock().reclaimed.len()
    }

    /// Match one ack to the oldest message
    ///
    /// Reclaimed ids are matched first; only an in-flight id returns a credit.
    pub fn pop_oldest(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if let Some(id) = state.reclaimed.pop_front() {
            return Some(id);
        }
        let id = state.in_flight.pop_front();
        if id.is_some() {
            self.changed.notify_all();
        }
        id
    }

    /// Free the credits of every in-flight message
    ///
    /// The ids keep their place in ack order; returns how many were reclaimed.
    pub fn reclaim_stale(&self) -> usize {
        let mut state = self.state.lock();
        let stale: Vec<u64> = state.in_flight.drain(..).collect();
        state.reclaimed.extend(stale.iter().copied());
        self.changed.notify_all();
        stale.len()
    }

    /// Forget every in-flight and reclaimed message
    pub fn reclaim_all(&self) -> Vec<u64> {
        let mut state = self.state.lock();
        let mut ids: Vec<u64> = state.reclaimed.drain(..).collect();
        ids.extend(state.in_flight.drain(..));
        self.changed.notify_all();
        ids
    }

    /// Change the capacity and empty the window
    pub fn reset(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.in_flight.clear();
        state.reclaimed.clear();
        state.capacity = capacity.max(1);
        state.high_water = 0;
        state.closed = false;
        self.changed.notify_all();
    }

    /// Wake every waiter; later waits return `Closed`
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_all();
    }
}
