//! Acknowledgement table
//!
//! Maps message ids to one-shot signals. Waiters for distinct ids never
//! contend on anything but the short map lookup.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct AckSlot {
    acked: Mutex<bool>,
    signal: Condvar,
}

impl AckSlot {
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut acked = self.acked.lock();
        while !*acked {
            if self.signal.wait_until(&mut acked, deadline).timed_out() {
                break;
            }
        }
        *acked
    }

    fn set(&self) {
        *self.acked.lock() = true;
        self.signal.notify_all();
    }
}

/// Id-keyed one-shot ack signals
///
/// An ack only reaches a waiter registered before it fired. A waiter that
/// registers after its ack was published times out.
#[derive(Default)]
pub struct AckTable {
    slots: Mutex<HashMap<u64, Arc<AckSlot>>>,
}

impl AckTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `id`
    pub fn register(&self, id: u64) {
        self.slots.lock().entry(id).or_default();
    }

    /// Signal `id`; true when a waiter was registered
    pub fn publish(&self, id: u64) -> bool {
        let slot = self.slots.lock().get(&id).cloned();
        match slot {
            Some(slot) => {
                slot.set();
                true
            }
            None => false,
        }
    }

    /// Block until `id` is acked or the timeout elapses
    ///
    /// Registers the waiter if needed and removes it afterwards, so each ack
    /// is consumed at most once.
    pub fn wait(&self, id: u64, timeout: Duration) -> bool {
        let slot = self.slots.lock().entry(id).or_default().clone();
        let acked = slot.wait(timeout);
        self.slots.lock().remove(&id);
        acked
    }

    /// Registered waiters
    pub fn pending(&self) -> usize {
        self.slots.lock().len()
    }

    /// Drop every registration
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_registered_waiter_gets_ack() {
        let table = AckTable::new();
        table.register(1);
        assert!(table.publish(1));
        assert!(table.wait(1, Duration::from_millis(10)));
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn test_late_waiter_times_out() {
        let table = AckTable::new();
        assert!(!table.publish(2));
        assert!(!table.wait(2, Duration::from_millis(20)));
    }

    #[test]
    fn test_concurrent_distinct_ids() {
        let table = Arc::new(AckTable::new());
        table.register(10);
        table.register(11);
        let waiters: Vec<_> = [10u64, 11]
            .into_iter()
            .map(|id| {
                let table = table.clone();
                thread::spawn(move || table.wait(id, Duration::from_secs(2)))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        table.publish(11);
        table.publish(10);
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }

    #[test]
    fn test_ack_consumed_once() {
        let table = AckTable::new();
        table.register(5);
        table.publish(5);
        assert!(table.wait(5, Duration::from_millis(10)));
        assert!(!table.wait(5, Duration::from_millis(10)));
    }
}
