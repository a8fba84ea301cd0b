//! Type aliases for shared state.
//!
//! Listener registries are shared between the facade and the I/O threads
//! as `Arc<parking_lot::RwLock<HashMap<K, V>>>`.
//!
//! ```rust,ignore
//! use printerlink_core::types::*;
//!
//! let listeners: ThreadSafeRwMap<String, u8> = thread_safe_rw_map();
//! listeners.write().insert("id".to_string(), 1);
//! ```

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Read-mostly map, used for listener registries.
pub type ThreadSafeRwMap<K, V> = Arc<RwLock<HashMap<K, V>>>;

/// Creates an empty `ThreadSafeRwMap<K, V>`.
#[inline]
pub fn thread_safe_rw_map<K, V>() -> ThreadSafeRwMap<K, V> {
    Arc::new(RwLock::new(HashMap::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rw_map_across_threads() {
        let map: ThreadSafeRwMap<String, u8> = thread_safe_rw_map();
        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let map = map.clone();
                std::thread::spawn(move || {
                    map.write().insert(format!("listener-{}", i), i);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.read().len(), 4);
        assert_eq!(map.read().get("listener-2"), Some(&2));
    }
}
