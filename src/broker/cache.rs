//! Per-room snapshot cache
//!
//! Holds the most recent host state snapshots (device info, battery,
//! storage, downloads) keyed by snapshot name, each with its own TTL.
//! Expiry is lazy: the read that observes a stale entry removes it, so no
//! sweeper task is needed. Stored values are immutable after insertion.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

// Snapshot keys
pub const DEVICE_INFO: &str = "device_info";
pub const BATTERY: &str = "battery";
pub const STORAGE: &str = "storage";
pub const DOWNLOADS: &str = "downloads";

#[derive(Debug)]
struct CacheEntry {
    data: Value,
    updated_at: Instant,
    ttl: Duration,
}

#[derive(Debug, Default)]
pub struct RoomCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl RoomCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the entry for `key`; the TTL clock restarts now.
    pub fn set(&self, key: &str, data: Value, ttl: Duration) {
        self.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                data,
                updated_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Fetch a live entry. An entry past its TTL is removed and reported
    /// as a miss.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.updated_at.elapsed() <= entry.ttl => Some(entry.data.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_returns_live_entry() {
        let cache = RoomCache::new();
        cache.set(BATTERY, json!({ "level": 42 }), Duration::from_secs(30));
        assert_eq!(cache.get(BATTERY), Some(json!({ "level": 42 })));
    }

    #[test]
    fn get_misses_on_absent_key() {
        let cache = RoomCache::new();
        assert_eq!(cache.get(STORAGE), None);
    }

    #[test]
    fn expired_entry_is_removed_on_read() {
        let cache = RoomCache::new();
        cache.set(DOWNLOADS, json!([1, 2, 3]), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.get(DOWNLOADS), None);
        // A second read must not resurrect it.
        assert_eq!(cache.get(DOWNLOADS), None);
    }

    #[test]
    fn set_restarts_the_ttl_clock() {
        let cache = RoomCache::new();
        cache.set(BATTERY, json!({ "level": 10 }), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(25));
        cache.set(BATTERY, json!({ "level": 11 }), Duration::from_secs(30));
        assert_eq!(cache.get(BATTERY), Some(json!({ "level": 11 })));
    }
}
