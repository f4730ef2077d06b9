//! L1: exact-match hash map keyed by the normalized composite key, with
//! lazy per-entry TTL expiry.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

const DEFAULT_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    expires_at: SystemTime,
}

/// Hash map of composite key to (value, expiry).
pub struct ExactCache {
    map: HashMap<String, Entry>,
}

impl Default for ExactCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ExactCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { map: HashMap::with_capacity(cap) }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Upserts `key`; an existing entry's value and expiry are both
    /// replaced.
    pub fn set(&mut self, key: String, value: String, ttl: Duration) {
        let expires_at = SystemTime::now() + ttl;
        self.map.insert(key, Entry { value, expires_at });
    }

    /// Returns a borrowed view of the value, or `None` on miss. An expired
    /// entry is unlinked before returning a miss, even if no background
    /// sweep has run.
    pub fn get(&mut self, key: &str) -> Option<&str> {
        if self.is_expired(key) {
            self.map.remove(key);
            return None;
        }
        self.map.get(key).map(|e| e.value.as_str())
    }

    fn is_expired(&self, key: &str) -> bool {
        match self.map.get(key) {
            Some(e) => SystemTime::now() > e.expires_at,
            None => false,
        }
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Iterates live (non-expired) entries for snapshotting. Expired
    /// entries are silently skipped here; the next `get` unlinks them.
    pub fn iter_live(&self) -> impl Iterator<Item = (&str, &str, SystemTime)> {
        let now = SystemTime::now();
        self.map
            .iter()
            .filter(move |(_, e)| e.expires_at > now)
            .map(|(k, e)| (k.as_str(), e.value.as_str(), e.expires_at))
    }

    /// Inserts an entry restored from a snapshot, unless it has already
    /// expired by load time.
    pub fn restore(&mut self, key: String, value: String, expires_at: SystemTime) {
        if expires_at > SystemTime::now() {
            self.map.insert(key, Entry { value, expires_at });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_within_ttl_hits() {
        let mut cache = ExactCache::new();
        cache.set("k".into(), "v".into(), Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some("v"));
    }

    #[test]
    fn get_after_ttl_expiry_is_a_miss_and_unlinks() {
        let mut cache = ExactCache::new();
        cache.set("k".into(), "v".into(), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn set_overwrites_value_and_refreshes_expiry() {
        let mut cache = ExactCache::new();
        cache.set("k".into(), "v1".into(), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        cache.set("k".into(), "v2".into(), Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some("v2"));
    }

    #[test]
    fn delete_removes_entry() {
        let mut cache = ExactCache::new();
        cache.set("k".into(), "v".into(), Duration::from_secs(60));
        assert!(cache.delete("k"));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn clear_empties_the_cache() {
        let mut cache = ExactCache::new();
        cache.set("a".into(), "1".into(), Duration::from_secs(60));
        cache.set("b".into(), "2".into(), Duration::from_secs(60));
        cache.clear();
        assert!(cache.is_empty());
    }
}
