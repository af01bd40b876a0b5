use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use globset::{Glob, GlobMatcher};
use serde_json::Value;

use super::traits::{now_ms, report_clamp, MirrorError, MirrorRecord, MirrorStore};

#[derive(Debug, Clone)]
enum Slot {
    Record(Value),
    Counter(i64),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Instant,
    updated_at_ms: i64,
}

impl Entry {
    fn new(slot: Slot, ttl: Duration) -> Self {
        Self {
            slot,
            expires_at: Instant::now() + ttl,
            updated_at_ms: now_ms(),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Current counter value; expired entries and records count as absent.
    fn live_counter(&self, now: Instant) -> Option<i64> {
        match self.slot {
            Slot::Counter(v) if !self.is_expired(now) => Some(v),
            _ => None,
        }
    }
}

/// DashMap-backed mirror for tests, demos and single-process hosts.
pub struct InMemoryMirror {
    data: DashMap<String, Entry>,
}

impl InMemoryMirror {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Number of stored keys, including ones that expired but were not yet read.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    /// Live keys, sorted. Handy for comparing whole-mirror snapshots.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        let now = Instant::now();
        let mut out: Vec<(String, Value)> = self
            .data
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .map(|e| {
                let value = match &e.value().slot {
                    Slot::Record(v) => v.clone(),
                    Slot::Counter(n) => Value::from(*n),
                };
                (e.key().clone(), value)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn matcher(pattern: &str) -> Result<GlobMatcher, MirrorError> {
        Glob::new(pattern)
            .map(|g| g.compile_matcher())
            .map_err(|e| MirrorError::Pattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })
    }
}

impl Default for InMemoryMirror {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MirrorStore for InMemoryMirror {
    async fn get_record(&self, key: &str) -> Result<Option<MirrorRecord>, MirrorError> {
        let now = Instant::now();
        let expired = match self.data.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => {
                let value = match &entry.slot {
                    Slot::Record(v) => v.clone(),
                    Slot::Counter(n) => Value::from(*n),
                };
                return Ok(Some(MirrorRecord {
                    value,
                    updated_at_ms: entry.updated_at_ms,
                }));
            }
            Some(_) => true,
        };

        if expired {
            self.data.remove_if(key, |_, e| e.is_expired(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), MirrorError> {
        self.data.insert(key.to_string(), Entry::new(Slot::Record(value.clone()), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), MirrorError> {
        self.data.remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, MirrorError> {
        let matcher = Self::matcher(pattern)?;
        let doomed: Vec<String> = self
            .data
            .iter()
            .filter(|e| matcher.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in doomed {
            if self.data.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, MirrorError> {
        let now = Instant::now();
        // The entry guard holds the shard lock: read-modify-write is atomic per key.
        let (value, attempted) = match self.data.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let current = occupied.get().live_counter(now).unwrap_or(0);
                let attempted = current.saturating_add(delta);
                let value = attempted.max(0);
                occupied.insert(Entry::new(Slot::Counter(value), ttl));
                (value, attempted)
            }
            MapEntry::Vacant(vacant) => {
                let value = delta.max(0);
                vacant.insert(Entry::new(Slot::Counter(value), ttl));
                (value, delta)
            }
        };

        if attempted < 0 {
            report_clamp("memory", key, attempted);
        }
        Ok(value)
    }

    async fn incr_existing(&self, key: &str, delta: i64, ttl: Duration) -> Result<Option<i64>, MirrorError> {
        let now = Instant::now();
        let MapEntry::Occupied(mut occupied) = self.data.entry(key.to_string()) else {
            return Ok(None);
        };
        let Some(current) = occupied.get().live_counter(now) else {
            if occupied.get().is_expired(now) {
                occupied.remove();
            }
            return Ok(None);
        };

        let attempted = current.saturating_add(delta);
        let value = attempted.max(0);
        occupied.insert(Entry::new(Slot::Counter(value), ttl));
        drop(occupied);

        if attempted < 0 {
            report_clamp("memory", key, attempted);
        }
        Ok(Some(value))
    }

    async fn set_if_absent_or_lower_floor(&self, key: &str, floor: i64, ttl: Duration) -> Result<bool, MirrorError> {
        let now = Instant::now();
        let floor = floor.max(0);
        match self.data.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => match occupied.get().live_counter(now) {
                Some(current) if current >= floor => Ok(false),
                _ => {
                    occupied.insert(Entry::new(Slot::Counter(floor), ttl));
                    Ok(true)
                }
            },
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(Slot::Counter(floor), ttl));
                Ok(true)
            }
        }
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>, MirrorError> {
        let now = Instant::now();
        Ok(self.data.get(key).and_then(|e| e.live_counter(now)))
    }

    async fn set_counter(&self, key: &str, value: i64, ttl: Duration) -> Result<(), MirrorError> {
        self.data.insert(key.to_string(), Entry::new(Slot::Counter(value.max(0)), ttl));
        Ok(())
    }

    async fn scan(&self, pattern: &str, limit: usize) -> Result<Vec<String>, MirrorError> {
        let matcher = Self::matcher(pattern)?;
        let now = Instant::now();
        Ok(self
            .data
            .iter()
            .filter(|e| !e.value().is_expired(now) && matcher.is_match(e.key()))
            .map(|e| e.key().clone())
            .take(limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_set_and_get() {
        let store = InMemoryMirror::new();
        store.set("item:b-1", &json!({"status": "active"}), TTL).await.unwrap();

        let value = store.get("item:b-1").await.unwrap();
        assert_eq!(value, Some(json!({"status": "active"})));

        let record = store.get_record("item:b-1").await.unwrap().unwrap();
        assert!(record.updated_at_ms > 0);
    }

    #[tokio::test]
    async fn test_get_nonexistent_returns_none() {
        let store = InMemoryMirror::new();
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_record_is_absent() {
        let store = InMemoryMirror::new();
        store.set("item:old", &json!(1), Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(store.get("item:old").await.unwrap().is_none());
        // Expired read also evicts
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_nonexistent_is_ok() {
        let store = InMemoryMirror::new();
        assert!(store.delete("nonexistent").await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_pattern() {
        let store = InMemoryMirror::new();
        store.set("list:exam:1:page:1", &json!([]), TTL).await.unwrap();
        store.set("list:exam:1:page:2", &json!([]), TTL).await.unwrap();
        store.set("list:exam:2:page:1", &json!([]), TTL).await.unwrap();

        assert_eq!(store.delete_pattern("list:exam:1:*").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.delete_pattern("nothing:*").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_incr_by_creates_and_accumulates() {
        let store = InMemoryMirror::new();
        assert_eq!(store.incr_by("count:exam:1", 3, TTL).await.unwrap(), 3);
        assert_eq!(store.incr_by("count:exam:1", -1, TTL).await.unwrap(), 2);
        assert_eq!(store.get_counter("count:exam:1").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_incr_by_clamps_at_zero() {
        let store = InMemoryMirror::new();
        store.set_counter("count:exam:1", 1, TTL).await.unwrap();

        assert_eq!(store.incr_by("count:exam:1", -5, TTL).await.unwrap(), 0);
        assert_eq!(store.get_counter("count:exam:1").await.unwrap(), Some(0));

        // Absent counter decremented also clamps
        assert_eq!(store.incr_by("count:exam:2", -1, TTL).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_incr_existing_leaves_absent_and_expired_counters_alone() {
        let store = InMemoryMirror::new();

        assert_eq!(store.incr_existing("count:exam:1", -1, TTL).await.unwrap(), None);
        assert_eq!(store.get_counter("count:exam:1").await.unwrap(), None);

        store.set_counter("count:exam:2", 1, Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.incr_existing("count:exam:2", -1, TTL).await.unwrap(), None);
        assert_eq!(store.get_counter("count:exam:2").await.unwrap(), None);

        store.set_counter("count:exam:3", 2, TTL).await.unwrap();
        assert_eq!(store.incr_existing("count:exam:3", -1, TTL).await.unwrap(), Some(1));
        assert_eq!(store.incr_existing("count:exam:3", -4, TTL).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_floor_only_raises() {
        let store = InMemoryMirror::new();
        assert!(store.set_if_absent_or_lower_floor("capacity:e", 5, TTL).await.unwrap());
        assert!(!store.set_if_absent_or_lower_floor("capacity:e", 3, TTL).await.unwrap());
        assert_eq!(store.get_counter("capacity:e").await.unwrap(), Some(5));
        assert!(store.set_if_absent_or_lower_floor("capacity:e", 9, TTL).await.unwrap());
        assert_eq!(store.get_counter("capacity:e").await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_scan_respects_limit_and_pattern() {
        let store = InMemoryMirror::new();
        for i in 0..10 {
            store.set_counter(&format!("count:exam:{}", i), i, TTL).await.unwrap();
        }
        store.set("item:b-1", &json!({}), TTL).await.unwrap();

        let keys = store.scan("count:*", 4).await.unwrap();
        assert_eq!(keys.len(), 4);
        assert!(keys.iter().all(|k| k.starts_with("count:")));
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_error() {
        let store = InMemoryMirror::new();
        assert!(matches!(store.delete_pattern("list:[").await, Err(MirrorError::Pattern { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_incr_no_lost_updates() {
        let store = Arc::new(InMemoryMirror::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    store.incr_by("count:hot", 1, TTL).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get_counter("count:hot").await.unwrap(), Some(1000));
    }
}
