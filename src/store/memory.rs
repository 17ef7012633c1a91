/// Process-local store with TTL bookkeeping and failure injection
use super::KeyValueStore;
use crate::config::types::{Result, SandboxError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Text(String),
    List(Vec<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`KeyValueStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    get_many_calls: AtomicUsize,
    failing_reads: AtomicUsize,
    failing_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` batched reads fail
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` write operations fail
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of `get_many` round trips served so far
    pub fn get_many_calls(&self) -> usize {
        self.get_many_calls.load(Ordering::SeqCst)
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        match self.live(key) {
            Some(Value::List(items)) => items,
            _ => Vec::new(),
        }
    }

    pub fn field(&self, key: &str, field: &str) -> Option<String> {
        match self.live(key) {
            Some(Value::Hash(map)) => map.get(field).cloned(),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.live(key).is_some()
    }

    /// Remaining time to live, if one is set
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.lock().ok()?;
        let expires_at = entries.get(key)?.expires_at?;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }

    fn live(&self, key: &str) -> Option<Value> {
        let entries = self.lock().ok()?;
        let entry = entries.get(key)?;
        if entry.expired(Instant::now()) {
            None
        } else {
            Some(entry.value.clone())
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| SandboxError::Store("memory store lock poisoned".to_string()))
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_write(&self, op: &str) -> Result<()> {
        if Self::take_failure(&self.failing_writes) {
            return Err(SandboxError::Store(format!("injected {} failure", op)));
        }
        Ok(())
    }

    fn purge_expired(entries: &mut HashMap<String, Entry>) {
        let now = Instant::now();
        entries.retain(|_, entry| !entry.expired(now));
    }
}

impl KeyValueStore for MemoryStore {
    fn is_shared(&self) -> bool {
        false
    }

    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.get_many_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_reads) {
            return Err(SandboxError::Store("injected read failure".to_string()));
        }
        let mut entries = self.lock()?;
        Self::purge_expired(&mut entries);
        Ok(keys
            .iter()
            .map(|key| match entries.get(key).map(|e| &e.value) {
                Some(Value::Text(text)) => Some(text.clone()),
                _ => None,
            })
            .collect())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check_write("set")?;
        self.lock()?
            .insert(key.to_string(), Entry::new(Value::Text(value.to_string())));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check_write("delete")?;
        self.lock()?.remove(key);
        Ok(())
    }

    fn append_list(&self, key: &str, values: &[String]) -> Result<()> {
        self.check_write("append")?;
        let mut entries = self.lock()?;
        Self::purge_expired(&mut entries);
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::List(Vec::new())));
        match &mut entry.value {
            Value::List(items) => {
                items.extend(values.iter().cloned());
                Ok(())
            }
            _ => Err(SandboxError::Store(format!("{} is not a list", key))),
        }
    }

    fn set_field(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.check_write("hset")?;
        let mut entries = self.lock()?;
        Self::purge_expired(&mut entries);
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(map) => {
                map.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(SandboxError::Store(format!("{} is not a hash", key))),
        }
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.check_write("expire")?;
        if let Some(entry) = self.lock()?.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batched_read_preserves_key_order() {
        let store = MemoryStore::new();
        store.set("b", "2").unwrap();
        let values = store
            .get_many(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(values, vec![None, Some("2".to_string())]);
        assert_eq!(store.get_many_calls(), 1);
    }

    #[test]
    fn injected_read_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_reads(1);
        assert!(store.get_many(&["a".to_string()]).is_err());
        assert!(store.get_many(&["a".to_string()]).is_ok());
    }

    #[test]
    fn expired_keys_disappear() {
        let store = MemoryStore::new();
        store.set("flag", "1").unwrap();
        store.expire("flag", Duration::from_millis(0)).unwrap();
        assert!(!store.contains("flag"));
        assert_eq!(store.get_many(&["flag".to_string()]).unwrap(), vec![None]);
    }

    #[test]
    fn append_with_meta_sets_ttl_on_both_keys() {
        let store = MemoryStore::new();
        store
            .append_with_meta(
                "logs",
                &["one".to_string()],
                "logs:meta",
                "last_write",
                "123",
                Duration::from_secs(60),
            )
            .unwrap();
        assert_eq!(store.list("logs"), vec!["one".to_string()]);
        assert_eq!(store.field("logs:meta", "last_write").as_deref(), Some("123"));
        assert!(store.ttl("logs").is_some());
        assert!(store.ttl("logs:meta").is_some());
    }

    #[test]
    fn wrong_type_is_an_error() {
        let store = MemoryStore::new();
        store.set("k", "v").unwrap();
        assert!(store.append_list("k", &["x".to_string()]).is_err());
    }
}
