//! Remote key-value store
//!
//! The list sink and the cancellation flag store both talk to a remote store through
//! [`KeyValueStore`]. [`RedisStore`] is the production backend; [`MemoryStore`] backs
//! local runs and tests.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::config::types::{Result, StoreConfig};
use std::sync::Arc;
use std::time::Duration;

/// Operations the sinks and the cancellation monitor need from a remote store
pub trait KeyValueStore: Send + Sync {
    /// Batched multi-key read: one round trip, one slot per key in input order
    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Append values to the tail of an ordered list
    fn append_list(&self, key: &str, values: &[String]) -> Result<()>;

    /// Set one field of a hash record
    fn set_field(&self, key: &str, field: &str, value: &str) -> Result<()>;

    fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Whether other processes see the same keys. Cancellation flags written by an
    /// external controller only reach a monitor backed by a shared store.
    fn is_shared(&self) -> bool {
        true
    }

    /// Append lines, stamp the companion metadata record and refresh both TTLs.
    /// Backends able to do this in one round trip should override it.
    fn append_with_meta(
        &self,
        list_key: &str,
        values: &[String],
        meta_key: &str,
        meta_field: &str,
        meta_value: &str,
        ttl: Duration,
    ) -> Result<()> {
        if !values.is_empty() {
            self.append_list(list_key, values)?;
        }
        self.set_field(meta_key, meta_field, meta_value)?;
        self.expire(list_key, ttl)?;
        self.expire(meta_key, ttl)
    }
}

/// Open the store described by `config`: Redis when a URL is set, in-memory otherwise
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn KeyValueStore>> {
    match config.redis_url.as_deref() {
        Some(url) => Ok(Arc::new(RedisStore::open(url)?)),
        None => {
            log::warn!("No redis_url configured, using process-local in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_store_without_url_is_in_memory() {
        let store = open_store(&StoreConfig::default()).unwrap();
        assert!(!store.is_shared());
        store.set("k", "v").unwrap();
        assert_eq!(
            store.get_many(&["k".to_string()]).unwrap(),
            vec![Some("v".to_string())]
        );
    }

    #[test]
    fn open_store_rejects_malformed_url() {
        let config = StoreConfig {
            redis_url: Some("not a url".to_string()),
        };
        assert!(open_store(&config).is_err());
    }
}
