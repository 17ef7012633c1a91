/// Redis-backed store
use super::KeyValueStore;
use crate::config::types::{Result, SandboxError};
use std::sync::Mutex;
use std::time::Duration;

/// Synchronous Redis client with one lazily (re)established connection
pub struct RedisStore {
    client: redis::Client,
    conn: Mutex<Option<redis::Connection>>,
}

impl RedisStore {
    /// Parse the URL up front; the connection itself is opened on first use
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| SandboxError::Config(format!("Invalid redis url {:?}: {}", url, e)))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| SandboxError::Store("redis connection lock poisoned".to_string()))?;

        if guard.is_none() {
            *guard = Some(self.client.get_connection()?);
        }
        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => return Err(SandboxError::Store("redis connection unavailable".to_string())),
        };

        match op(conn) {
            Ok(value) => Ok(value),
            Err(err) => {
                // Drop the connection so the next call reconnects.
                if err.is_io_error() || err.is_connection_dropped() {
                    *guard = None;
                }
                Err(err.into())
            }
        }
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

impl KeyValueStore for RedisStore {
    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.with_connection(|conn| redis::cmd("MGET").arg(keys).query(conn))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_connection(|conn| redis::cmd("SET").arg(key).arg(value).query(conn))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with_connection(|conn| redis::cmd("DEL").arg(key).query(conn))
    }

    fn append_list(&self, key: &str, values: &[String]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.with_connection(|conn| redis::cmd("RPUSH").arg(key).arg(values).query(conn))
    }

    fn set_field(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.with_connection(|conn| {
            redis::cmd("HSET")
                .arg(key)
                .arg(field)
                .arg(value)
                .query(conn)
        })
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.with_connection(|conn| {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs(ttl))
                .query(conn)
        })
    }

    fn append_with_meta(
        &self,
        list_key: &str,
        values: &[String],
        meta_key: &str,
        meta_field: &str,
        meta_value: &str,
        ttl: Duration,
    ) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        if !values.is_empty() {
            pipe.cmd("RPUSH").arg(list_key).arg(values).ignore();
        }
        pipe.cmd("HSET")
            .arg(meta_key)
            .arg(meta_field)
            .arg(meta_value)
            .ignore()
            .cmd("EXPIRE")
            .arg(list_key)
            .arg(ttl_secs(ttl))
            .ignore()
            .cmd("EXPIRE")
            .arg(meta_key)
            .arg(ttl_secs(ttl))
            .ignore();
        self.with_connection(|conn| pipe.query(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_rounds_up_to_one_second() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(90)), 90);
    }

    #[test]
    fn unreachable_server_surfaces_store_error() {
        // Port 1 is never a redis server; the failure must be an Err, not a panic.
        let store = RedisStore::open("redis://127.0.0.1:1/").unwrap();
        let err = store.get_many(&["a".to_string()]).unwrap_err();
        assert!(matches!(err, SandboxError::Store(_)));
    }

    #[test]
    fn empty_batches_skip_the_round_trip() {
        let store = RedisStore::open("redis://127.0.0.1:1/").unwrap();
        assert!(store.get_many(&[]).unwrap().is_empty());
        assert!(store.append_list("k", &[]).is_ok());
    }
}
