//! Redis-backed configuration store
//!
//! Lets every node of the mesh see the same membership registry.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::BTreeSet;
use tokio::time::{timeout, Duration};

use super::store::{child_segment, ConfigStore, KEY_SEPARATOR};
use crate::error::{Error, Result};

/// Keys fetched per SCAN round trip
const SCAN_BATCH: usize = 100;

pub struct RedisConfigStore {
    conn: ConnectionManager,
    key_prefix: String,
    op_timeout: Duration,
}

impl RedisConfigStore {
    /// Connect to Redis; `key_prefix` is prepended to every key verbatim
    pub async fn connect(redis_url: &str, key_prefix: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        let conn = timeout(op_timeout, client.get_connection_manager())
            .await
            .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))??;

        tracing::info!(key_prefix = %key_prefix, "Connected to Redis configuration store");

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            op_timeout,
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    /// Run one command bounded by the operation timeout
    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd, what: &str) -> Result<T> {
        let mut conn = self.conn.clone();
        timeout(self.op_timeout, cmd.query_async::<T>(&mut conn))
            .await
            .map_err(|_| Error::Timeout(format!("Redis {what} timed out")))?
            .map_err(Error::from)
    }

    /// All keys matching `pattern`, using SCAN rather than KEYS
    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor).arg("MATCH").arg(pattern).arg("COUNT").arg(SCAN_BATCH);
            let (next, batch): (u64, Vec<String>) = self.query(&cmd, "SCAN").await?;

            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }
}

/// Escape glob metacharacters so `value` matches literally in a SCAN pattern
fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl ConfigStore for RedisConfigStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(self.full_key(key));
        self.query(&cmd, "GET").await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.full_key(key)).arg(value);
        self.query(&cmd, "SET").await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key);
        let mut keys = self
            .scan(&format!("{}{KEY_SEPARATOR}*", escape_glob(&full_key)))
            .await?;
        keys.push(full_key);

        let mut cmd = redis::cmd("DEL");
        cmd.arg(&keys);
        self.query(&cmd, "DEL").await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let full_path = self.full_key(path);
        let keys = self
            .scan(&format!("{}{KEY_SEPARATOR}*", escape_glob(&full_path)))
            .await?;

        let names: BTreeSet<&str> = keys
            .iter()
            .filter_map(|key| child_segment(&full_path, key))
            .collect();
        Ok(names.into_iter().map(ToString::to_string).collect())
    }
}
