//! Hierarchical key-value store holding the membership registry
//!
//! Keys are `:`-separated paths. Heartbeats live under
//! `{root}:NatsOptions:NatsServerOptions:{server}:Timestamp`.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;

pub const KEY_SEPARATOR: char = ':';
pub const OPTIONS_SECTION: &str = "NatsOptions";
pub const SERVERS_SECTION: &str = "NatsServerOptions";
pub const TIMESTAMP_KEY: &str = "Timestamp";

/// Section whose direct children are the registered server names
#[must_use]
pub fn servers_path(root: &str) -> String {
    format!("{root}{KEY_SEPARATOR}{OPTIONS_SECTION}{KEY_SEPARATOR}{SERVERS_SECTION}")
}

#[must_use]
pub fn server_path(root: &str, server_name: &str) -> String {
    format!("{}{KEY_SEPARATOR}{server_name}", servers_path(root))
}

#[must_use]
pub fn heartbeat_key(root: &str, server_name: &str) -> String {
    format!("{}{KEY_SEPARATOR}{TIMESTAMP_KEY}", server_path(root, server_name))
}

/// First path segment below `path` for a key inside it
pub(crate) fn child_segment<'a>(path: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(path)?
        .strip_prefix(KEY_SEPARATOR)?
        .split(KEY_SEPARATOR)
        .next()
        .filter(|segment| !segment.is_empty())
}

/// Persistent configuration store shared by every cluster member
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete `key` together with everything nested below it
    async fn delete(&self, key: &str) -> Result<()>;

    /// Direct child names of `path`, sorted; empty when the section is absent
    async fn children(&self, path: &str) -> Result<Vec<String>>;
}

/// Process-local store
///
/// Used for single-node deployments and tests; nothing is shared between
/// processes.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let nested = format!("{key}{KEY_SEPARATOR}");
        self.entries
            .write()
            .retain(|k, _| k != key && !k.starts_with(&nested));
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let entries = self.entries.read();
        let names: BTreeSet<&str> = entries
            .keys()
            .filter_map(|key| child_segment(path, key))
            .collect();
        Ok(names.into_iter().map(ToString::to_string).collect())
    }
}
