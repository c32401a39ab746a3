//! Dynamic status store contract
//!
//! The status store is a distributed key/value store (etcd in production).
//! This crate only consumes its get/put/delete/watch surface; the trait here
//! is that surface.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use podwatch_common::Result;

/// Kind of change reported by a store watch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreEvent {
    /// Key did not exist before
    Created,
    /// Existing key got a new value
    Modified,
    /// Key was removed
    Deleted,
}

impl fmt::Display for StoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoreEvent::Created => "created",
            StoreEvent::Modified => "modified",
            StoreEvent::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Handle returned by [`StatusStore::watch_prefix`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Receives property change notifications from the store.
///
/// Called on the store's own notification thread, so implementations must
/// return quickly and never block. Every argument is optional because the
/// store's client library does not guarantee any of them is populated.
pub trait StoreWatcher: Send + Sync {
    /// A watched property changed
    fn property_modified(
        &self,
        key: Option<&str>,
        event: Option<StoreEvent>,
        old_value: Option<&str>,
        new_value: Option<&str>,
    );
}

/// Key/value operations on the dynamic status store
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Read one property
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read every property whose key starts with `prefix`
    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>>;

    /// Write one property
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Write several properties in one operation
    async fn put_all(&self, properties: BTreeMap<String, String>) -> Result<()>;

    /// Remove one property; removing a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove every property whose key starts with `prefix`
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Subscribe to changes under `prefix`
    fn watch_prefix(&self, prefix: &str, watcher: Arc<dyn StoreWatcher>) -> Result<WatchId>;

    /// Cancel a subscription; unknown ids are ignored
    fn unwatch(&self, id: WatchId) -> Result<()>;
}
