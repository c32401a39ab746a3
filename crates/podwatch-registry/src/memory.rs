//! In-process status store and result archive
//!
//! Used by the controller when no external store is configured (local
//! development) and by tests that want real store semantics, including
//! watch notifications.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use podwatch_common::Result;
use tracing::trace;

use crate::archive::{ArchivedRun, ResultArchive};
use crate::store::{StatusStore, StoreEvent, StoreWatcher, WatchId};

struct Subscription {
    id: WatchId,
    prefix: String,
    watcher: Arc<dyn StoreWatcher>,
}

struct Change {
    key: String,
    event: StoreEvent,
    old_value: Option<String>,
    new_value: Option<String>,
}

/// A status store held in memory
#[derive(Default)]
pub struct MemoryStatusStore {
    properties: RwLock<BTreeMap<String, String>>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_watch_id: AtomicU64,
}

impl MemoryStatusStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with properties; no watchers are notified
    pub fn with_properties<I, K, V>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        {
            let mut props = store.write_props();
            for (k, v) in properties {
                props.insert(k.into(), v.into());
            }
        }
        store
    }

    /// Synchronous read, for assertions
    pub fn value(&self, key: &str) -> Option<String> {
        self.read_props().get(key).cloned()
    }

    fn read_props(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, String>> {
        self.properties.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_props(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, String>> {
        self.properties.write().unwrap_or_else(|e| e.into_inner())
    }

    // Called with no lock on `properties` held, so watchers may read the store.
    fn notify(&self, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }
        let targets: Vec<(String, Arc<dyn StoreWatcher>)> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|s| (s.prefix.clone(), s.watcher.clone()))
            .collect();

        for change in changes {
            for (prefix, watcher) in &targets {
                if change.key.starts_with(prefix.as_str()) {
                    watcher.property_modified(
                        Some(&change.key),
                        Some(change.event),
                        change.old_value.as_deref(),
                        change.new_value.as_deref(),
                    );
                }
            }
        }
    }

    fn apply_put(props: &mut BTreeMap<String, String>, key: String, value: String) -> Change {
        let old_value = props.insert(key.clone(), value.clone());
        let event = if old_value.is_some() {
            StoreEvent::Modified
        } else {
            StoreEvent::Created
        };
        Change {
            key,
            event,
            old_value,
            new_value: Some(value),
        }
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.value(key))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .read_props()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let change = {
            let mut props = self.write_props();
            Self::apply_put(&mut props, key.to_string(), value.to_string())
        };
        trace!(key = %key, "put");
        self.notify(vec![change]);
        Ok(())
    }

    async fn put_all(&self, properties: BTreeMap<String, String>) -> Result<()> {
        let changes = {
            let mut props = self.write_props();
            properties
                .into_iter()
                .map(|(k, v)| Self::apply_put(&mut props, k, v))
                .collect()
        };
        self.notify(changes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let removed = self.write_props().remove(key);
        if let Some(old) = removed {
            self.notify(vec![Change {
                key: key.to_string(),
                event: StoreEvent::Deleted,
                old_value: Some(old),
                new_value: None,
            }]);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let changes = {
            let mut props = self.write_props();
            let keys: Vec<String> = props
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| {
                    props.remove(&key).map(|old| Change {
                        key,
                        event: StoreEvent::Deleted,
                        old_value: Some(old),
                        new_value: None,
                    })
                })
                .collect()
        };
        self.notify(changes);
        Ok(())
    }

    fn watch_prefix(&self, prefix: &str, watcher: Arc<dyn StoreWatcher>) -> Result<WatchId> {
        let id = WatchId(self.next_watch_id.fetch_add(1, Ordering::SeqCst));
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscription {
                id,
                prefix: prefix.to_string(),
                watcher,
            });
        Ok(id)
    }

    fn unwatch(&self, id: WatchId) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| s.id != id);
        Ok(())
    }
}

/// A result archive held in memory
#[derive(Default)]
pub struct MemoryArchive {
    runs: RwLock<HashMap<String, ArchivedRun>>,
}

impl MemoryArchive {
    /// Create an empty archive
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an archived run record
    pub fn insert(&self, run: ArchivedRun) {
        self.runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run.run_id.clone(), run);
    }

    /// Synchronous read, for assertions
    pub fn record(&self, run_id: &str) -> Option<ArchivedRun> {
        self.runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .cloned()
    }
}

#[async_trait]
impl ResultArchive for MemoryArchive {
    async fn get_run(&self, run_id: &str) -> Result<Option<ArchivedRun>> {
        Ok(self.record(run_id))
    }

    async fn update_run(&self, run: &ArchivedRun) -> Result<()> {
        self.insert(run.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingWatcher {
        seen: Mutex<Vec<(String, StoreEvent, Option<String>, Option<String>)>>,
    }

    impl StoreWatcher for RecordingWatcher {
        fn property_modified(
            &self,
            key: Option<&str>,
            event: Option<StoreEvent>,
            old_value: Option<&str>,
            new_value: Option<&str>,
        ) {
            if let (Some(key), Some(event)) = (key, event) {
                self.seen.lock().unwrap().push((
                    key.to_string(),
                    event,
                    old_value.map(str::to_string),
                    new_value.map(str::to_string),
                ));
            }
        }
    }

    #[tokio::test]
    async fn get_prefix_returns_only_matching_keys() {
        let store = MemoryStatusStore::with_properties([
            ("run.U1.status", "running"),
            ("run.U1.heartbeat", "2024-01-01T00:00:00Z"),
            ("run.U2.status", "queued"),
            ("lock.U1", "x"),
        ]);

        let props = store.get_prefix("run.U1.").await.unwrap();
        assert_eq!(props.len(), 2);
        assert!(props.contains_key("run.U1.status"));
        assert!(!props.contains_key("run.U2.status"));
    }

    #[tokio::test]
    async fn watchers_see_create_modify_and_delete() {
        let store = MemoryStatusStore::new();
        let watcher = Arc::new(RecordingWatcher::default());
        store.watch_prefix("run", watcher.clone()).unwrap();

        store.put("run.U1.status", "allocated").await.unwrap();
        store.put("run.U1.status", "running").await.unwrap();
        store.delete("run.U1.status").await.unwrap();
        store.put("other.key", "ignored").await.unwrap();

        let seen = watcher.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].1, StoreEvent::Created);
        assert_eq!(seen[1].1, StoreEvent::Modified);
        assert_eq!(seen[1].2.as_deref(), Some("allocated"));
        assert_eq!(seen[2].1, StoreEvent::Deleted);
        assert_eq!(seen[2].3, None);
    }

    #[tokio::test]
    async fn unwatched_subscribers_stop_receiving() {
        let store = MemoryStatusStore::new();
        let watcher = Arc::new(RecordingWatcher::default());
        let id = store.watch_prefix("run", watcher.clone()).unwrap();

        store.put("run.U1.status", "running").await.unwrap();
        store.unwatch(id).unwrap();
        store.put("run.U1.status", "finished").await.unwrap();

        assert_eq!(watcher.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_missing_key_is_silent() {
        let store = MemoryStatusStore::new();
        let watcher = Arc::new(RecordingWatcher::default());
        store.watch_prefix("", watcher.clone()).unwrap();

        store.delete("run.U9.status").await.unwrap();
        assert!(watcher.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_prefix_removes_the_whole_run() {
        let store = MemoryStatusStore::with_properties([
            ("run.U1.status", "finished"),
            ("run.U1.result", "passed"),
            ("run.U10.status", "running"),
        ]);

        store.delete_prefix("run.U1.").await.unwrap();

        assert_eq!(store.value("run.U1.status"), None);
        assert_eq!(store.value("run.U1.result"), None);
        assert_eq!(store.value("run.U10.status").as_deref(), Some("running"));
    }
}
