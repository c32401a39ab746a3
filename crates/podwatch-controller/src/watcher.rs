//! Status-change watcher
//!
//! Subscribes to run properties in the status store and turns changes to
//! `run.<id>.status` keys into [`StatusChangeEvent`]s. Runs on the store's
//! notification thread, so the only work done here is a regex match and a
//! non-blocking channel send.

use std::sync::{Arc, Mutex};

use podwatch_common::{Error, Result, RUN_KEY_PREFIX};
use podwatch_registry::{StatusStore, StoreEvent, StoreWatcher, WatchId};
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const RUN_STATUS_KEY_PATTERN: &str = r"^run\.(\w+?)\.status$";

/// A change to one run's lifecycle status
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChangeEvent {
    /// Run whose status changed
    pub run_name: String,
    /// Status before the change, absent on create
    pub old_value: Option<String>,
    /// Status after the change, absent on delete
    pub new_value: Option<String>,
    /// Kind of change
    pub event_type: StoreEvent,
}

/// Receiving end of the status-change queue
pub type StatusChangeReceiver = mpsc::UnboundedReceiver<StatusChangeEvent>;

/// Filters store notifications down to run status changes
pub struct StatusChangeWatcher {
    pattern: Regex,
    events: mpsc::UnboundedSender<StatusChangeEvent>,
    watch_id: Mutex<Option<WatchId>>,
}

impl StatusChangeWatcher {
    /// Create a watcher and the queue it feeds
    pub fn new() -> Result<(Arc<Self>, StatusChangeReceiver)> {
        let pattern = Regex::new(RUN_STATUS_KEY_PATTERN)
            .map_err(|e| Error::internal_with_context("status-watcher", e.to_string()))?;
        let (events, receiver) = mpsc::unbounded_channel();
        let watcher = Arc::new(Self {
            pattern,
            events,
            watch_id: Mutex::new(None),
        });
        Ok((watcher, receiver))
    }

    /// Subscribe to every run property in the store
    pub fn start_watching(self: &Arc<Self>, store: &dyn StatusStore) -> Result<()> {
        let id = store.watch_prefix(RUN_KEY_PREFIX, self.clone())?;
        let previous = self
            .watch_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(id);
        if let Some(previous) = previous {
            store.unwatch(previous)?;
        }
        debug!(prefix = RUN_KEY_PREFIX, "Watching run status changes");
        Ok(())
    }

    /// Drop the store subscription, if any
    pub fn stop_watching(&self, store: &dyn StatusStore) -> Result<()> {
        let id = self
            .watch_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(id) = id {
            store.unwatch(id)?;
            debug!("Stopped watching run status changes");
        }
        Ok(())
    }

    fn run_name<'k>(&self, key: &'k str) -> Option<&'k str> {
        self.pattern
            .captures(key)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }
}

impl StoreWatcher for StatusChangeWatcher {
    fn property_modified(
        &self,
        key: Option<&str>,
        event: Option<StoreEvent>,
        old_value: Option<&str>,
        new_value: Option<&str>,
    ) {
        let (Some(key), Some(event_type)) = (key, event) else {
            return;
        };
        let Some(run_name) = self.run_name(key) else {
            return;
        };

        trace!(run = %run_name, event = %event_type, "Run status changed");
        let change = StatusChangeEvent {
            run_name: run_name.to_string(),
            old_value: old_value.map(str::to_string),
            new_value: new_value.map(str::to_string),
            event_type,
        };
        if self.events.send(change).is_err() {
            warn!(run = %run_name, "Status change queue closed, dropping event");
        }
    }
}
