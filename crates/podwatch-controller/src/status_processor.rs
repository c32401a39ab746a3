//! Consumer of the status-change queue
//!
//! Tells registered listeners when a run has finished, either because its
//! status moved to `finished` or because its status property was deleted.

use std::sync::Arc;

use podwatch_common::RunStatus;
use podwatch_registry::StoreEvent;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::watcher::{StatusChangeEvent, StatusChangeReceiver};

/// Notified once per run that reaches the end of its lifecycle
pub trait RunFinishedListener: Send + Sync {
    /// `run_name` has finished or its record was removed
    fn run_finished(&self, run_name: &str);
}

/// Wakes whoever waits on the notify (e.g. the pod cleanup loop)
impl RunFinishedListener for Notify {
    fn run_finished(&self, _run_name: &str) {
        self.notify_one();
    }
}

/// Dispatches status changes to [`RunFinishedListener`]s
#[derive(Default)]
pub struct StatusChangeProcessor {
    listeners: Vec<Arc<dyn RunFinishedListener>>,
}

fn is_finish(event: &StatusChangeEvent) -> bool {
    match event.event_type {
        StoreEvent::Deleted => true,
        StoreEvent::Created | StoreEvent::Modified => event
            .new_value
            .as_deref()
            .is_some_and(|v| RunStatus::parse(v).is_terminal()),
    }
}

impl StatusChangeProcessor {
    /// Create a processor with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener
    pub fn add_listener(&mut self, listener: Arc<dyn RunFinishedListener>) {
        self.listeners.push(listener);
    }

    /// Handle one event. Returns true if listeners were notified.
    pub fn process(&self, event: &StatusChangeEvent) -> bool {
        if !is_finish(event) {
            debug!(
                run = %event.run_name,
                from = ?event.old_value,
                to = ?event.new_value,
                "Run status changed"
            );
            return false;
        }

        info!(run = %event.run_name, event = %event.event_type, "Run finished");
        for listener in &self.listeners {
            listener.run_finished(&event.run_name);
        }
        true
    }

    /// Consume events until the queue closes or `cancel` fires
    pub async fn run(self, mut events: StatusChangeReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.process(&event);
                    }
                    None => break,
                },
            }
        }
        debug!("Status change processor stopped");
    }
}
