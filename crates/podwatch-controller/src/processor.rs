//! Interrupt event processor
//!
//! The single consumer of the interrupt event queue and the only place run
//! results are finalised. For each event: apply its archive actions, then
//! move the run to `finished` with the interrupt reason as its result.
//!
//! By the time an event is queued its pod is gone, so nothing upstream will
//! queue it again. An event that fails with a transient error is held here
//! and retried with backoff until it succeeds.

use std::sync::Arc;
use std::time::Duration;

use podwatch_common::retry::RetryConfig;
use podwatch_common::{Result, RunArchiveAction};
use podwatch_registry::{ResultArchive, RunRegistry};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::interrupt_monitor::{InterruptEventReceiver, RunInterruptEvent};

/// Outcome of applying one archive action
#[derive(Debug, PartialEq, Eq)]
pub enum ArchiveUpdate {
    /// Record changed
    Updated,
    /// No archive holds the run id
    NotArchived,
    /// Record already has the desired status
    AlreadyDone,
}

/// An event waiting for another attempt
struct Deferred {
    event: RunInterruptEvent,
    failures: u32,
    due: Instant,
}

/// Backoff between attempts at a failed event; never gives up on its own
fn default_event_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 0,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
        backoff_multiplier: 2.0,
    }
}

/// Finalises interrupted runs
pub struct InterruptEventProcessor {
    registry: Arc<dyn RunRegistry>,
    archive: Arc<dyn ResultArchive>,
    retry: RetryConfig,
    deferred: Vec<Deferred>,
}

impl InterruptEventProcessor {
    /// Create a processor over the registry and archive
    pub fn new(registry: Arc<dyn RunRegistry>, archive: Arc<dyn ResultArchive>) -> Self {
        Self {
            registry,
            archive,
            retry: default_event_retry(),
            deferred: Vec::new(),
        }
    }

    /// Override the backoff applied to events that failed transiently
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Events waiting for another attempt
    pub fn pending_retries(&self) -> usize {
        self.deferred.len()
    }

    /// Apply one action to the archive
    pub async fn apply_action(&self, action: &RunArchiveAction) -> Result<ArchiveUpdate> {
        let Some(mut record) = self.archive.get_run(&action.run_id).await? else {
            debug!(run_id = %action.run_id, "Run not found in the archive, skipping action");
            return Ok(ArchiveUpdate::NotArchived);
        };

        let already = record
            .status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(&action.status));
        if already {
            debug!(
                run_id = %action.run_id,
                status = %action.status,
                "Archived run already has the desired status, will not update"
            );
            return Ok(ArchiveUpdate::AlreadyDone);
        }

        record.status = Some(action.status.clone());
        record.result = Some(action.result.clone());
        self.archive.update_run(&record).await?;
        info!(
            run_id = %action.run_id,
            status = %action.status,
            result = %action.result,
            "Updated archived run"
        );
        Ok(ArchiveUpdate::Updated)
    }

    /// Finalise one interrupted run.
    ///
    /// Safe to repeat: actions already applied are skipped and finishing a
    /// run twice writes the same values.
    pub async fn process(&self, event: &RunInterruptEvent) -> Result<()> {
        for action in &event.archive_actions {
            self.apply_action(action).await?;
        }

        let result = event.interrupt_reason.as_str();
        if self.registry.mark_run_finished(&event.run_name, result).await? {
            info!(run = %event.run_name, result = %result, "Run finished after interrupt");
        } else {
            info!(run = %event.run_name, "Interrupted run is no longer in the status store");
        }
        Ok(())
    }

    /// Process one event, holding it for retry on a transient failure
    async fn attempt(&mut self, event: RunInterruptEvent, failures: u32) {
        let e = match self.process(&event).await {
            Ok(()) => return,
            Err(e) => e,
        };

        let failures = failures + 1;
        if !e.is_retryable() || !self.retry.allows_retry_after(failures) {
            error!(
                run = %event.run_name,
                reason = %event.interrupt_reason,
                failures,
                error = %e,
                "Failed to process interrupt event, giving up"
            );
            return;
        }

        let delay = self.retry.backoff(failures);
        warn!(
            run = %event.run_name,
            reason = %event.interrupt_reason,
            failures,
            error = %e,
            retry_in_ms = delay.as_millis(),
            "Failed to process interrupt event, will retry"
        );
        self.deferred.push(Deferred {
            event,
            failures,
            due: Instant::now() + delay,
        });
    }

    /// Retry held events, only those whose backoff has elapsed unless `all`
    async fn retry_deferred(&mut self, all: bool) {
        let now = Instant::now();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|d| all || d.due <= now);
        self.deferred = waiting;
        for d in ready {
            self.attempt(d.event, d.failures).await;
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.deferred.iter().map(|d| d.due).min()
    }

    /// Retry every held event, then process everything currently queued
    /// without waiting for more.
    ///
    /// Returns the number of events taken off the queue.
    pub async fn drain(&mut self, events: &mut InterruptEventReceiver) -> usize {
        self.retry_deferred(true).await;
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            self.attempt(event, 0).await;
            count += 1;
        }
        count
    }

    /// Consume events until the queue closes.
    ///
    /// The queue closes once every producer has stopped, so events queued by
    /// a tick that was still running at shutdown are processed too. Held
    /// events get one last attempt before returning.
    pub async fn run(mut self, mut events: InterruptEventReceiver) {
        loop {
            let due = self.next_due();
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.attempt(event, 0).await,
                    None => break,
                },
                _ = async {
                    match due {
                        Some(due) => tokio::time::sleep_until(due).await,
                        None => std::future::pending().await,
                    }
                } => self.retry_deferred(false).await,
            }
        }

        if !self.deferred.is_empty() {
            self.retry_deferred(true).await;
        }
        for d in &self.deferred {
            error!(
                run = %d.event.run_name,
                reason = %d.event.interrupt_reason,
                "Interrupted run left unfinished at shutdown"
            );
        }
        debug!("Interrupt event processor stopped");
    }
}
