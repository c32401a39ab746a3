//! Dead-heartbeat monitor
//!
//! Requeues runs whose worker has stopped reporting. Two rules apply to each
//! monitored active run:
//!
//! - A reported heartbeat older than the stale threshold is dead at once.
//! - A run that has never reported gets a grace window, measured from the
//!   first tick that saw it without a heartbeat, before it is interrupted.
//!   A run that is still starting up may not have reported yet.
//!
//! Local and shared-environment runs are never checked.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use podwatch_common::{Clock, InterruptReason, Result, Run};
use podwatch_registry::RunRegistry;
use tracing::{debug, info, warn};

/// What one tick decided
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HeartbeatTick {
    /// Runs with a fresh heartbeat
    pub ok: usize,
    /// Runs without a heartbeat still inside their grace window
    pub ignored: usize,
    /// Runs marked interrupted this tick
    pub interrupted: Vec<String>,
    /// Grace-window entries dropped because the run left the active set
    pub forgotten: Vec<String>,
}

/// Detects runs whose heartbeat is stale or never arrived
pub struct DeadHeartbeatMonitor {
    registry: Arc<dyn RunRegistry>,
    clock: Arc<dyn Clock>,
    stale_threshold: TimeDelta,
    missing_grace: TimeDelta,
    /// run name -> first tick it was seen without a heartbeat
    missing_since: HashMap<String, DateTime<Utc>>,
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

impl DeadHeartbeatMonitor {
    /// Create a monitor with the given stale threshold and grace window
    pub fn new(
        registry: Arc<dyn RunRegistry>,
        clock: Arc<dyn Clock>,
        stale_threshold: Duration,
        missing_grace: Duration,
    ) -> Self {
        Self {
            registry,
            clock,
            stale_threshold: to_delta(stale_threshold),
            missing_grace: to_delta(missing_grace),
            missing_since: HashMap::new(),
        }
    }

    /// Runs currently inside their missing-heartbeat grace window
    pub fn tracked_runs(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.missing_since.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// One pass over the active runs
    pub async fn tick(&mut self) -> Result<HeartbeatTick> {
        let runs = self.registry.get_active_runs().await?;
        let now = self.clock.now();
        let mut report = HeartbeatTick::default();

        for run in runs.iter().filter(|run| run.is_heartbeat_monitored()) {
            match run.heartbeat {
                Some(heartbeat) => self.check_reported(run, heartbeat, now, &mut report).await,
                None => self.check_missing(run, now, &mut report).await,
            }
        }

        let active: HashSet<&str> = runs.iter().map(|run| run.name.as_str()).collect();
        let gone: Vec<String> = self
            .missing_since
            .keys()
            .filter(|name| !active.contains(name.as_str()))
            .cloned()
            .collect();
        for name in gone {
            self.missing_since.remove(&name);
            info!(run = %name, "Forgetting run {}, it is no longer active", name);
            report.forgotten.push(name);
        }

        Ok(report)
    }

    async fn check_reported(
        &mut self,
        run: &Run,
        heartbeat: DateTime<Utc>,
        now: DateTime<Utc>,
        report: &mut HeartbeatTick,
    ) {
        self.missing_since.remove(&run.name);

        let age = now - heartbeat;
        if age < self.stale_threshold {
            debug!(run = %run.name, age_secs = age.num_seconds(), "Run {} heartbeat is ok", run.name);
            report.ok += 1;
            return;
        }

        warn!(
            run = %run.name,
            heartbeat = %heartbeat.to_rfc3339(),
            age_secs = age.num_seconds(),
            "Resetting run {}, last heartbeat was {}",
            run.name,
            heartbeat.to_rfc3339()
        );
        if self.interrupt(&run.name).await {
            report.interrupted.push(run.name.clone());
        }
    }

    async fn check_missing(&mut self, run: &Run, now: DateTime<Utc>, report: &mut HeartbeatTick) {
        let since = *self.missing_since.entry(run.name.clone()).or_insert(now);
        let missing_for = now - since;

        if missing_for < self.missing_grace {
            info!(
                run = %run.name,
                missing_secs = missing_for.num_seconds(),
                "Run {} has no heartbeat, ignored",
                run.name
            );
            report.ignored += 1;
            return;
        }

        warn!(
            run = %run.name,
            missing_secs = missing_for.num_seconds(),
            "Interrupting run {}, no heartbeat since {}",
            run.name,
            since.to_rfc3339()
        );
        if self.interrupt(&run.name).await {
            self.missing_since.remove(&run.name);
            report.interrupted.push(run.name.clone());
        }
    }

    /// Mark a run requeued. Returns false if the mark should be retried next
    /// tick; a run that has disappeared needs no retry.
    async fn interrupt(&mut self, run_name: &str) -> bool {
        match self
            .registry
            .mark_run_interrupted(run_name, InterruptReason::Requeued)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                debug!(run = %run_name, "Run vanished before it could be interrupted");
                self.missing_since.remove(run_name);
                false
            }
            Err(e) => {
                warn!(run = %run_name, error = %e, "Failed to mark run interrupted");
                false
            }
        }
    }
}
