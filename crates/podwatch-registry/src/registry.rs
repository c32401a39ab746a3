//! Run registry over the dynamic status store
//!
//! A run named `U42` is the set of properties under `run.U42.`:
//!
//! | property             | meaning                                          |
//! |----------------------|--------------------------------------------------|
//! | `status`             | lifecycle status                                 |
//! | `result`             | final result                                     |
//! | `interruptReason`    | `cancelled` / `requeued`                         |
//! | `heartbeat`          | RFC 3339 timestamp of the last heartbeat         |
//! | `local`              | `true` for runs executed outside the cluster     |
//! | `shared.environment` | `true` for shared-environment runs               |
//! | `rasrunid`           | archive document id                              |
//! | `rasActions`         | base64 of a JSON array of deferred archive actions |
//!
//! Components never write these keys directly; they go through
//! [`RunRegistry`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use podwatch_common::{
    Clock, Error, InterruptReason, Result, Run, RunArchiveAction, RunStatus, SystemClock,
    RUN_KEY_PREFIX,
};
use tracing::{debug, info, warn};

use crate::store::StatusStore;

const PROP_STATUS: &str = "status";
const PROP_RESULT: &str = "result";
const PROP_INTERRUPT_REASON: &str = "interruptReason";
const PROP_HEARTBEAT: &str = "heartbeat";
const PROP_LOCAL: &str = "local";
const PROP_SHARED_ENVIRONMENT: &str = "shared.environment";
const PROP_ARCHIVE_RUN_ID: &str = "rasrunid";
const PROP_ARCHIVE_ACTIONS: &str = "rasActions";
const PROP_FINISHED: &str = "finished";

/// Narrow interface to run records
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait RunRegistry: Send + Sync {
    /// Every run record in the store
    async fn get_all_runs(&self) -> Result<Vec<Run>>;

    /// Runs that an engine has picked up and that have not finished
    async fn get_active_runs(&self) -> Result<Vec<Run>>;

    /// One run, `None` if the store has no record of it
    async fn get_run(&self, run_name: &str) -> Result<Option<Run>>;

    /// Ask a run to stop.
    ///
    /// Returns `false` if the run does not exist. Marking an already
    /// interrupted or finished run is a no-op that returns `true`.
    async fn mark_run_interrupted(&self, run_name: &str, reason: InterruptReason) -> Result<bool>;

    /// Move a run to `finished` with the given result and clear its interrupt.
    ///
    /// Returns `false` if the run does not exist.
    async fn mark_run_finished(&self, run_name: &str, result: &str) -> Result<bool>;

    /// Remove every property of a run. Returns `false` if there was none.
    async fn delete(&self, run_name: &str) -> Result<bool>;
}

/// [`RunRegistry`] backed by a [`StatusStore`]
pub struct DssRunRegistry {
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
}

impl DssRunRegistry {
    /// Create a registry over the given store, stamping times from the system clock
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for the `finished` timestamp
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn run_properties(&self, run_name: &str) -> Result<BTreeMap<String, String>> {
        let prefix = run_prefix(run_name);
        let props = self.store.get_prefix(&prefix).await?;
        Ok(props
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|p| (p.to_string(), v)))
            .collect())
    }
}

/// `run.<name>.`
pub fn run_prefix(run_name: &str) -> String {
    format!("{RUN_KEY_PREFIX}.{run_name}.")
}

fn run_key(run_name: &str, property: &str) -> String {
    format!("{RUN_KEY_PREFIX}.{run_name}.{property}")
}

/// Decode archive actions from their stored base64 JSON form
pub fn decode_archive_actions(encoded: &str) -> Result<Vec<RunArchiveAction>> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| Error::serialization(format!("archive actions are not base64: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::serialization(format!("archive actions are not valid JSON: {e}")))
}

/// Encode archive actions to their stored base64 JSON form
pub fn encode_archive_actions(actions: &[RunArchiveAction]) -> Result<String> {
    let json = serde_json::to_vec(actions)
        .map_err(|e| Error::serialization(format!("failed to serialize archive actions: {e}")))?;
    Ok(BASE64.encode(json))
}

fn parse_flag(value: Option<&String>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// Build a [`Run`] from its properties (keys without the `run.<name>.` prefix).
///
/// Malformed values are logged and dropped rather than failing the whole
/// record, so one bad property cannot hide a run from reconciliation.
pub fn decode_run(run_name: &str, props: &BTreeMap<String, String>) -> Run {
    let mut run = Run::new(run_name);

    run.status = props.get(PROP_STATUS).map(|s| RunStatus::parse(s));
    run.result = props.get(PROP_RESULT).cloned();
    run.is_local = parse_flag(props.get(PROP_LOCAL));
    run.is_shared_environment = parse_flag(props.get(PROP_SHARED_ENVIRONMENT));
    run.archive_run_id = props.get(PROP_ARCHIVE_RUN_ID).cloned();

    if let Some(raw) = props.get(PROP_INTERRUPT_REASON) {
        match raw.parse::<InterruptReason>() {
            Ok(reason) => run.interrupt_reason = Some(reason),
            Err(e) => warn!(run = %run_name, value = %raw, error = %e, "Ignoring unparseable interrupt reason"),
        }
    }

    if let Some(raw) = props.get(PROP_HEARTBEAT) {
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(ts) => run.heartbeat = Some(ts.with_timezone(&Utc)),
            Err(e) => warn!(run = %run_name, value = %raw, error = %e, "Ignoring unparseable heartbeat"),
        }
    }

    if let Some(raw) = props.get(PROP_ARCHIVE_ACTIONS) {
        match decode_archive_actions(raw) {
            Ok(actions) => run.archive_actions = actions,
            Err(e) => warn!(run = %run_name, error = %e, "Ignoring unreadable archive actions"),
        }
    }

    run
}

/// Group `run.<name>.<property>` keys by run name
fn group_by_run(props: BTreeMap<String, String>) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut runs: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let prefix = format!("{RUN_KEY_PREFIX}.");
    for (key, value) in props {
        let Some(rest) = key.strip_prefix(&prefix) else {
            continue;
        };
        if let Some((name, property)) = rest.split_once('.') {
            if name.is_empty() || property.is_empty() {
                continue;
            }
            runs.entry(name.to_string())
                .or_default()
                .insert(property.to_string(), value);
        }
    }
    runs
}

#[async_trait]
impl RunRegistry for DssRunRegistry {
    async fn get_all_runs(&self) -> Result<Vec<Run>> {
        let props = self
            .store
            .get_prefix(&format!("{RUN_KEY_PREFIX}."))
            .await?;
        Ok(group_by_run(props)
            .iter()
            .map(|(name, run_props)| decode_run(name, run_props))
            .collect())
    }

    async fn get_active_runs(&self) -> Result<Vec<Run>> {
        let runs = self.get_all_runs().await?;
        Ok(runs.into_iter().filter(Run::is_active).collect())
    }

    async fn get_run(&self, run_name: &str) -> Result<Option<Run>> {
        let props = self.run_properties(run_name).await?;
        if props.is_empty() {
            return Ok(None);
        }
        Ok(Some(decode_run(run_name, &props)))
    }

    async fn mark_run_interrupted(&self, run_name: &str, reason: InterruptReason) -> Result<bool> {
        let props = self.run_properties(run_name).await?;
        if props.is_empty() {
            debug!(run = %run_name, "Cannot interrupt run, no record in the status store");
            return Ok(false);
        }

        let run = decode_run(run_name, &props);
        if run.interrupt_reason.is_some() || run.is_finished() {
            debug!(
                run = %run_name,
                existing = ?run.interrupt_reason,
                status = ?run.status,
                "Run already interrupted or finished, leaving it unchanged"
            );
            return Ok(true);
        }

        let mut updates = BTreeMap::new();
        updates.insert(
            run_key(run_name, PROP_INTERRUPT_REASON),
            reason.as_str().to_string(),
        );

        if let Some(archive_run_id) = &run.archive_run_id {
            let mut actions = run.archive_actions.clone();
            actions.push(RunArchiveAction::finish(archive_run_id, reason));
            updates.insert(
                run_key(run_name, PROP_ARCHIVE_ACTIONS),
                encode_archive_actions(&actions)?,
            );
        }

        self.store.put_all(updates).await?;
        info!(run = %run_name, reason = %reason, "Marked run as interrupted");
        Ok(true)
    }

    async fn mark_run_finished(&self, run_name: &str, result: &str) -> Result<bool> {
        let props = self.run_properties(run_name).await?;
        if props.is_empty() {
            debug!(run = %run_name, "Cannot finish run, no record in the status store");
            return Ok(false);
        }

        let mut updates = BTreeMap::new();
        updates.insert(
            run_key(run_name, PROP_STATUS),
            RunStatus::Finished.as_str().to_string(),
        );
        updates.insert(run_key(run_name, PROP_RESULT), result.to_string());
        updates.insert(
            run_key(run_name, PROP_FINISHED),
            self.clock.now().to_rfc3339(),
        );
        self.store.put_all(updates).await?;

        // Archive actions have been consumed by whoever finished the run.
        self.store
            .delete(&run_key(run_name, PROP_INTERRUPT_REASON))
            .await?;
        self.store
            .delete(&run_key(run_name, PROP_ARCHIVE_ACTIONS))
            .await?;

        info!(run = %run_name, result = %result, "Marked run as finished");
        Ok(true)
    }

    async fn delete(&self, run_name: &str) -> Result<bool> {
        let props = self.run_properties(run_name).await?;
        if props.is_empty() {
            return Ok(false);
        }
        self.store.delete_prefix(&run_prefix(run_name)).await?;
        info!(run = %run_name, "Deleted run record");
        Ok(true)
    }
}
