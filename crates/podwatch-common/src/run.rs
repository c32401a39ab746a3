//! Run domain types
//!
//! A run is one logical test execution. Its authoritative state lives in the
//! dynamic status store; these types are the decoded, read-only view that
//! the reconciliation loops reason about.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle status of a run
///
/// Parsing is case-insensitive. Statuses this controller does not know about
/// are preserved in [`RunStatus::Unknown`] and treated as non-terminal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RunStatus {
    /// Submitted, waiting for an engine
    Queued,
    /// Claimed by an engine controller, pod not yet running
    Allocated,
    /// Pod started
    Started,
    /// Building the test environment
    Building,
    /// Provisioning start
    ProvStart,
    /// Generating test resources
    Generating,
    /// Executing test methods
    Running,
    /// Test methods complete
    RunDone,
    /// Shared environment is up
    Up,
    /// Discarding the test environment
    Discarding,
    /// Ending
    Ending,
    /// Waiting to be requeued
    Waiting,
    /// Terminal
    Finished,
    /// A status string this controller does not recognise
    Unknown(String),
}

impl RunStatus {
    /// Status string as stored in the status store
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Allocated => "allocated",
            RunStatus::Started => "started",
            RunStatus::Building => "building",
            RunStatus::ProvStart => "provstart",
            RunStatus::Generating => "generating",
            RunStatus::Running => "running",
            RunStatus::RunDone => "rundone",
            RunStatus::Up => "up",
            RunStatus::Discarding => "discarding",
            RunStatus::Ending => "ending",
            RunStatus::Waiting => "waiting",
            RunStatus::Finished => "finished",
            RunStatus::Unknown(raw) => raw,
        }
    }

    /// Only `finished` is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Finished)
    }

    /// Parse a stored status; never fails
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => RunStatus::Queued,
            "allocated" => RunStatus::Allocated,
            "started" => RunStatus::Started,
            "building" => RunStatus::Building,
            "provstart" => RunStatus::ProvStart,
            "generating" => RunStatus::Generating,
            "running" => RunStatus::Running,
            "rundone" => RunStatus::RunDone,
            "up" => RunStatus::Up,
            "discarding" => RunStatus::Discarding,
            "ending" => RunStatus::Ending,
            "waiting" => RunStatus::Waiting,
            "finished" => RunStatus::Finished,
            _ => RunStatus::Unknown(raw.to_string()),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run was asked to end early
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InterruptReason {
    /// A user cancelled the run
    Cancelled,
    /// The run is to be put back on the queue (e.g. its heartbeat died)
    Requeued,
}

impl InterruptReason {
    /// Canonical string form, also used as the run's final result
    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptReason::Cancelled => "cancelled",
            InterruptReason::Requeued => "requeued",
        }
    }
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterruptReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cancelled" => Ok(InterruptReason::Cancelled),
            "requeued" => Ok(InterruptReason::Requeued),
            other => Err(Error::validation(format!(
                "unknown interrupt reason '{other}', expected cancelled or requeued"
            ))),
        }
    }
}

/// One deferred mutation to a run's record in the result archive
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunArchiveAction {
    /// Archive document id of the run
    pub run_id: String,
    /// Status the archived run should end up with
    #[serde(rename = "desiredRunStatus")]
    pub status: String,
    /// Result the archived run should end up with
    #[serde(rename = "desiredRunResult")]
    pub result: String,
}

impl RunArchiveAction {
    /// Create an action for the given archive run id
    pub fn new(
        run_id: impl Into<String>,
        status: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            status: status.into(),
            result: result.into(),
        }
    }

    /// Action that finishes an archived run with the interrupt reason as its result
    pub fn finish(run_id: impl Into<String>, reason: InterruptReason) -> Self {
        Self::new(run_id, RunStatus::Finished.as_str(), reason.as_str())
    }
}

/// Snapshot of a run as recorded in the status store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Run {
    /// Unique run name (e.g. `U1234`)
    pub name: String,
    /// Lifecycle status, absent if never set
    pub status: Option<RunStatus>,
    /// Final result, set once the run finishes
    pub result: Option<String>,
    /// Set when someone asked the run to stop early
    pub interrupt_reason: Option<InterruptReason>,
    /// Last heartbeat reported by the run's worker
    pub heartbeat: Option<DateTime<Utc>>,
    /// Executed locally rather than in a cluster pod
    pub is_local: bool,
    /// Shared-environment runs are not subject to heartbeat checks
    pub is_shared_environment: bool,
    /// Archive document id, once the run has created one
    pub archive_run_id: Option<String>,
    /// Archive mutations to apply when the run is finalised
    pub archive_actions: Vec<RunArchiveAction>,
}

impl Run {
    /// An empty run record with just a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: None,
            result: None,
            interrupt_reason: None,
            heartbeat: None,
            is_local: false,
            is_shared_environment: false,
            archive_run_id: None,
            archive_actions: Vec::new(),
        }
    }

    /// Set the lifecycle status
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the interrupt reason
    pub fn with_interrupt(mut self, reason: InterruptReason) -> Self {
        self.interrupt_reason = Some(reason);
        self
    }

    /// Set the last heartbeat
    pub fn with_heartbeat(mut self, heartbeat: DateTime<Utc>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Add a pending archive action
    pub fn with_archive_action(mut self, action: RunArchiveAction) -> Self {
        self.archive_actions.push(action);
        self
    }

    /// A run is active once an engine has picked it up and until it finishes
    pub fn is_active(&self) -> bool {
        match &self.status {
            Some(RunStatus::Queued) | Some(RunStatus::Finished) | None => false,
            Some(_) => true,
        }
    }

    /// True when the run's status is `finished`
    pub fn is_finished(&self) -> bool {
        self.status.as_ref().is_some_and(RunStatus::is_terminal)
    }

    /// Whether the dead-heartbeat check applies to this run
    pub fn is_heartbeat_monitored(&self) -> bool {
        !self.is_local && !self.is_shared_environment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_is_case_insensitive() {
        assert_eq!(RunStatus::parse("FINISHED"), RunStatus::Finished);
        assert_eq!(RunStatus::parse("Running"), RunStatus::Running);
        assert_eq!(RunStatus::parse(" provstart "), RunStatus::ProvStart);
    }

    #[test]
    fn unknown_status_is_preserved_and_non_terminal() {
        let status = RunStatus::parse("paused");
        assert_eq!(status, RunStatus::Unknown("paused".to_string()));
        assert_eq!(status.as_str(), "paused");
        assert!(!status.is_terminal());
    }

    #[test]
    fn interrupt_reason_parses_any_case_to_canonical_form() {
        assert_eq!(
            "Cancelled".parse::<InterruptReason>().unwrap(),
            InterruptReason::Cancelled
        );
        assert_eq!(
            "REQUEUED".parse::<InterruptReason>().unwrap(),
            InterruptReason::Requeued
        );
        assert_eq!(InterruptReason::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn unknown_interrupt_reason_is_a_validation_error() {
        let err = "hung".parse::<InterruptReason>().unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("hung"));
    }

    #[test]
    fn archive_action_uses_stored_json_field_names() {
        let action = RunArchiveAction::finish("cdb-1", InterruptReason::Requeued);
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "runId": "cdb-1",
                "desiredRunStatus": "finished",
                "desiredRunResult": "requeued",
            })
        );
    }

    #[test]
    fn activity_excludes_queued_finished_and_statusless_runs() {
        assert!(!Run::new("U1").is_active());
        assert!(!Run::new("U1").with_status(RunStatus::Queued).is_active());
        assert!(!Run::new("U1").with_status(RunStatus::Finished).is_active());
        assert!(Run::new("U1").with_status(RunStatus::Allocated).is_active());
        assert!(Run::new("U1").with_status(RunStatus::Running).is_active());
        assert!(Run::new("U1")
            .with_status(RunStatus::Unknown("paused".into()))
            .is_active());
    }

    #[test]
    fn local_and_shared_runs_are_not_heartbeat_monitored() {
        let mut run = Run::new("U1").with_status(RunStatus::Running);
        assert!(run.is_heartbeat_monitored());

        run.is_local = true;
        assert!(!run.is_heartbeat_monitored());

        run.is_local = false;
        run.is_shared_environment = true;
        assert!(!run.is_heartbeat_monitored());
    }
}
