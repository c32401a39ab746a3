//! Interrupt monitor
//!
//! Each tick pairs this engine's pods with the active runs. A pod whose run
//! carries an interrupt reason is deleted and a [`RunInterruptEvent`] is
//! queued for the interrupt event processor. Once the pod is gone the run no
//! longer matches anything here, so a still-interrupted run produces no
//! further work on later ticks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use podwatch_common::{Error, InterruptReason, Result, Run, RunArchiveAction};
use podwatch_registry::RunRegistry;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cluster::{is_terminating, pod_name, run_name_label, ClusterFacade};

/// Work item for the interrupt event processor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunInterruptEvent {
    /// Run to finalise
    pub run_name: String,
    /// Why the run was interrupted; becomes its result
    pub interrupt_reason: InterruptReason,
    /// Archive updates to apply, in order
    pub archive_actions: Vec<RunArchiveAction>,
}

impl RunInterruptEvent {
    /// Build the event for an interrupted run, `None` if it is not interrupted
    pub fn for_run(run: &Run) -> Option<Self> {
        run.interrupt_reason.map(|reason| Self {
            run_name: run.name.clone(),
            interrupt_reason: reason,
            archive_actions: run.archive_actions.clone(),
        })
    }
}

/// Producer half of the interrupt event queue
pub type InterruptEventSender = mpsc::UnboundedSender<RunInterruptEvent>;
/// Consumer half of the interrupt event queue
pub type InterruptEventReceiver = mpsc::UnboundedReceiver<RunInterruptEvent>;

/// Create the interrupt event queue
pub fn interrupt_queue() -> (InterruptEventSender, InterruptEventReceiver) {
    mpsc::unbounded_channel()
}

/// What one tick did
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InterruptTick {
    /// Pods deleted
    pub pods_deleted: usize,
    /// Events queued
    pub events_queued: usize,
}

/// Deletes pods of interrupted runs and queues their finalisation
pub struct InterruptMonitor {
    cluster: Arc<ClusterFacade>,
    registry: Arc<dyn RunRegistry>,
    events: InterruptEventSender,
}

impl InterruptMonitor {
    /// Create a monitor feeding `events`
    pub fn new(
        cluster: Arc<ClusterFacade>,
        registry: Arc<dyn RunRegistry>,
        events: InterruptEventSender,
    ) -> Self {
        Self {
            cluster,
            registry,
            events,
        }
    }

    /// One reconciliation pass.
    ///
    /// Listing failures abandon the tick. A failed pod delete only skips that
    /// run; its pod is still there next tick, so it will be retried.
    pub async fn tick(&self) -> Result<InterruptTick> {
        let pods = self.cluster.list_pods().await?;
        let runs: HashMap<String, Run> = self
            .registry
            .get_active_runs()
            .await?
            .into_iter()
            .map(|run| (run.name.clone(), run))
            .collect();

        let mut report = InterruptTick::default();
        let mut queued: HashSet<&str> = HashSet::new();
        let mut failed: HashSet<&str> = HashSet::new();

        for pod in &pods {
            let Some(run_name) = run_name_label(pod) else {
                continue;
            };
            let Some(run) = runs.get(run_name) else {
                continue;
            };
            let Some(event) = RunInterruptEvent::for_run(run) else {
                continue;
            };
            // Already being deleted, its event went out when the delete did.
            if is_terminating(pod) {
                debug!(run = %run_name, pod = %pod_name(pod), "Pod of interrupted run is already terminating");
                continue;
            }

            info!(
                run = %run_name,
                pod = %pod_name(pod),
                reason = %event.interrupt_reason,
                "Run is interrupted, deleting its pod"
            );
            if let Err(e) = self.cluster.delete_pod(pod).await {
                warn!(run = %run_name, pod = %pod_name(pod), error = %e, "Failed to delete pod of interrupted run");
                failed.insert(run_name);
                continue;
            }
            report.pods_deleted += 1;

            // A run with several pods still gets a single event.
            if failed.contains(run_name) || !queued.insert(run_name) {
                continue;
            }
            self.events.send(event).map_err(|_| {
                Error::internal_with_context("interrupt-monitor", "interrupt event queue is closed")
            })?;
            report.events_queued += 1;
        }

        debug!(
            pods = pods.len(),
            active_runs = runs.len(),
            deleted = report.pods_deleted,
            queued = report.events_queued,
            "Interrupt monitor tick complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::test_pods::pod;
    use crate::cluster::MockPodClient;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use mockall::predicate::eq;
    use podwatch_common::retry::RetryConfig;
    use podwatch_common::RunStatus;
    use podwatch_registry::MockRunRegistry;

    fn cluster(client: MockPodClient) -> Arc<ClusterFacade> {
        Arc::new(
            ClusterFacade::new(Arc::new(client), "galasa", "k8s-standard-engine")
                .with_retry(RetryConfig::no_retry()),
        )
    }

    fn registry_returning(runs: Vec<Run>) -> MockRunRegistry {
        let mut registry = MockRunRegistry::new();
        registry
            .expect_get_active_runs()
            .returning(move || Ok(runs.clone()));
        registry
    }

    fn cancelled_run(name: &str) -> Run {
        Run::new(name)
            .with_status(RunStatus::Running)
            .with_interrupt(InterruptReason::Cancelled)
            .with_archive_action(RunArchiveAction::finish("cdb-2", InterruptReason::Cancelled))
    }

    #[tokio::test]
    async fn story_cancelled_run_loses_its_pod_and_is_queued() {
        let mut client = MockPodClient::new();
        client
            .expect_list_pods()
            .returning(|_, _| Ok(vec![pod("P1", Some("R2"), Some("Running"))]));
        client
            .expect_delete_pod()
            .with(eq("galasa"), eq("P1"))
            .times(1)
            .returning(|_, _| Ok(()));

        let (tx, mut rx) = interrupt_queue();
        let monitor = InterruptMonitor::new(
            cluster(client),
            Arc::new(registry_returning(vec![cancelled_run("R2")])),
            tx,
        );

        let report = monitor.tick().await.unwrap();

        assert_eq!(
            report,
            InterruptTick {
                pods_deleted: 1,
                events_queued: 1
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            RunInterruptEvent {
                run_name: "R2".to_string(),
                interrupt_reason: InterruptReason::Cancelled,
                archive_actions: vec![RunArchiveAction::finish(
                    "cdb-2",
                    InterruptReason::Cancelled
                )],
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn story_second_tick_finds_nothing_once_the_pod_is_gone() {
        let deleted = Arc::new(std::sync::Mutex::new(false));

        let mut client = MockPodClient::new();
        let d = deleted.clone();
        client.expect_list_pods().returning(move |_, _| {
            if *d.lock().unwrap() {
                Ok(vec![])
            } else {
                Ok(vec![pod("P1", Some("R2"), Some("Running"))])
            }
        });
        let d = deleted.clone();
        client.expect_delete_pod().times(1).returning(move |_, _| {
            *d.lock().unwrap() = true;
            Ok(())
        });

        let (tx, mut rx) = interrupt_queue();
        let monitor = InterruptMonitor::new(
            cluster(client),
            Arc::new(registry_returning(vec![cancelled_run("R2")])),
            tx,
        );

        monitor.tick().await.unwrap();
        let second = monitor.tick().await.unwrap();

        assert_eq!(second, InterruptTick::default());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminating_pod_is_not_deleted_or_queued_again() {
        let mut going = pod("P1", Some("R2"), Some("Running"));
        going.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let mut client = MockPodClient::new();
        client
            .expect_list_pods()
            .returning(move |_, _| Ok(vec![going.clone()]));
        client.expect_delete_pod().never();

        let (tx, mut rx) = interrupt_queue();
        let monitor = InterruptMonitor::new(
            cluster(client),
            Arc::new(registry_returning(vec![cancelled_run("R2")])),
            tx,
        );

        assert_eq!(monitor.tick().await.unwrap(), InterruptTick::default());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn uninterrupted_and_unknown_runs_are_left_alone() {
        let mut client = MockPodClient::new();
        client.expect_list_pods().returning(|_, _| {
            Ok(vec![
                pod("P1", Some("U1"), Some("Running")),
                pod("P2", Some("U-gone"), Some("Running")),
                pod("P3", None, Some("Running")),
            ])
        });
        client.expect_delete_pod().never();

        let (tx, mut rx) = interrupt_queue();
        let monitor = InterruptMonitor::new(
            cluster(client),
            Arc::new(registry_returning(vec![
                Run::new("U1").with_status(RunStatus::Running)
            ])),
            tx,
        );

        assert_eq!(monitor.tick().await.unwrap(), InterruptTick::default());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_with_two_pods_is_queued_once() {
        let mut client = MockPodClient::new();
        client.expect_list_pods().returning(|_, _| {
            Ok(vec![
                pod("P1", Some("R2"), Some("Running")),
                pod("P1-retry", Some("R2"), Some("Pending")),
            ])
        });
        client.expect_delete_pod().times(2).returning(|_, _| Ok(()));

        let (tx, mut rx) = interrupt_queue();
        let monitor = InterruptMonitor::new(
            cluster(client),
            Arc::new(registry_returning(vec![cancelled_run("R2")])),
            tx,
        );

        let report = monitor.tick().await.unwrap();
        assert_eq!(report.pods_deleted, 2);
        assert_eq!(report.events_queued, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_delete_skips_only_that_run() {
        let mut client = MockPodClient::new();
        client.expect_list_pods().returning(|_, _| {
            Ok(vec![
                pod("P1", Some("R1"), Some("Running")),
                pod("P2", Some("R2"), Some("Running")),
            ])
        });
        client
            .expect_delete_pod()
            .with(eq("galasa"), eq("P1"))
            .returning(|_, _| Err(Error::internal("api server timeout")));
        client
            .expect_delete_pod()
            .with(eq("galasa"), eq("P2"))
            .returning(|_, _| Ok(()));

        let (tx, mut rx) = interrupt_queue();
        let monitor = InterruptMonitor::new(
            cluster(client),
            Arc::new(registry_returning(vec![
                cancelled_run("R1"),
                cancelled_run("R2"),
            ])),
            tx,
        );

        let report = monitor.tick().await.unwrap();
        assert_eq!(report.pods_deleted, 1);
        assert_eq!(rx.try_recv().unwrap().run_name, "R2");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn registry_failure_abandons_the_tick() {
        let mut client = MockPodClient::new();
        client
            .expect_list_pods()
            .returning(|_, _| Ok(vec![pod("P1", Some("R2"), Some("Running"))]));
        client.expect_delete_pod().never();

        let mut registry = MockRunRegistry::new();
        registry
            .expect_get_active_runs()
            .returning(|| Err(Error::store("run.", "etcd unavailable")));

        let (tx, _rx) = interrupt_queue();
        let monitor = InterruptMonitor::new(cluster(client), Arc::new(registry), tx);

        assert!(monitor.tick().await.unwrap_err().is_retryable());
    }
}
