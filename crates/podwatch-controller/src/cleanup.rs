//! Pod cleanup
//!
//! Deletes terminated pods whose run is finished or has no record at all. A
//! terminated pod for a run that is not finished stays put: the run may be
//! between attempts and about to get a new pod.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use podwatch_common::{Result, Run};
use podwatch_registry::RunRegistry;
use tracing::{debug, info, warn};

use crate::cluster::{pod_name, run_name_label, ClusterFacade};

/// What one cleanup pass did
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupTick {
    /// Pods deleted
    pub deleted: usize,
    /// Pods kept because their run is still in flight
    pub kept: usize,
    /// Pods skipped because they carry no run label
    pub foreign: usize,
}

/// Removes terminated pods that no run needs any more
pub struct PodCleanup {
    cluster: Arc<ClusterFacade>,
    registry: Arc<dyn RunRegistry>,
}

impl PodCleanup {
    /// Create a cleanup over the cluster and registry
    pub fn new(cluster: Arc<ClusterFacade>, registry: Arc<dyn RunRegistry>) -> Self {
        Self { cluster, registry }
    }

    /// List this engine's pods and clean up the terminated ones
    pub async fn tick(&self) -> Result<CleanupTick> {
        let pods = self.cluster.list_partitioned().await?;
        self.clean(&pods.terminated).await
    }

    /// Clean up the given terminated pods
    pub async fn clean(&self, terminated: &[Pod]) -> Result<CleanupTick> {
        let mut report = CleanupTick::default();
        if terminated.is_empty() {
            return Ok(report);
        }

        let runs: HashMap<String, Run> = self
            .registry
            .get_all_runs()
            .await?
            .into_iter()
            .map(|run| (run.name.clone(), run))
            .collect();

        for pod in terminated {
            let name = pod_name(pod);
            let Some(run_name) = run_name_label(pod) else {
                debug!(pod = %name, "Pod has no run label, leaving it");
                report.foreign += 1;
                continue;
            };

            let why = match runs.get(run_name) {
                None => "run no longer exists",
                Some(run) if run.is_finished() => "run is finished",
                Some(run) => {
                    debug!(
                        pod = %name,
                        run = %run_name,
                        status = ?run.status,
                        "Terminated pod's run is still in flight, keeping pod"
                    );
                    report.kept += 1;
                    continue;
                }
            };

            info!(pod = %name, run = %run_name, "Cleaning up terminated pod, {}", why);
            match self.cluster.delete_pod(pod).await {
                Ok(()) => report.deleted += 1,
                Err(e) => warn!(pod = %name, run = %run_name, error = %e, "Failed to delete terminated pod"),
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::test_pods::pod;
    use crate::cluster::MockPodClient;
    use podwatch_common::retry::RetryConfig;
    use podwatch_common::{Error, RunStatus};
    use podwatch_registry::MockRunRegistry;
    use std::sync::Mutex;

    fn cleanup_with(
        runs: Vec<Run>,
        pods: Vec<Pod>,
    ) -> (PodCleanup, Arc<Mutex<Vec<String>>>) {
        let deleted = Arc::new(Mutex::new(Vec::new()));

        let mut client = MockPodClient::new();
        client
            .expect_list_pods()
            .returning(move |_, _| Ok(pods.clone()));
        let d = deleted.clone();
        client.expect_delete_pod().returning(move |_, name| {
            d.lock().unwrap().push(name.to_string());
            Ok(())
        });

        let mut registry = MockRunRegistry::new();
        registry
            .expect_get_all_runs()
            .returning(move || Ok(runs.clone()));

        let cluster = Arc::new(
            ClusterFacade::new(Arc::new(client), "galasa", "k8s-standard-engine")
                .with_retry(RetryConfig::no_retry()),
        );
        (PodCleanup::new(cluster, Arc::new(registry)), deleted)
    }

    #[tokio::test]
    async fn story_ten_pods_three_without_runs() {
        let mut pods = Vec::new();
        let mut runs = Vec::new();
        for i in 0..10 {
            let run_name = format!("U{i}");
            pods.push(pod(&format!("P{i}"), Some(run_name.as_str()), Some("Failed")));
            if i >= 3 {
                runs.push(Run::new(format!("U{i}")).with_status(RunStatus::Waiting));
            }
        }
        let (cleanup, deleted) = cleanup_with(runs, pods);

        let report = cleanup.tick().await.unwrap();

        assert_eq!(report.deleted, 3);
        assert_eq!(report.kept, 7);
        assert_eq!(*deleted.lock().unwrap(), vec!["P0", "P1", "P2"]);
    }

    #[tokio::test]
    async fn finished_runs_lose_their_pods() {
        let (cleanup, deleted) = cleanup_with(
            vec![
                Run::new("U1").with_status(RunStatus::Finished),
                Run::new("U2").with_status(RunStatus::Ending),
                Run::new("U3").with_status(RunStatus::Queued),
            ],
            vec![
                pod("P1", Some("U1"), Some("Succeeded")),
                pod("P2", Some("U2"), Some("Succeeded")),
                pod("P3", Some("U3"), Some("Failed")),
            ],
        );

        let report = cleanup.tick().await.unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(report.kept, 2);
        assert_eq!(*deleted.lock().unwrap(), vec!["P1"]);
    }

    #[tokio::test]
    async fn active_and_foreign_pods_are_never_deleted() {
        let (cleanup, deleted) = cleanup_with(
            vec![],
            vec![
                pod("P1", Some("U1"), Some("Running")),
                pod("P2", None, Some("Failed")),
                pod("P3", Some("U3"), None),
            ],
        );

        let report = cleanup.tick().await.unwrap();

        assert_eq!(report.foreign, 1);
        assert_eq!(report.deleted, 0);
        assert!(deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn nothing_terminated_skips_the_registry() {
        let mut registry = MockRunRegistry::new();
        registry.expect_get_all_runs().never();
        let client = MockPodClient::new();
        let cluster = Arc::new(ClusterFacade::new(
            Arc::new(client),
            "galasa",
            "k8s-standard-engine",
        ));

        let cleanup = PodCleanup::new(cluster, Arc::new(registry));
        assert_eq!(cleanup.clean(&[]).await.unwrap(), CleanupTick::default());
    }

    #[tokio::test]
    async fn registry_failure_deletes_nothing() {
        let mut client = MockPodClient::new();
        client.expect_delete_pod().never();
        let mut registry = MockRunRegistry::new();
        registry
            .expect_get_all_runs()
            .returning(|| Err(Error::store("run.", "etcd unavailable")));

        let cluster = Arc::new(ClusterFacade::new(
            Arc::new(client),
            "galasa",
            "k8s-standard-engine",
        ));
        let cleanup = PodCleanup::new(cluster, Arc::new(registry));

        let err = cleanup
            .clean(&[pod("P1", Some("U1"), Some("Failed"))])
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
