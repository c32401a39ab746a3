//! Cluster facade
//!
//! Thin layer over the pods API. Lists this engine's worker pods, splits them
//! by phase, and deletes them. Deleting a pod that is already gone counts as
//! success.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams};
use kube::{Api, Client};
use podwatch_common::retry::{retry_with_backoff, RetryConfig};
use podwatch_common::{is_not_found, Error, Result, ENGINE_CONTROLLER_LABEL, RUN_POD_LABEL};
use tracing::{debug, info};

/// Pod operations against the cluster API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PodClient: Send + Sync {
    /// List pods in `namespace` matching a label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Delete a pod by name. A pod that no longer exists is not an error.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`PodClient`] backed by a kube client
#[derive(Clone)]
pub struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(pod = %name, "Pod already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// The run a pod executes, from its run-name label.
///
/// `None` marks a foreign pod that must never be touched.
pub fn run_name_label(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(RUN_POD_LABEL))
        .map(String::as_str)
        .filter(|name| !name.trim().is_empty())
}

/// Pod name, or an empty string for a pod the API returned without one
pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

/// Whether the API server has accepted a delete for this pod.
///
/// A gracefully deleted pod stays listed until its grace period ends.
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

fn is_terminated(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .is_some_and(|phase| {
            phase.eq_ignore_ascii_case("Succeeded") || phase.eq_ignore_ascii_case("Failed")
        })
}

/// Pods split by phase
#[derive(Debug, Default)]
pub struct PartitionedPods {
    /// Pending, running, or phase not yet reported
    pub active: Vec<Pod>,
    /// Succeeded or failed
    pub terminated: Vec<Pod>,
}

/// Pod access scoped to one namespace and engine controller
pub struct ClusterFacade {
    client: Arc<dyn PodClient>,
    namespace: String,
    engine_label: String,
    retry: RetryConfig,
}

impl ClusterFacade {
    /// Create a facade for the engine's pods in `namespace`
    pub fn new(
        client: Arc<dyn PodClient>,
        namespace: impl Into<String>,
        engine_label: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            engine_label: engine_label.into(),
            retry: RetryConfig::default(),
        }
    }

    /// Override the retry policy used for listing
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Namespace this facade operates in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Label selector for pods launched by this engine controller
    pub fn pod_selector(&self) -> String {
        format!("{ENGINE_CONTROLLER_LABEL}={}", self.engine_label)
    }

    /// List this engine's pods, retrying transient failures.
    pub async fn list_pods(&self) -> Result<Vec<Pod>> {
        let selector = self.pod_selector();
        let client = self.client.as_ref();
        let (namespace, label_selector) = (self.namespace.as_str(), selector.as_str());
        let pods = retry_with_backoff(&self.retry, "list_pods", Error::is_retryable, move || {
            client.list_pods(namespace, label_selector)
        })
        .await?;
        debug!(namespace = %self.namespace, selector = %selector, count = pods.len(), "Listed pods");
        Ok(pods)
    }

    /// Split pods into active and terminated by phase
    pub fn partition_by_phase(pods: Vec<Pod>) -> PartitionedPods {
        let (terminated, active) = pods.into_iter().partition(is_terminated);
        PartitionedPods { active, terminated }
    }

    /// List this engine's pods and split them by phase
    pub async fn list_partitioned(&self) -> Result<PartitionedPods> {
        Ok(Self::partition_by_phase(self.list_pods().await?))
    }

    /// Delete a pod. An already-deleted pod is success.
    pub async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let name = pod_name(pod);
        if name.is_empty() {
            return Err(Error::validation("cannot delete a pod without a name"));
        }
        info!(pod = %name, namespace = %self.namespace, "Deleting pod");
        self.client.delete_pod(&self.namespace, name).await
    }
}
