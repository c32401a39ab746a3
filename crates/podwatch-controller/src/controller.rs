//! Controller runtime
//!
//! Wires the monitors to their collaborators and runs them:
//!
//! - one periodic task each for the interrupt monitor, the dead-heartbeat
//!   monitor and pod cleanup
//! - the interrupt event processor, the only consumer of the interrupt queue
//! - the status-change processor, fed by the store watch
//!
//! The periodic tasks stop when the cancellation token fires, after any tick
//! already in progress. The interrupt event processor keeps going until the
//! interrupt monitor has stopped and the queue is empty.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use podwatch_common::{Clock, Result, SystemClock};
use podwatch_registry::{DssRunRegistry, ResultArchive, RunRegistry, StatusStore};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cleanup::PodCleanup;
use crate::cluster::{ClusterFacade, PodClient};
use crate::config::Settings;
use crate::heartbeat::DeadHeartbeatMonitor;
use crate::interrupt_monitor::{interrupt_queue, InterruptMonitor};
use crate::launcher::ThrottledLauncher;
use crate::processor::InterruptEventProcessor;
use crate::status_processor::StatusChangeProcessor;
use crate::watcher::StatusChangeWatcher;

/// External collaborators the controller runs against
#[derive(Clone)]
pub struct Context {
    /// Pods API
    pub pods: Arc<dyn PodClient>,
    /// Dynamic status store
    pub store: Arc<dyn StatusStore>,
    /// Result archive
    pub archive: Arc<dyn ResultArchive>,
    /// Time source for heartbeat ageing and launch throttling
    pub clock: Arc<dyn Clock>,
}

impl Context {
    /// Create a context using the system clock
    pub fn new(
        pods: Arc<dyn PodClient>,
        store: Arc<dyn StatusStore>,
        archive: Arc<dyn ResultArchive>,
    ) -> Self {
        Self {
            pods,
            store,
            archive,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// One reconciliation loop driven by [`run_periodic`]
#[async_trait]
trait Reconciler: Send + 'static {
    fn name(&self) -> &'static str;

    async fn reconcile(&mut self) -> Result<()>;
}

#[async_trait]
impl Reconciler for InterruptMonitor {
    fn name(&self) -> &'static str {
        "interrupt-monitor"
    }

    async fn reconcile(&mut self) -> Result<()> {
        let tick = self.tick().await?;
        if tick.events_queued > 0 {
            info!(
                deleted = tick.pods_deleted,
                queued = tick.events_queued,
                "Queued interrupted runs for finalisation"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for DeadHeartbeatMonitor {
    fn name(&self) -> &'static str {
        "heartbeat-monitor"
    }

    async fn reconcile(&mut self) -> Result<()> {
        let tick = self.tick().await?;
        debug!(
            ok = tick.ok,
            ignored = tick.ignored,
            interrupted = tick.interrupted.len(),
            forgotten = tick.forgotten.len(),
            "Heartbeat check complete"
        );
        Ok(())
    }
}

#[async_trait]
impl Reconciler for PodCleanup {
    fn name(&self) -> &'static str {
        "pod-cleanup"
    }

    async fn reconcile(&mut self) -> Result<()> {
        let tick = self.tick().await?;
        debug!(
            deleted = tick.deleted,
            kept = tick.kept,
            foreign = tick.foreign,
            "Pod cleanup complete"
        );
        Ok(())
    }
}

/// Run `task` every `period` until cancelled.
///
/// A failed tick is logged and the next tick starts from scratch. `wake`
/// triggers an early tick.
async fn run_periodic<T: Reconciler>(
    mut task: T,
    period: Duration,
    cancel: CancellationToken,
    wake: Option<Arc<Notify>>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let name = task.name();
    debug!(task = name, period_ms = period.as_millis(), "Starting periodic task");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
            _ = async {
                match &wake {
                    Some(wake) => wake.notified().await,
                    None => std::future::pending().await,
                }
            } => {
                debug!(task = name, "Woken early");
                interval.reset();
            }
        }

        if let Err(e) = task.reconcile().await {
            if e.is_retryable() {
                warn!(task = name, error = %e, "Tick failed, will retry next tick");
            } else {
                error!(task = name, error = %e, "Tick failed");
            }
        }
    }
    debug!(task = name, "Periodic task stopped");
}

/// The assembled controller
pub struct Controller {
    settings: Settings,
    context: Context,
    cluster: Arc<ClusterFacade>,
    registry: Arc<dyn RunRegistry>,
    launcher: Arc<ThrottledLauncher>,
}

impl Controller {
    /// Build the controller. Fails if the settings are invalid.
    pub fn new(settings: Settings, context: Context) -> Result<Self> {
        settings.validate()?;

        let cluster = Arc::new(ClusterFacade::new(
            context.pods.clone(),
            settings.namespace.clone(),
            settings.engine_label.clone(),
        ));
        let registry: Arc<dyn RunRegistry> = Arc::new(
            DssRunRegistry::new(context.store.clone()).with_clock(context.clock.clone()),
        );
        let launcher = Arc::new(ThrottledLauncher::new(
            context.clock.clone(),
            settings.launch_interval(),
        ));

        Ok(Self {
            settings,
            context,
            cluster,
            registry,
            launcher,
        })
    }

    /// Registry the monitors act through
    pub fn registry(&self) -> Arc<dyn RunRegistry> {
        self.registry.clone()
    }

    /// Launch throttle for the pod creation path
    pub fn launcher(&self) -> Arc<ThrottledLauncher> {
        self.launcher.clone()
    }

    /// Run every loop until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let store = self.context.store.clone();
        let (watcher, status_events) = StatusChangeWatcher::new()?;
        watcher.start_watching(store.as_ref())?;

        // Pod cleanup runs early whenever a run finishes.
        let cleanup_wake = Arc::new(Notify::new());
        let mut status_processor = StatusChangeProcessor::new();
        status_processor.add_listener(cleanup_wake.clone());

        let (interrupt_tx, interrupt_rx) = interrupt_queue();
        let interrupt_monitor =
            InterruptMonitor::new(self.cluster.clone(), self.registry.clone(), interrupt_tx);
        let heartbeat_monitor = DeadHeartbeatMonitor::new(
            self.registry.clone(),
            self.context.clock.clone(),
            self.settings.dead_heartbeat_timeout(),
            self.settings.missing_heartbeat_grace(),
        );
        let cleanup = PodCleanup::new(self.cluster.clone(), self.registry.clone());
        let processor =
            InterruptEventProcessor::new(self.registry.clone(), self.context.archive.clone());

        let mut tasks = JoinSet::new();
        tasks.spawn(run_periodic(
            interrupt_monitor,
            self.settings.interrupt_poll_interval(),
            cancel.clone(),
            None,
        ));
        tasks.spawn(run_periodic(
            heartbeat_monitor,
            self.settings.heartbeat_poll_interval(),
            cancel.clone(),
            None,
        ));
        tasks.spawn(run_periodic(
            cleanup,
            self.settings.poll_interval(),
            cancel.clone(),
            Some(cleanup_wake),
        ));
        tasks.spawn(processor.run(interrupt_rx));
        tasks.spawn(status_processor.run(status_events, cancel.clone()));

        info!(
            namespace = %self.settings.namespace,
            engine = %self.settings.engine_label,
            "Controller started"
        );

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Controller task ended abnormally");
            }
        }

        watcher.stop_watching(store.as_ref())?;
        info!("Controller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockPodClient;
    use podwatch_registry::{MemoryArchive, MemoryStatusStore};

    fn context(pods: MockPodClient) -> Context {
        Context::new(
            Arc::new(pods),
            Arc::new(MemoryStatusStore::new()),
            Arc::new(MemoryArchive::new()),
        )
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let settings = Settings {
            poll_interval_secs: 0,
            ..Settings::default()
        };
        assert!(Controller::new(settings, context(MockPodClient::new())).is_err());
    }

    #[test]
    fn launcher_uses_configured_interval() {
        let settings = Settings {
            launch_interval_ms: Some("2500".to_string()),
            ..Settings::default()
        };
        let controller = Controller::new(settings, context(MockPodClient::new())).unwrap();
        assert_eq!(
            controller.launcher().min_interval(),
            Duration::from_millis(2500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_cancelled() {
        let mut pods = MockPodClient::new();
        pods.expect_list_pods().returning(|_, _| Ok(vec![]));

        let controller = Controller::new(Settings::default(), context(pods)).unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(60)).await;
        cancel.cancel();

        handle.await.unwrap().unwrap();
    }
}
