//! Run-pod reconciliation and liveness controller
//!
//! Keeps an engine's worker pods consistent with the run records in the
//! dynamic status store, finalises interrupted runs, and requeues runs whose
//! heartbeat has died.

#![deny(missing_docs)]

/// Terminated pod cleanup
pub mod cleanup;
/// Pods API facade
pub mod cluster;
/// Command-line and environment settings
pub mod config;
/// Task wiring and shutdown
pub mod controller;
/// Dead-heartbeat detection
pub mod heartbeat;
/// Interrupted run detection
pub mod interrupt_monitor;
/// Pod launch throttling
pub mod launcher;
/// Interrupt event finalisation
pub mod processor;
/// Run-finished notifications
pub mod status_processor;
/// Status store watch filtering
pub mod watcher;

pub use cleanup::PodCleanup;
pub use cluster::{ClusterFacade, KubePodClient, PodClient};
pub use config::Settings;
pub use controller::{Context, Controller};
pub use heartbeat::DeadHeartbeatMonitor;
pub use interrupt_monitor::{InterruptMonitor, RunInterruptEvent};
pub use launcher::ThrottledLauncher;
pub use processor::InterruptEventProcessor;
pub use status_processor::{RunFinishedListener, StatusChangeProcessor};
pub use watcher::{StatusChangeEvent, StatusChangeWatcher};
