//! Controller settings
//!
//! Every setting is a command-line flag that can also come from the
//! environment, so the same binary runs under a Deployment or locally.

use std::time::Duration;

use clap::Parser;
use podwatch_common::{Error, Result};
use tracing::{info, warn};

/// Pod launch interval when none is configured
pub const DEFAULT_LAUNCH_INTERVAL: Duration = Duration::from_millis(1000);

/// Run-pod reconciliation and liveness controller
#[derive(Parser, Debug, Clone)]
#[command(name = "podwatch", version, about, long_about = None)]
pub struct Settings {
    /// Namespace the worker pods run in
    #[arg(long, env = "PODWATCH_NAMESPACE", default_value = "galasa")]
    pub namespace: String,

    /// Engine controller label; only pods with
    /// `galasa-engine-controller=<label>` are managed
    #[arg(long, env = "PODWATCH_ENGINE_LABEL", default_value = "k8s-standard-engine")]
    pub engine_label: String,

    /// Seconds between pod cleanup passes
    #[arg(long, env = "PODWATCH_POLL_INTERVAL_SECS", default_value_t = 20)]
    pub poll_interval_secs: u64,

    /// Seconds between interrupt monitor passes
    #[arg(long, env = "PODWATCH_INTERRUPT_POLL_INTERVAL_SECS", default_value_t = 5)]
    pub interrupt_poll_interval_secs: u64,

    /// Seconds between dead-heartbeat checks
    #[arg(long, env = "PODWATCH_HEARTBEAT_POLL_INTERVAL_SECS", default_value_t = 20)]
    pub heartbeat_poll_interval_secs: u64,

    /// Age in seconds after which a reported heartbeat is dead
    #[arg(long, env = "PODWATCH_DEAD_HEARTBEAT_TIMEOUT_SECS", default_value_t = 300)]
    pub dead_heartbeat_timeout_secs: u64,

    /// Seconds a run may go without ever reporting a heartbeat
    #[arg(long, env = "PODWATCH_MISSING_HEARTBEAT_GRACE_SECS", default_value_t = 300)]
    pub missing_heartbeat_grace_secs: u64,

    /// Minimum milliseconds between pod launches (default 1000)
    #[arg(long, env = "PODWATCH_LAUNCH_INTERVAL_MS")]
    pub launch_interval_ms: Option<String>,

    /// Emit JSON log lines
    #[arg(long, env = "PODWATCH_LOG_JSON")]
    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: "galasa".to_string(),
            engine_label: "k8s-standard-engine".to_string(),
            poll_interval_secs: 20,
            interrupt_poll_interval_secs: 5,
            heartbeat_poll_interval_secs: 20,
            dead_heartbeat_timeout_secs: 300,
            missing_heartbeat_grace_secs: 300,
            launch_interval_ms: None,
            log_json: false,
        }
    }
}

impl Settings {
    /// Reject settings the loops cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::validation("namespace must not be empty"));
        }
        if self.engine_label.trim().is_empty() {
            return Err(Error::validation("engine label must not be empty"));
        }
        let nonzero = [
            ("poll-interval-secs", self.poll_interval_secs),
            ("interrupt-poll-interval-secs", self.interrupt_poll_interval_secs),
            ("heartbeat-poll-interval-secs", self.heartbeat_poll_interval_secs),
            ("dead-heartbeat-timeout-secs", self.dead_heartbeat_timeout_secs),
            ("missing-heartbeat-grace-secs", self.missing_heartbeat_grace_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(Error::validation(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// Pod cleanup cadence
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Interrupt monitor cadence
    pub fn interrupt_poll_interval(&self) -> Duration {
        Duration::from_secs(self.interrupt_poll_interval_secs)
    }

    /// Dead-heartbeat check cadence
    pub fn heartbeat_poll_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_poll_interval_secs)
    }

    /// Stale heartbeat threshold
    pub fn dead_heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.dead_heartbeat_timeout_secs)
    }

    /// Missing heartbeat grace window
    pub fn missing_heartbeat_grace(&self) -> Duration {
        Duration::from_secs(self.missing_heartbeat_grace_secs)
    }

    /// Minimum interval between pod launches
    pub fn launch_interval(&self) -> Duration {
        parse_launch_interval(self.launch_interval_ms.as_deref())
    }
}

/// Parse a launch interval in milliseconds.
///
/// Never fails: an absent, blank or non-numeric value falls back to
/// [`DEFAULT_LAUNCH_INTERVAL`].
pub fn parse_launch_interval(raw: Option<&str>) -> Duration {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        info!(
            default_ms = DEFAULT_LAUNCH_INTERVAL.as_millis(),
            "Launch interval not set, using default"
        );
        return DEFAULT_LAUNCH_INTERVAL;
    };
    match raw.parse::<u64>() {
        Ok(ms) => Duration::from_millis(ms),
        Err(e) => {
            warn!(
                value = %raw,
                error = %e,
                default_ms = DEFAULT_LAUNCH_INTERVAL.as_millis(),
                "Launch interval is not a number of milliseconds, using default"
            );
            DEFAULT_LAUNCH_INTERVAL
        }
    }
}
