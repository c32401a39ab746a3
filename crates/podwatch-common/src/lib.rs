//! Common types for podwatch: run model, errors, and utilities

#![deny(missing_docs)]

pub mod clock;
pub mod error;
pub mod retry;
pub mod run;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{is_not_found, Error};
pub use run::{InterruptReason, Run, RunArchiveAction, RunStatus};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label on a worker pod naming the run it executes.
///
/// Pods without this label are not ours and are never touched.
pub const RUN_POD_LABEL: &str = "galasa-run";

/// Label on a worker pod naming the engine controller that launched it
pub const ENGINE_CONTROLLER_LABEL: &str = "galasa-engine-controller";

/// Prefix shared by every run property in the status store
pub const RUN_KEY_PREFIX: &str = "run";
