//! Run registry, status store and result archive for podwatch
//!
//! The controller talks to run state only through the traits here:
//! [`RunRegistry`] for run records, [`StatusStore`] for raw watches, and
//! [`ResultArchive`] for archived outcomes.

#![deny(missing_docs)]

pub mod archive;
pub mod memory;
pub mod registry;
pub mod store;

pub use archive::{ArchivedRun, ResultArchive};
pub use memory::{MemoryArchive, MemoryStatusStore};
pub use registry::{DssRunRegistry, RunRegistry};
pub use store::{StatusStore, StoreEvent, StoreWatcher, WatchId};

#[cfg(any(test, feature = "mock"))]
pub use archive::MockResultArchive;
#[cfg(any(test, feature = "mock"))]
pub use registry::MockRunRegistry;
#[cfg(any(test, feature = "mock"))]
pub use store::MockStatusStore;
