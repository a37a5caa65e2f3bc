//! # weft-snapshot - Durable Run State for the Weft Workflow Engine
//!
//! **Snapshot types and storage abstractions** for persisting and restoring workflow
//! run state. A snapshot is everything the engine needs to pick a run back up: per-step
//! statuses and outputs, suspended paths with their resume waypoints, and timed-wake
//! deadlines - as plain serializable data, with step code re-resolved by id against the
//! in-memory workflow at resume time.
//!
//! ## Core pieces
//!
//! - [`RunSnapshot`] / [`StepRecord`] - the durable run state, keyed by dotted step path
//! - [`SnapshotStore`] - async trait for persistence backends (`save`/`load` by run id)
//! - [`InMemorySnapshotStore`] - reference backend for tests and development
//! - [`FileSnapshotStore`] - one atomic JSON file per run, survives restarts
//! - [`SerializerProtocol`] - pluggable encoding ([`JsonSerializer`], [`BincodeSerializer`])
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use weft_snapshot::{InMemorySnapshotStore, RunSnapshot, SnapshotStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemorySnapshotStore::new();
//!
//!     let snapshot = RunSnapshot::new("run-1", "my-workflow");
//!     store.save("run-1", &snapshot).await?;
//!
//!     if let Some(loaded) = store.load("run-1").await? {
//!         println!("run {} is {:?}", loaded.run_id, loaded.status);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Writes for a given run id are single-writer by contract; see [`store`] for the
//! discipline backends must uphold.

pub mod error;
pub mod file;
pub mod memory;
pub mod serializer;
pub mod snapshot;
pub mod store;

pub use error::{Result, SnapshotError};
pub use file::FileSnapshotStore;
pub use memory::InMemorySnapshotStore;
pub use serializer::{BincodeSerializer, JsonSerializer, SerializerProtocol};
pub use snapshot::{path_key, RunId, RunSnapshot, RunStatus, StepPath, StepRecord, StepStatus};
pub use store::SnapshotStore;
