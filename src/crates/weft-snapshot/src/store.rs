//! Extensible snapshot storage trait for custom backend implementations
//!
//! This module defines **[`SnapshotStore`]** - the abstraction the execution engine
//! persists run state through. Implementations can sit on any storage system that can
//! get/put a blob by string key (file, SQL, KV, object storage); this crate ships an
//! in-memory backend for tests and a file backend for single-node durability.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  weft-core execution engine                 │
//! │  • enters running  ──► save()               │
//! │  • step suspends   ──► save()               │
//! │  • run terminates  ──► save()               │
//! │  • resume(run_id)  ──► load()               │
//! └───────────────┬─────────────────────────────┘
//!                 │ SnapshotStore trait
//!                 ▼
//! ┌─────────────────────────────────────────────┐
//! │  Backend (yours)                            │
//! │  InMemorySnapshotStore │ FileSnapshotStore  │
//! │  │ PostgreSQL │ Redis │ S3 │ …              │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Write discipline
//!
//! Writes for a given `run_id` are **single-writer**: the engine serializes its own
//! writes, and concurrent resumes of one run are rejected with a conflict before a
//! second writer ever reaches the store. Implementations must still make each
//! individual `save` atomic (no torn snapshots on crash) - readers must observe either
//! the previous snapshot or the new one, never a prefix.
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use weft_snapshot::{SnapshotStore, RunSnapshot, RunId, Result};
//! use async_trait::async_trait;
//!
//! struct PostgresSnapshotStore { pool: sqlx::PgPool }
//!
//! #[async_trait]
//! impl SnapshotStore for PostgresSnapshotStore {
//!     async fn save(&self, run_id: &str, snapshot: &RunSnapshot) -> Result<()> {
//!         let data = serde_json::to_value(snapshot)?;
//!         sqlx::query("INSERT INTO runs (run_id, snapshot) VALUES ($1, $2) \
//!                      ON CONFLICT (run_id) DO UPDATE SET snapshot = $2")
//!             .bind(run_id).bind(data)
//!             .execute(&self.pool).await
//!             .map_err(|e| weft_snapshot::SnapshotError::Storage(e.to_string()))?;
//!         Ok(())
//!     }
//!
//!     async fn load(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
//!         // SELECT snapshot FROM runs WHERE run_id = $1, deserialize, None if absent
//!         # unimplemented!()
//!     }
//!
//!     async fn list_runs(&self, workflow_id: Option<&str>) -> Result<Vec<RunId>> {
//!         # unimplemented!()
//!     }
//! }
//! ```

use crate::{
    error::Result,
    snapshot::{RunId, RunSnapshot},
};
use async_trait::async_trait;

/// Storage backend for run snapshots
///
/// Implementations must be `Send + Sync`; the engine shares one store across
/// concurrent runs of different `run_id`s.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist the snapshot for a run, replacing any previous snapshot.
    ///
    /// Must be atomic per call: a crash mid-save leaves either the old or the
    /// new snapshot readable, never a torn one.
    async fn save(&self, run_id: &str, snapshot: &RunSnapshot) -> Result<()>;

    /// Load the latest snapshot for a run, or `None` if the run is unknown.
    ///
    /// Absence is `Ok(None)`, not an error; the caller decides whether an
    /// unknown run id is a failure.
    async fn load(&self, run_id: &str) -> Result<Option<RunSnapshot>>;

    /// Delete the snapshot for a run.
    ///
    /// Deleting an unknown run is a no-op. The default implementation does
    /// nothing, for backends that retain history by design.
    async fn delete(&self, run_id: &str) -> Result<()> {
        let _ = run_id;
        Ok(())
    }

    /// List known run ids, optionally restricted to one workflow.
    async fn list_runs(&self, workflow_id: Option<&str>) -> Result<Vec<RunId>>;
}
