//! In-memory snapshot storage for development and testing
//!
//! **[`InMemorySnapshotStore`]** keeps every snapshot in a thread-safe map, encoded
//! through a [`SerializerProtocol`] rather than held as live objects - each save proves
//! the snapshot is plain serializable data, and each load exercises the same decode
//! path a durable backend would. Data is lost on process exit; use
//! [`FileSnapshotStore`](crate::file::FileSnapshotStore) or a database-backed
//! implementation when runs must survive restarts.

use crate::{
    error::{Result, SnapshotError},
    serializer::{JsonSerializer, SerializerProtocol},
    snapshot::{RunId, RunSnapshot},
    store::SnapshotStore,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Thread-safe in-memory snapshot store
///
/// Cloning is shallow: clones share the same underlying map, so a store handed to the
/// engine and a handle kept by a test observe the same runs.
#[derive(Clone, Default)]
pub struct InMemorySnapshotStore {
    runs: Arc<RwLock<HashMap<RunId, StoredRun>>>,
}

struct StoredRun {
    workflow_id: String,
    data: Vec<u8>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs currently stored
    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }

    /// Drop every stored run; test isolation helper
    pub async fn clear(&self) {
        self.runs.write().await.clear();
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, run_id: &str, snapshot: &RunSnapshot) -> Result<()> {
        let data = JsonSerializer::new().dumps(snapshot)?;
        let mut runs = self.runs.write().await;
        runs.insert(
            run_id.to_string(),
            StoredRun {
                workflow_id: snapshot.workflow_id.clone(),
                data,
            },
        );
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        let runs = self.runs.read().await;
        match runs.get(run_id) {
            Some(stored) => {
                let snapshot = JsonSerializer::new()
                    .loads::<RunSnapshot>(&stored.data)
                    .map_err(|e| SnapshotError::Invalid(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        self.runs.write().await.remove(run_id);
        Ok(())
    }

    async fn list_runs(&self, workflow_id: Option<&str>) -> Result<Vec<RunId>> {
        let runs = self.runs.read().await;
        let mut ids: Vec<RunId> = runs
            .iter()
            .filter(|(_, stored)| workflow_id.map_or(true, |wf| stored.workflow_id == wf))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::RunStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let store = InMemorySnapshotStore::new();
        let mut snapshot = RunSnapshot::new("run-1", "wf");
        snapshot.status = RunStatus::Suspended;
        snapshot.input = Some(json!({"value": 1}));

        store.save("run-1", &snapshot).await.unwrap();
        let loaded = store.load("run-1").await.unwrap().unwrap();

        assert_eq!(loaded.run_id, "run-1");
        assert_eq!(loaded.status, RunStatus::Suspended);
        assert_eq!(loaded.input, Some(json!({"value": 1})));
    }

    #[tokio::test]
    async fn test_load_unknown_run_is_none() {
        let store = InMemorySnapshotStore::new();
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_snapshot() {
        let store = InMemorySnapshotStore::new();
        let mut snapshot = RunSnapshot::new("run-1", "wf");

        store.save("run-1", &snapshot).await.unwrap();
        snapshot.status = RunStatus::Success;
        store.save("run-1", &snapshot).await.unwrap();

        let loaded = store.load("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Success);
        assert_eq!(store.run_count().await, 1);
    }

    #[tokio::test]
    async fn test_list_runs_filters_by_workflow() {
        let store = InMemorySnapshotStore::new();
        store
            .save("run-a", &RunSnapshot::new("run-a", "orders"))
            .await
            .unwrap();
        store
            .save("run-b", &RunSnapshot::new("run-b", "billing"))
            .await
            .unwrap();

        let all = store.list_runs(None).await.unwrap();
        assert_eq!(all, vec!["run-a".to_string(), "run-b".to_string()]);

        let orders = store.list_runs(Some("orders")).await.unwrap();
        assert_eq!(orders, vec!["run-a".to_string()]);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = InMemorySnapshotStore::new();
        let handle = store.clone();

        store
            .save("run-1", &RunSnapshot::new("run-1", "wf"))
            .await
            .unwrap();

        assert!(handle.load("run-1").await.unwrap().is_some());
        handle.clear().await;
        assert_eq!(store.run_count().await, 0);
    }
}
