//! File-backed snapshot storage
//!
//! **[`FileSnapshotStore`]** persists one JSON document per run under a directory,
//! surviving process restarts without any external service. Writes go to a temporary
//! file in the same directory and are renamed into place, so a crash mid-write leaves
//! the previous snapshot intact.

use crate::{
    error::{Result, SnapshotError},
    snapshot::{RunId, RunSnapshot},
    store::SnapshotStore,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Snapshot store writing one `<run_id>.json` file per run
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Create a store rooted at `dir`, creating the directory if needed
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Directory this store writes into
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn run_path(&self, run_id: &str) -> Result<PathBuf> {
        // Run ids become file names; reject separators rather than writing
        // outside the store directory.
        if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id.starts_with('.') {
            return Err(SnapshotError::Invalid(format!(
                "run id not usable as file name: {run_id:?}"
            )));
        }
        Ok(self.dir.join(format!("{run_id}.json")))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, run_id: &str, snapshot: &RunSnapshot) -> Result<()> {
        let path = self.run_path(run_id)?;
        let data = serde_json::to_vec_pretty(snapshot)?;

        let tmp = self.dir.join(format!(".{run_id}.json.tmp"));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        let path = self.run_path(run_id)?;
        match tokio::fs::read(&path).await {
            Ok(data) => {
                let snapshot = serde_json::from_slice(&data)
                    .map_err(|e| SnapshotError::Invalid(e.to_string()))?;
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        let path = self.run_path(run_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_runs(&self, workflow_id: Option<&str>) -> Result<Vec<RunId>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(run_id) = name.strip_suffix(".json") else {
                continue;
            };
            if run_id.starts_with('.') {
                continue;
            }
            if let Some(wf) = workflow_id {
                match self.load(run_id).await? {
                    Some(snapshot) if snapshot.workflow_id == wf => {}
                    _ => continue,
                }
            }
            ids.push(run_id.to_string());
        }
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
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path()).await.unwrap();

        let mut snapshot = RunSnapshot::new("run-1", "wf");
        snapshot.status = RunStatus::Suspended;
        snapshot.input = Some(json!({"value": 9}));
        store.save("run-1", &snapshot).await.unwrap();

        // A second handle over the same directory sees the run, like a
        // process that restarted.
        let reopened = FileSnapshotStore::new(dir.path()).await.unwrap();
        let loaded = reopened.load("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Suspended);
        assert_eq!(loaded.input, Some(json!({"value": 9})));
    }

    #[tokio::test]
    async fn test_missing_run_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path()).await.unwrap();
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path()).await.unwrap();

        store
            .save("run-1", &RunSnapshot::new("run-1", "wf"))
            .await
            .unwrap();
        store.delete("run-1").await.unwrap();
        store.delete("run-1").await.unwrap();
        assert!(store.load("run-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal_run_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path()).await.unwrap();

        let snapshot = RunSnapshot::new("bad", "wf");
        assert!(store.save("../escape", &snapshot).await.is_err());
        assert!(store.load("a/b").await.is_err());
    }

    #[tokio::test]
    async fn test_list_runs_filters_by_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path()).await.unwrap();

        store
            .save("run-a", &RunSnapshot::new("run-a", "orders"))
            .await
            .unwrap();
        store
            .save("run-b", &RunSnapshot::new("run-b", "billing"))
            .await
            .unwrap();

        assert_eq!(
            store.list_runs(Some("billing")).await.unwrap(),
            vec!["run-b".to_string()]
        );
        assert_eq!(store.list_runs(None).await.unwrap().len(), 2);
    }
}
