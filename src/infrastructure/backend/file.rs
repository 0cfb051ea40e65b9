// Copyright 2025 JiangLong.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Directory backed store
//!
//! Layout under the root directory:
//!   operations/<cluster>/<operation-id>.json
//!   plans/<cluster>/<operation-id>.json
//!
//! Every read-compare-write cycle holds an exclusive `flock` on a sibling
//! `.lock` file, so separate processes sharing the directory observe each
//! other's versions.

use super::{check_version, decode_plan, encode_plan, Backend, VersionedPlan};
use crate::domain::operation::{Operation, OperationKey};
use crate::domain::plan::OperationPlan;
use crate::shared::error::{OpsError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Exclusive advisory lock, released on drop.
struct FileLock {
    file: File,
}

impl FileLock {
    async fn acquire(path: PathBuf) -> Result<Self> {
        tokio::task::spawn_blocking(move || -> std::io::Result<FileLock> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(FileLock { file })
        })
        .await
        .map_err(|e| OpsError::backend(format!("lock task failed: {}", e)))?
        .map_err(|e| OpsError::backend(format!("failed to lock: {}", e)))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub struct FileBackend {
    name: String,
    root: PathBuf,
}

impl FileBackend {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    fn operation_path(&self, key: &OperationKey) -> PathBuf {
        self.root
            .join("operations")
            .join(&key.cluster_name)
            .join(format!("{}.json", key.operation_id))
    }

    fn plan_path(&self, key: &OperationKey) -> PathBuf {
        self.root
            .join("plans")
            .join(&key.cluster_name)
            .join(format!("{}.json", key.operation_id))
    }

    async fn lock(&self, path: &Path) -> Result<FileLock> {
        FileLock::acquire(path.with_extension("lock"))
            .await
            .map_err(|e| OpsError::backend(format!("{}: {} for {}", self.name, e, path.display())))
    }

    async fn read_optional(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OpsError::backend(format!(
                "{}: failed to read {}: {}",
                self.name,
                path.display(),
                e
            ))),
        }
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| OpsError::backend(format!("invalid path {}", path.display())))?;
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            OpsError::backend(format!("{}: failed to create {}: {}", self.name, parent.display(), e))
        })?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(|e| {
            OpsError::backend(format!("{}: failed to write {}: {}", self.name, tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            OpsError::backend(format!("{}: failed to rename {}: {}", self.name, path.display(), e))
        })?;
        Ok(())
    }

    async fn read_stored_plan(&self, key: &OperationKey) -> Result<Option<VersionedPlan>> {
        match self.read_optional(&self.plan_path(key)).await? {
            Some(bytes) => Ok(Some(decode_plan(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write_plan(&self, plan: &OperationPlan, version: u64) -> Result<u64> {
        let stored = VersionedPlan {
            version,
            plan: plan.clone(),
        };
        self.write_atomic(&self.plan_path(&plan.key()), &encode_plan(&stored)?)
            .await?;
        Ok(version)
    }
}

#[async_trait::async_trait]
impl Backend for FileBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_operation(&self, operation: &Operation) -> Result<()> {
        let key = operation.key();
        let path = self.operation_path(&key);
        let _lock = self.lock(&path).await?;
        if self.read_optional(&path).await?.is_some() {
            return Err(OpsError::already_exists("operation", key.to_string()));
        }
        self.write_atomic(&path, &serde_json::to_vec_pretty(operation)?)
            .await
    }

    async fn get_operation(&self, key: &OperationKey) -> Result<Operation> {
        match self.read_optional(&self.operation_path(key)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(OpsError::not_found("operation", key.to_string())),
        }
    }

    async fn update_operation(&self, operation: &Operation) -> Result<()> {
        let path = self.operation_path(&operation.key());
        let _lock = self.lock(&path).await?;
        self.write_atomic(&path, &serde_json::to_vec_pretty(operation)?)
            .await
    }

    async fn list_operations(&self, cluster_name: Option<&str>) -> Result<Vec<Operation>> {
        let base = self.root.join("operations");
        let clusters: Vec<PathBuf> = match cluster_name {
            Some(name) => vec![base.join(name)],
            None => {
                let mut dirs = Vec::new();
                match tokio::fs::read_dir(&base).await {
                    Ok(mut entries) => {
                        while let Some(entry) = entries.next_entry().await? {
                            if entry.file_type().await?.is_dir() {
                                dirs.push(entry.path());
                            }
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(OpsError::backend(format!(
                            "{}: failed to list {}: {}",
                            self.name,
                            base.display(),
                            e
                        )))
                    }
                }
                dirs
            }
        };

        let mut operations = Vec::new();
        for dir in clusters {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(OpsError::backend(format!(
                        "{}: failed to list {}: {}",
                        self.name,
                        dir.display(),
                        e
                    )))
                }
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let bytes = tokio::fs::read(&path).await?;
                operations.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(operations)
    }

    async fn get_plan(&self, key: &OperationKey) -> Result<VersionedPlan> {
        self.read_stored_plan(key)
            .await?
            .ok_or_else(|| OpsError::not_found("plan", key.to_string()))
    }

    async fn put_plan(&self, plan: &OperationPlan, expected: Option<u64>) -> Result<u64> {
        let key = plan.key();
        let _lock = self.lock(&self.plan_path(&key)).await?;
        let stored = self.read_stored_plan(&key).await?.map(|p| p.version);
        check_version(&key, stored, expected)?;
        self.write_plan(plan, stored.unwrap_or(0) + 1).await
    }

    async fn upsert_plan(&self, plan: &OperationPlan) -> Result<u64> {
        let key = plan.key();
        let _lock = self.lock(&self.plan_path(&key)).await?;
        let stored = self.read_stored_plan(&key).await?.map(|p| p.version);
        self.write_plan(plan, stored.unwrap_or(0) + 1).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::OperationType;
    use crate::domain::plan::{Phase, PhaseState};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_plan_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let op = Operation::new(OperationType::Update, "prod", vec![]);
        let mut plan = OperationPlan::new(&op, vec![Phase::new("/init", "Init").with_executor("noop")]);

        let backend = FileBackend::new("local", dir.path());
        backend.create_operation(&op).await.unwrap();
        let v1 = backend.put_plan(&plan, None).await.unwrap();
        plan.set_state("/init", PhaseState::Completed, None).unwrap();
        backend.put_plan(&plan, Some(v1)).await.unwrap();

        let reopened = FileBackend::new("local", dir.path());
        let stored = reopened.get_plan(&op.key()).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.plan, plan);
        assert_eq!(reopened.list_operations(None).await.unwrap(), vec![op]);
    }

    #[tokio::test]
    async fn test_missing_plan_is_not_found() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new("local", dir.path().join("absent"));
        let err = backend
            .get_plan(&OperationKey::new("prod", "nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(backend.list_operations(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let dir = TempDir::new().unwrap();
        let op = Operation::new(OperationType::Update, "prod", vec![]);
        let plan = OperationPlan::new(&op, vec![Phase::new("/init", "Init")]);
        let backend = FileBackend::new("local", dir.path());
        backend.put_plan(&plan, None).await.unwrap();
        backend.put_plan(&plan, Some(1)).await.unwrap();
        assert!(backend.put_plan(&plan, Some(1)).await.unwrap_err().is_conflict());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_separate_instances_cannot_both_win_a_version() {
        let dir = TempDir::new().unwrap();
        let op = Operation::new(OperationType::Update, "prod", vec![]);
        let plan = OperationPlan::new(&op, vec![Phase::new("/init", "Init")]);
        let first = FileBackend::new("local", dir.path());
        let second = FileBackend::new("local", dir.path());
        let mut version = first.put_plan(&plan, None).await.unwrap();

        for _ in 0..20 {
            let (a, b) = tokio::join!(first.put_plan(&plan, Some(version)), second.put_plan(&plan, Some(version)));
            let winners: Vec<u64> = [a, b].into_iter().filter_map(|r| r.ok()).collect();
            assert_eq!(winners.len(), 1);
            version = winners[0];
        }
        assert_eq!(second.get_plan(&op.key()).await.unwrap().version, version);
    }
}
