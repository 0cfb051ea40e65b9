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

//! Plan persistence over a cluster backend and an optional local copy
//!
//! Reads prefer the cluster backend and degrade to the local copy when it
//! cannot be reached. Writes are whole-document, guarded by the stored
//! version, and land on the local copy first when one exists. The cluster
//! copy is shared by every node, so local changes are merged into it phase
//! by phase under the same version check instead of replacing it.

use crate::domain::operation::{Operation, OperationKey};
use crate::domain::plan::OperationPlan;
use crate::infrastructure::backend::{Backend, VersionedPlan};
use crate::shared::error::{OpsError, Result};
use crate::shared::retry::RetryPolicy;
use std::sync::Arc;
use tracing::{debug, info, warn, Span};

pub struct PlanStore {
    cluster: Option<Arc<dyn Backend>>,
    local: Option<Arc<dyn Backend>>,
    retry: RetryPolicy,
    span: Span,
}

impl PlanStore {
    pub fn new(
        cluster: Option<Arc<dyn Backend>>,
        local: Option<Arc<dyn Backend>>,
        retry: RetryPolicy,
        span: Span,
    ) -> Result<Self> {
        if cluster.is_none() && local.is_none() {
            return Err(OpsError::bad_parameter(
                "plan store needs at least one backend",
            ));
        }
        Ok(Self {
            cluster,
            local,
            retry,
            span,
        })
    }

    pub fn cluster(&self) -> Option<&Arc<dyn Backend>> {
        self.cluster.as_ref()
    }

    pub fn local(&self) -> Option<&Arc<dyn Backend>> {
        self.local.as_ref()
    }

    /// The backend every write must reach.
    fn authoritative(&self) -> Result<&Arc<dyn Backend>> {
        self.local
            .as_ref()
            .or(self.cluster.as_ref())
            .ok_or_else(|| OpsError::bad_parameter("plan store has no backend"))
    }

    /// The cluster backend when it differs from the authoritative one.
    fn mirror(&self) -> Option<&Arc<dyn Backend>> {
        match (&self.local, &self.cluster) {
            (Some(_), Some(cluster)) => Some(cluster),
            _ => None,
        }
    }

    /// Reads the plan from the cluster backend, falling back to the local
    /// copy when the cluster is unreachable or does not know the plan yet.
    pub async fn get_plan(&self, key: &OperationKey) -> Result<OperationPlan> {
        if let Some(cluster) = &self.cluster {
            match cluster.get_plan(key).await {
                Ok(stored) => return Ok(stored.plan),
                Err(e) if e.is_unreachable() && self.local.is_some() => {
                    warn!(parent: &self.span, error = %e, operation = %key,
                        "cluster backend unreachable, using local copy of the plan (degraded mode)");
                }
                Err(e) if e.is_not_found() && self.local.is_some() => {
                    debug!(parent: &self.span, operation = %key, "plan not in cluster backend yet");
                }
                Err(e) => return Err(e),
            }
        }

        match &self.local {
            Some(local) => Ok(local.get_plan(key).await?.plan),
            None => Err(OpsError::not_found("plan", key.to_string())),
        }
    }

    /// Reads the authoritative copy and folds in newer phase changes from the
    /// cluster copy.
    pub async fn load_plan(&self, key: &OperationKey) -> Result<OperationPlan> {
        match &self.local {
            Some(local) => {
                let stored = local.get_plan(key).await?;
                self.reconcile_plan(stored.plan).await
            }
            None => self.get_plan(key).await,
        }
    }

    /// Merges phase changes recorded on the cluster backend since `local_plan`
    /// was cached. Returns `local_plan` unchanged if the cluster is not
    /// reachable.
    pub async fn reconcile_plan(&self, mut local_plan: OperationPlan) -> Result<OperationPlan> {
        let Some(cluster) = &self.cluster else {
            return Ok(local_plan);
        };

        let key = local_plan.key();
        let cluster_plan = match cluster.get_plan(&key).await {
            Ok(stored) => stored.plan,
            Err(e) if e.is_unreachable() || e.is_not_found() => {
                warn!(parent: &self.span, error = %e, operation = %key,
                    "could not reach cluster copy of the plan, continuing with local copy");
                return Ok(local_plan);
            }
            Err(e) => return Err(e),
        };

        let changed = local_plan.merge_newer(&cluster_plan);
        if changed.is_empty() {
            return Ok(local_plan);
        }

        info!(parent: &self.span, operation = %key, phases = ?changed,
            "reconciled phase updates from cluster backend");
        if let Some(local) = &self.local {
            let merged = local_plan.clone();
            self.update_plan(&key, move |plan| {
                plan.merge_newer(&merged);
                Ok(())
            })
            .await?;
        }
        Ok(local_plan)
    }

    /// Stores a freshly initialized plan and its operation.
    pub async fn create_plan(&self, operation: &Operation, plan: &OperationPlan) -> Result<()> {
        plan.validate()?;
        let target = self.authoritative()?;

        match target.create_operation(operation).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                debug!(parent: &self.span, operation = %operation.id, "operation already recorded");
                target.update_operation(operation).await?;
            }
            Err(e) => return Err(e),
        }
        target.put_plan(plan, None).await?;

        if self.mirror().is_some() {
            self.sync_plan_to_cluster(operation, plan).await?;
        }
        Ok(())
    }

    /// Pushes a locally initialized plan and its operation to the cluster
    /// backend so other nodes can observe it.
    pub async fn sync_plan_to_cluster(&self, operation: &Operation, plan: &OperationPlan) -> Result<()> {
        let cluster = self
            .cluster
            .as_ref()
            .ok_or_else(|| OpsError::bad_parameter("no cluster backend configured"))?;

        self.retry
            .run(&self.span, "sync operation to cluster", || async {
                cluster.update_operation(operation).await
            })
            .await?;
        self.merge_into(cluster, plan).await?;

        info!(parent: &self.span, operation = %operation.id, backend = cluster.name(),
            "synced plan to cluster backend");
        Ok(())
    }

    /// Folds the newer phases of `plan` into the copy held by `backend`.
    /// Phases another node recorded there more recently are kept.
    async fn merge_into(&self, backend: &Arc<dyn Backend>, plan: &OperationPlan) -> Result<()> {
        let key = plan.key();
        let key = &key;
        // Only lost races are retried here; an unreachable cluster is left
        // for the next reconcile.
        self.retry
            .run_when(&self.span, "merge plan into cluster copy", || async move {
                let VersionedPlan { version, plan: mut shared } = match backend.get_plan(key).await {
                    Ok(stored) => stored,
                    Err(e) if e.is_not_found() => {
                        return match backend.put_plan(plan, None).await {
                            Ok(_) => Ok(()),
                            // Another node created it first; merge on the next attempt.
                            Err(e) if e.is_already_exists() => {
                                Err(OpsError::Conflict(format!("plan {} created concurrently", key)))
                            }
                            Err(e) => Err(e),
                        };
                    }
                    Err(e) => return Err(e),
                };
                let changed = shared.merge_newer(plan);
                if changed.is_empty() {
                    return Ok(());
                }
                debug!(parent: &self.span, operation = %key, phases = ?changed, backend = backend.name(),
                    "merging phase updates into cluster copy");
                backend.put_plan(&shared, Some(version)).await?;
                Ok(())
            }, |e| e.is_conflict())
            .await
    }

    /// Read-modify-write of the whole plan. `mutate` may run more than once
    /// if a concurrent writer bumped the version in between.
    pub async fn update_plan<F>(&self, key: &OperationKey, mutate: F) -> Result<OperationPlan>
    where
        F: Fn(&mut OperationPlan) -> Result<()> + Send + Sync,
    {
        let target = self.authoritative()?;
        let mutate = &mutate;

        let updated = self
            .retry
            .run(&self.span, "update plan", || async move {
                let VersionedPlan { version, mut plan } = target.get_plan(key).await?;
                mutate(&mut plan)?;
                target.put_plan(&plan, Some(version)).await?;
                Ok(plan)
            })
            .await?;

        if let Some(cluster) = self.mirror() {
            if let Err(e) = self.merge_into(cluster, &updated).await {
                warn!(parent: &self.span, error = %e, operation = %key,
                    "failed to mirror plan to cluster backend, it will be reconciled later");
            }
        }
        Ok(updated)
    }

    pub async fn get_operation(&self, key: &OperationKey) -> Result<Operation> {
        if let Some(local) = &self.local {
            match local.get_operation(key).await {
                Ok(op) => return Ok(op),
                Err(e) if e.is_not_found() && self.cluster.is_some() => {}
                Err(e) => return Err(e),
            }
        }
        match &self.cluster {
            Some(cluster) => cluster.get_operation(key).await,
            None => Err(OpsError::not_found("operation", key.to_string())),
        }
    }

    pub async fn update_operation(&self, operation: &Operation) -> Result<()> {
        let target = self.authoritative()?;
        self.retry
            .run(&self.span, "update operation", || async {
                target.update_operation(operation).await
            })
            .await?;

        if let Some(cluster) = self.mirror() {
            if let Err(e) = cluster.update_operation(operation).await {
                warn!(parent: &self.span, error = %e, operation = %operation.id,
                    "failed to mirror operation to cluster backend");
            }
        }
        Ok(())
    }

    /// Copies the final plan and operation state to the cluster backend.
    pub async fn archive(&self, operation: &Operation, plan: &OperationPlan) {
        if self.mirror().is_none() {
            return;
        }
        if let Err(e) = self.sync_plan_to_cluster(operation, plan).await {
            warn!(parent: &self.span, error = %e, operation = %operation.id,
                "failed to archive finished operation to cluster backend");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::OperationType;
    use crate::domain::plan::{Phase, PhaseState};
    use crate::infrastructure::backend::MemoryBackend;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_times: 3,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn sample() -> (Operation, OperationPlan) {
        let op = Operation::new(OperationType::Update, "prod", vec![]);
        let plan = OperationPlan::new(
            &op,
            vec![
                Phase::new("/init", "Init").with_executor("noop"),
                Phase::new("/upgrade", "Upgrade").with_executor("noop").requires("/init"),
            ],
        );
        (op, plan)
    }

    #[tokio::test]
    async fn test_create_syncs_to_cluster() {
        let cluster: Arc<dyn Backend> = Arc::new(MemoryBackend::new("cluster"));
        let local: Arc<dyn Backend> = Arc::new(MemoryBackend::new("local"));
        let store = PlanStore::new(Some(cluster.clone()), Some(local.clone()), fast_retry(), Span::none()).unwrap();

        let (op, plan) = sample();
        store.create_plan(&op, &plan).await.unwrap();

        assert_eq!(cluster.get_plan(&op.key()).await.unwrap().plan, plan);
        assert_eq!(local.get_plan(&op.key()).await.unwrap().plan, plan);
        assert_eq!(store.get_plan(&op.key()).await.unwrap(), plan);
    }

    #[tokio::test]
    async fn test_update_mirrors_to_cluster() {
        let cluster: Arc<dyn Backend> = Arc::new(MemoryBackend::new("cluster"));
        let local: Arc<dyn Backend> = Arc::new(MemoryBackend::new("local"));
        let store = PlanStore::new(Some(cluster.clone()), Some(local), fast_retry(), Span::none()).unwrap();

        let (op, plan) = sample();
        store.create_plan(&op, &plan).await.unwrap();
        store
            .update_plan(&op.key(), |p| p.set_state("/init", PhaseState::Completed, None))
            .await
            .unwrap();

        let mirrored = cluster.get_plan(&op.key()).await.unwrap().plan;
        assert_eq!(mirrored.get("/init").unwrap().state, PhaseState::Completed);
    }

    #[tokio::test]
    async fn test_reconcile_pulls_cluster_changes() {
        let cluster: Arc<dyn Backend> = Arc::new(MemoryBackend::new("cluster"));
        let local: Arc<dyn Backend> = Arc::new(MemoryBackend::new("local"));
        let store = PlanStore::new(Some(cluster.clone()), Some(local.clone()), fast_retry(), Span::none()).unwrap();

        let (op, plan) = sample();
        store.create_plan(&op, &plan).await.unwrap();

        // Another node completed /init and recorded it in the cluster only.
        let mut remote = plan.clone();
        remote.set_state("/init", PhaseState::Completed, None).unwrap();
        cluster.upsert_plan(&remote).await.unwrap();

        let loaded = store.load_plan(&op.key()).await.unwrap();
        assert_eq!(loaded.get("/init").unwrap().state, PhaseState::Completed);
        let persisted = local.get_plan(&op.key()).await.unwrap().plan;
        assert_eq!(persisted.get("/init").unwrap().state, PhaseState::Completed);
    }

    #[test]
    fn test_requires_a_backend() {
        assert!(PlanStore::new(None, None, RetryPolicy::default(), Span::none()).is_err());
    }
}
