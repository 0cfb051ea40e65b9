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

use super::{check_version, Backend, VersionedPlan};
use crate::domain::operation::{Operation, OperationKey};
use crate::domain::plan::OperationPlan;
use crate::shared::error::{OpsError, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    operations: HashMap<OperationKey, Operation>,
    plans: HashMap<OperationKey, VersionedPlan>,
}

/// Process-local backend.
pub struct MemoryBackend {
    name: String,
    state: RwLock<State>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(State::default()),
        }
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_operation(&self, operation: &Operation) -> Result<()> {
        let mut state = self.state.write().await;
        let key = operation.key();
        if state.operations.contains_key(&key) {
            return Err(OpsError::already_exists("operation", key.to_string()));
        }
        state.operations.insert(key, operation.clone());
        Ok(())
    }

    async fn get_operation(&self, key: &OperationKey) -> Result<Operation> {
        self.state
            .read()
            .await
            .operations
            .get(key)
            .cloned()
            .ok_or_else(|| OpsError::not_found("operation", key.to_string()))
    }

    async fn update_operation(&self, operation: &Operation) -> Result<()> {
        self.state
            .write()
            .await
            .operations
            .insert(operation.key(), operation.clone());
        Ok(())
    }

    async fn list_operations(&self, cluster_name: Option<&str>) -> Result<Vec<Operation>> {
        let state = self.state.read().await;
        Ok(state
            .operations
            .values()
            .filter(|op| cluster_name.map(|c| op.cluster_name == c).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_plan(&self, key: &OperationKey) -> Result<VersionedPlan> {
        self.state
            .read()
            .await
            .plans
            .get(key)
            .cloned()
            .ok_or_else(|| OpsError::not_found("plan", key.to_string()))
    }

    async fn put_plan(&self, plan: &OperationPlan, expected: Option<u64>) -> Result<u64> {
        let mut state = self.state.write().await;
        let key = plan.key();
        let stored = state.plans.get(&key).map(|p| p.version);
        check_version(&key, stored, expected)?;

        let version = stored.unwrap_or(0) + 1;
        state.plans.insert(
            key,
            VersionedPlan {
                version,
                plan: plan.clone(),
            },
        );
        Ok(version)
    }

    async fn upsert_plan(&self, plan: &OperationPlan) -> Result<u64> {
        let mut state = self.state.write().await;
        let key = plan.key();
        let version = state.plans.get(&key).map(|p| p.version).unwrap_or(0) + 1;
        state.plans.insert(
            key,
            VersionedPlan {
                version,
                plan: plan.clone(),
            },
        );
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::OperationType;
    use crate::domain::plan::Phase;

    fn plan_for(op: &Operation) -> OperationPlan {
        OperationPlan::new(op, vec![Phase::new("/init", "Init").with_executor("noop")])
    }

    #[tokio::test]
    async fn test_versioned_writes() {
        let backend = MemoryBackend::new("memory");
        let op = Operation::new(OperationType::Update, "prod", vec![]);
        let plan = plan_for(&op);

        assert_eq!(backend.put_plan(&plan, None).await.unwrap(), 1);
        assert!(backend.put_plan(&plan, None).await.unwrap_err().is_already_exists());
        assert_eq!(backend.put_plan(&plan, Some(1)).await.unwrap(), 2);
        assert!(backend.put_plan(&plan, Some(1)).await.unwrap_err().is_conflict());
        assert_eq!(backend.get_plan(&op.key()).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_operations() {
        let backend = MemoryBackend::new("memory");
        let op = Operation::new(OperationType::GarbageCollect, "prod", vec![]);
        backend.create_operation(&op).await.unwrap();
        assert!(backend.create_operation(&op).await.unwrap_err().is_already_exists());
        assert_eq!(backend.get_operation(&op.key()).await.unwrap(), op);
        assert_eq!(backend.list_operations(Some("prod")).await.unwrap().len(), 1);
        assert!(backend.list_operations(Some("staging")).await.unwrap().is_empty());
    }
}
