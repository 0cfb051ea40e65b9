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

use super::{Backend, VersionedPlan};
use crate::domain::operation::{Operation, OperationKey};
use crate::domain::plan::OperationPlan;
use crate::shared::error::{OpsError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Bounds every call on the inner backend so callers can fail fast to a
/// local copy when the shared backend is down.
pub struct TimeoutBackend {
    inner: Arc<dyn Backend>,
    timeout: Duration,
}

impl TimeoutBackend {
    pub fn new(inner: Arc<dyn Backend>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, fut).await.map_err(|_| {
            OpsError::Timeout(format!(
                "{} on {} did not finish within {:?}",
                what,
                self.inner.name(),
                self.timeout
            ))
        })?
    }
}

#[async_trait::async_trait]
impl Backend for TimeoutBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn create_operation(&self, operation: &Operation) -> Result<()> {
        self.bounded("create operation", self.inner.create_operation(operation))
            .await
    }

    async fn get_operation(&self, key: &OperationKey) -> Result<Operation> {
        self.bounded("get operation", self.inner.get_operation(key)).await
    }

    async fn update_operation(&self, operation: &Operation) -> Result<()> {
        self.bounded("update operation", self.inner.update_operation(operation))
            .await
    }

    async fn list_operations(&self, cluster_name: Option<&str>) -> Result<Vec<Operation>> {
        self.bounded("list operations", self.inner.list_operations(cluster_name))
            .await
    }

    async fn get_plan(&self, key: &OperationKey) -> Result<VersionedPlan> {
        self.bounded("get plan", self.inner.get_plan(key)).await
    }

    async fn put_plan(&self, plan: &OperationPlan, expected: Option<u64>) -> Result<u64> {
        self.bounded("put plan", self.inner.put_plan(plan, expected))
            .await
    }

    async fn upsert_plan(&self, plan: &OperationPlan) -> Result<u64> {
        self.bounded("upsert plan", self.inner.upsert_plan(plan)).await
    }
}
