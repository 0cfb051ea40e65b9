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

//! Key-value storage of operations and plans

pub mod file;
pub mod memory;
pub mod timeout;

pub use self::file::FileBackend;
pub use self::memory::MemoryBackend;
pub use self::timeout::TimeoutBackend;

use crate::domain::operation::{Operation, OperationKey};
use crate::domain::plan::OperationPlan;
use crate::shared::error::{OpsError, Result};
use serde::{Deserialize, Serialize};

/// A stored plan together with its write version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedPlan {
    pub version: u64,
    pub plan: OperationPlan,
}

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Fails with `AlreadyExists` if the operation is already recorded.
    async fn create_operation(&self, operation: &Operation) -> Result<()>;

    async fn get_operation(&self, key: &OperationKey) -> Result<Operation>;

    /// Creates or replaces the operation record.
    async fn update_operation(&self, operation: &Operation) -> Result<()>;

    async fn list_operations(&self, cluster_name: Option<&str>) -> Result<Vec<Operation>>;

    async fn get_plan(&self, key: &OperationKey) -> Result<VersionedPlan>;

    /// Writes the whole plan document. With `expected = None` the plan must
    /// not exist yet; otherwise the stored version must equal `expected`.
    /// Returns the new version.
    async fn put_plan(&self, plan: &OperationPlan, expected: Option<u64>) -> Result<u64>;

    /// Overwrites the plan regardless of the stored version.
    async fn upsert_plan(&self, plan: &OperationPlan) -> Result<u64>;
}

/// Most recently created operation, optionally restricted to one cluster.
pub async fn last_operation(backend: &dyn Backend, cluster_name: Option<&str>) -> Result<Operation> {
    let mut operations = backend.list_operations(cluster_name).await?;
    operations.sort_by(|a, b| a.created.cmp(&b.created));
    operations
        .pop()
        .ok_or_else(|| OpsError::not_found("operation", format!("last operation in {}", backend.name())))
}

pub(crate) fn check_version(key: &OperationKey, stored: Option<u64>, expected: Option<u64>) -> Result<()> {
    match (stored, expected) {
        (None, None) => Ok(()),
        (Some(_), None) => Err(OpsError::already_exists("plan", key.to_string())),
        (None, Some(_)) => Err(OpsError::not_found("plan", key.to_string())),
        (Some(current), Some(wanted)) if current == wanted => Ok(()),
        (Some(current), Some(wanted)) => Err(OpsError::Conflict(format!(
            "plan {} was modified concurrently (expected version {}, found {})",
            key, wanted, current
        ))),
    }
}

/// Serialized form used by persistent backends.
pub fn encode_plan(plan: &VersionedPlan) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(plan)?)
}

pub fn decode_plan(bytes: &[u8]) -> Result<VersionedPlan> {
    Ok(serde_json::from_slice(bytes)?)
}
