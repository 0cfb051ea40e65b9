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

//! Finds operations across every backend they may live in
//!
//! Sources are queried in a fixed order: cluster, update, join. A later
//! source overrides an earlier entry with the same ID, since node-local
//! copies are written first. The wizard backend is consulted only when no
//! other source knows any operation.

use super::environment::{EnvironmentFactory, OperationSource};
use crate::domain::operation::Operation;
use crate::shared::error::{OpsError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn, Span};

const SOURCE_ORDER: [OperationSource; 3] = [OperationSource::Cluster, OperationSource::Update, OperationSource::Join];

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOperation {
    pub operation: Operation,
    pub source: OperationSource,
}

/// Operations by ID, built fresh for one command.
#[derive(Debug, Default)]
pub struct OperationsCache {
    entries: BTreeMap<String, ResolvedOperation>,
}

impl OperationsCache {
    fn insert(&mut self, operation: Operation, source: OperationSource) {
        self.entries
            .insert(operation.id.clone(), ResolvedOperation { operation, source });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, operation_id: &str) -> Option<&ResolvedOperation> {
        self.entries.get(operation_id)
    }

    /// Unfinished operations, oldest first.
    pub fn active(&self) -> Vec<&ResolvedOperation> {
        let mut active: Vec<&ResolvedOperation> = self
            .entries
            .values()
            .filter(|e| !e.operation.is_finished())
            .collect();
        active.sort_by_key(|e| e.operation.created);
        active
    }

    pub fn last(&self) -> Option<&ResolvedOperation> {
        self.entries.values().max_by_key(|e| e.operation.created)
    }

    /// All entries, newest first.
    pub fn list(&self) -> Vec<&ResolvedOperation> {
        let mut all: Vec<&ResolvedOperation> = self.entries.values().collect();
        all.sort_by(|a, b| b.operation.created.cmp(&a.operation.created));
        all
    }
}

pub struct OperationSourceResolver {
    factory: Arc<dyn EnvironmentFactory>,
    cluster_timeout: Duration,
    span: Span,
}

impl OperationSourceResolver {
    pub fn new(factory: Arc<dyn EnvironmentFactory>, cluster_timeout: Duration, span: Span) -> Self {
        Self {
            factory,
            cluster_timeout,
            span,
        }
    }

    /// Collects operations of `cluster_name` (all clusters for `None`).
    /// Unreachable sources are skipped with a warning.
    pub async fn operations(&self, cluster_name: Option<&str>) -> Result<OperationsCache> {
        let mut cache = OperationsCache::default();

        for source in SOURCE_ORDER {
            let backend = match self.factory.env(source, Some(self.cluster_timeout)) {
                Ok(Some(backend)) => backend,
                Ok(None) => continue,
                Err(e) => {
                    warn!(parent: &self.span, source = %source, error = %e, "failed to open backend");
                    continue;
                }
            };
            match backend.list_operations(cluster_name).await {
                Ok(operations) => {
                    debug!(parent: &self.span, source = %source, count = operations.len(), "listed operations");
                    for operation in operations {
                        cache.insert(operation, source);
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(parent: &self.span, source = %source, error = %e,
                        "failed to query operations, continuing without this source");
                }
            }
        }

        if cache.is_empty() {
            let wizard = self.factory.new_wizard_env()?;
            match wizard.list_operations(cluster_name).await {
                Ok(operations) => {
                    for operation in operations {
                        cache.insert(operation, OperationSource::Wizard);
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(parent: &self.span, error = %e, "failed to query install wizard backend");
                }
            }
        }

        Ok(cache)
    }

    /// The operation named by `operation_id`, else the single active one,
    /// else the most recent one.
    pub async fn resolve(&self, cluster_name: Option<&str>, operation_id: Option<&str>) -> Result<ResolvedOperation> {
        let cache = self.operations(cluster_name).await?;

        if let Some(id) = operation_id {
            return cache
                .get(id)
                .cloned()
                .ok_or_else(|| OpsError::not_found("operation", id));
        }

        match cache.active().as_slice() {
            [single] => Ok((*single).clone()),
            [] => cache
                .last()
                .cloned()
                .ok_or_else(|| OpsError::not_found("operation", "no operation found")),
            many => {
                let ids: Vec<&str> = many.iter().map(|e| e.operation.id.as_str()).collect();
                Err(OpsError::bad_parameter(format!(
                    "multiple operations are in progress ({}), select one with --operation-id",
                    ids.join(", ")
                )))
            }
        }
    }

    /// Fails if an unfinished operation exists for the cluster.
    pub async fn ensure_no_active(&self, cluster_name: &str) -> Result<()> {
        let cache = self.operations(Some(cluster_name)).await?;
        if let Some(active) = cache.active().first() {
            return Err(OpsError::precondition(format!(
                "operation {} ({}) is still {}, complete or roll it back first",
                active.operation.id, active.operation.kind, active.operation.state
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::dispatcher::environment::MemoryEnvironmentFactory;
    use crate::domain::operation::{OperationState, OperationType};

    fn resolver(factory: Arc<MemoryEnvironmentFactory>) -> OperationSourceResolver {
        OperationSourceResolver::new(factory, Duration::from_secs(1), Span::none())
    }

    #[tokio::test]
    async fn test_later_source_overrides_earlier() {
        let factory = Arc::new(MemoryEnvironmentFactory::default());
        let mut op = Operation::new(OperationType::Update, "prod", vec![]);
        factory.cluster().create_operation(&op).await.unwrap();
        op.transition(OperationState::InProgress).unwrap();
        factory.update().create_operation(&op).await.unwrap();

        let resolved = resolver(factory).resolve(Some("prod"), None).await.unwrap();
        assert_eq!(resolved.source, OperationSource::Update);
        assert_eq!(resolved.operation.state, OperationState::InProgress);
    }

    #[tokio::test]
    async fn test_wizard_only_when_nothing_else() {
        let factory = Arc::new(MemoryEnvironmentFactory::default());
        let install = Operation::new(OperationType::Install, "prod", vec![]);
        factory.wizard().create_operation(&install).await.unwrap();

        let resolved = resolver(factory.clone()).resolve(Some("prod"), None).await.unwrap();
        assert_eq!(resolved.source, OperationSource::Wizard);

        let update = Operation::new(OperationType::Update, "prod", vec![]);
        factory.cluster().create_operation(&update).await.unwrap();
        let cache = resolver(factory).operations(Some("prod")).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&install.id).is_none());
    }

    #[tokio::test]
    async fn test_multiple_active_needs_explicit_id() {
        let factory = Arc::new(MemoryEnvironmentFactory::default());
        let a = Operation::new(OperationType::Update, "prod", vec![]);
        let b = Operation::new(OperationType::GarbageCollect, "prod", vec![]);
        factory.cluster().create_operation(&a).await.unwrap();
        factory.cluster().create_operation(&b).await.unwrap();

        let resolver = resolver(factory);
        assert!(matches!(resolver.resolve(Some("prod"), None).await, Err(OpsError::BadParameter(_))));
        assert_eq!(resolver.resolve(Some("prod"), Some(&b.id)).await.unwrap().operation.id, b.id);
        assert!(resolver.resolve(Some("prod"), Some("missing")).await.unwrap_err().is_not_found());
        assert!(matches!(resolver.ensure_no_active("prod").await, Err(OpsError::Precondition(_))));
    }
}
