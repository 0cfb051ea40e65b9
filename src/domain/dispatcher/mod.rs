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

//! Routes operation requests to an FSM bound to the right backends

pub mod builders;
pub mod environment;
pub mod resolver;

pub use self::environment::{EnvironmentFactory, LocalEnvironmentFactory, MemoryEnvironmentFactory, OperationSource};
pub use self::resolver::{OperationSourceResolver, OperationsCache, ResolvedOperation};

use self::builders::PlanBuilder;
use crate::domain::fsm::{ExecutorRegistry, Fsm, FsmConfig};
use crate::domain::operation::{Operation, OperationKey, OperationState, OperationType, Server};
use crate::domain::plan::{OperationPlan, Phase, PhaseState};
use crate::domain::store::PlanStore;
use crate::shared::context::OpContext;
use crate::shared::error::{OpsError, Result};
use crate::shared::retry::RetryPolicy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Span};

/// Which backends hold an operation's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPairing {
    /// Cluster backend only.
    Cluster,
    /// A node-local backend, mirrored to the cluster backend.
    Local(OperationSource),
    /// The install wizard backend; no cluster exists yet.
    Wizard,
}

/// How one operation type is driven.
#[derive(Clone, Copy)]
pub struct OperationHandler {
    pub pairing: BackendPairing,
    pub supports_rollback: bool,
    pub builder: PlanBuilder,
}

/// Phase-level request parameters.
#[derive(Debug, Clone)]
pub struct PhaseParams {
    pub phase_id: String,
    pub force: bool,
    pub timeout: Option<Duration>,
}

impl PhaseParams {
    pub fn root() -> Self {
        Self {
            phase_id: crate::domain::plan::ROOT_PHASE.to_string(),
            force: false,
            timeout: None,
        }
    }
}

/// Request to start a new operation.
#[derive(Debug, Clone)]
pub struct CreateOperation {
    pub kind: OperationType,
    pub cluster_name: String,
    pub servers: Vec<Server>,
    /// Phases to use instead of the built-in layout.
    pub phases: Option<Vec<Phase>>,
}

pub struct OperationDispatcher {
    factory: Arc<dyn EnvironmentFactory>,
    executors: Arc<ExecutorRegistry>,
    handlers: HashMap<OperationType, OperationHandler>,
    fsm_config: FsmConfig,
    retry: RetryPolicy,
    span: Span,
}

impl OperationDispatcher {
    pub fn new(
        factory: Arc<dyn EnvironmentFactory>,
        executors: Arc<ExecutorRegistry>,
        fsm_config: FsmConfig,
        retry: RetryPolicy,
        span: Span,
    ) -> Self {
        Self {
            factory,
            executors,
            handlers: Self::default_handlers(),
            fsm_config,
            retry,
            span,
        }
    }

    fn default_handlers() -> HashMap<OperationType, OperationHandler> {
        use BackendPairing::*;

        let update = Local(OperationSource::Update);
        let table: [(OperationType, BackendPairing, bool, PlanBuilder); 7] = [
            (OperationType::Install, Wizard, true, builders::install_plan),
            (OperationType::Expand, Local(OperationSource::Join), true, builders::expand_plan),
            (OperationType::Update, update, true, builders::update_plan),
            (OperationType::UpdateConfig, update, true, builders::update_config_plan),
            (OperationType::UpdateRuntimeEnviron, update, true, builders::update_environ_plan),
            (OperationType::GarbageCollect, Cluster, false, builders::gc_plan),
            (OperationType::Reconfigure, update, true, builders::reconfigure_plan),
        ];
        table
            .into_iter()
            .map(|(kind, pairing, supports_rollback, builder)| {
                (
                    kind,
                    OperationHandler {
                        pairing,
                        supports_rollback,
                        builder,
                    },
                )
            })
            .collect()
    }

    /// Replaces the handler of one operation type.
    pub fn register(&mut self, kind: OperationType, handler: OperationHandler) {
        self.handlers.insert(kind, handler);
    }

    pub fn handler(&self, kind: OperationType) -> Result<&OperationHandler> {
        self.handlers
            .get(&kind)
            .ok_or_else(|| OpsError::bad_parameter(format!("unsupported operation type {}", kind)))
    }

    /// Plan store for operations of `kind`.
    pub fn store_for(&self, kind: OperationType) -> Result<Arc<PlanStore>> {
        let handler = self.handler(kind)?;
        let (cluster, local) = match handler.pairing {
            BackendPairing::Cluster => (Some(self.factory.new_cluster_env(None)?), None),
            BackendPairing::Wizard => (None, Some(self.factory.new_wizard_env()?)),
            BackendPairing::Local(source) => {
                let local = self.factory.env(source, None)?;
                (Some(self.factory.new_cluster_env(None)?), local)
            }
        };
        let span = tracing::info_span!(parent: &self.span, "store", kind = kind.as_str());
        Ok(Arc::new(PlanStore::new(cluster, local, self.retry, span)?))
    }

    pub fn fsm(&self, operation: &Operation) -> Result<Fsm> {
        let store = self.store_for(operation.kind)?;
        let span = tracing::info_span!(parent: &self.span, "fsm", operation = %operation.id, kind = operation.kind.as_str());
        Ok(Fsm::new(
            operation.key(),
            store,
            self.executors.clone(),
            self.fsm_config.clone(),
            span,
        ))
    }

    /// Records a new operation with its plan. If anything fails once the
    /// record exists, the operation is marked failed before returning.
    pub async fn create_operation(&self, request: CreateOperation) -> Result<(Operation, OperationPlan)> {
        let handler = *self.handler(request.kind)?;
        let mut operation = Operation::new(request.kind, request.cluster_name, request.servers);

        let phases = match request.phases {
            Some(phases) => phases,
            None => (handler.builder)(&operation)?,
        };
        let plan = OperationPlan::new(&operation, phases);
        plan.validate()?;

        let store = self.store_for(operation.kind)?;
        match store.create_plan(&operation, &plan).await {
            Ok(()) => {
                info!(parent: &self.span, operation = %operation.id, kind = %operation.kind,
                    phases = plan.all_phases().len(), "created operation");
                Ok((operation, plan))
            }
            Err(e) => {
                error!(parent: &self.span, operation = %operation.id, error = %e, "failed to initialize operation");
                self.mark_failed(&store, &mut operation, &e).await;
                Err(e)
            }
        }
    }

    async fn mark_failed(&self, store: &PlanStore, operation: &mut Operation, cause: &OpsError) {
        let key = operation.key();
        if let Err(e) = store.get_operation(&key).await {
            if !e.is_not_found() {
                warn!(parent: &self.span, operation = %key, error = %e, "could not check operation record");
            }
            return;
        }
        if operation.transition(OperationState::Failed).is_err() {
            return;
        }
        operation.error = Some(cause.to_string());
        if let Err(e) = store.update_operation(operation).await {
            warn!(parent: &self.span, operation = %key, error = %e, "failed to mark operation failed");
        }
    }

    /// Creates an operation and, unless `manual`, runs its plan to the end.
    pub async fn start_operation(&self, ctx: &OpContext, request: CreateOperation, manual: bool) -> Result<Operation> {
        let (operation, _) = self.create_operation(request).await?;
        if manual {
            info!(parent: &self.span, operation = %operation.id, "operation created in manual mode");
            return Ok(operation);
        }
        self.run_to_completion(ctx, &operation).await
    }

    /// Executes the whole plan and finishes the operation with the outcome.
    /// A cancelled run leaves the operation open so it can be resumed.
    pub async fn run_to_completion(&self, ctx: &OpContext, operation: &Operation) -> Result<Operation> {
        let fsm = self.fsm(operation)?;
        let result = fsm.resume(ctx).await;
        match result {
            Ok(()) => fsm.complete(None).await,
            Err(e @ OpsError::Cancelled(_)) => Err(e),
            Err(e) => {
                if let Err(complete_err) = fsm.complete(Some(&e)).await {
                    warn!(parent: &self.span, operation = %operation.id, error = %complete_err,
                        "failed to mark operation failed");
                }
                Err(e)
            }
        }
    }

    pub async fn plan(&self, operation: &Operation) -> Result<OperationPlan> {
        self.fsm(operation)?.plan().await
    }

    pub async fn execute_phase(&self, ctx: &OpContext, operation: &Operation, params: &PhaseParams) -> Result<()> {
        let fsm = self.fsm(operation)?;
        fsm.execute_phase(ctx, &params.phase_id, params.timeout, params.force).await
    }

    pub async fn rollback_phase(&self, ctx: &OpContext, operation: &Operation, params: &PhaseParams) -> Result<()> {
        if !self.handler(operation.kind)?.supports_rollback {
            return Err(OpsError::bad_parameter(format!(
                "{} operations have no rollback phases",
                operation.kind
            )));
        }
        let fsm = self.fsm(operation)?;
        fsm.rollback_phase(ctx, &params.phase_id, params.timeout, params.force).await
    }

    pub async fn resume(&self, ctx: &OpContext, operation: &Operation) -> Result<()> {
        self.fsm(operation)?.resume(ctx).await
    }

    pub async fn complete(&self, operation: &Operation, error: Option<&OpsError>) -> Result<Operation> {
        self.fsm(operation)?.complete(error).await
    }

    pub async fn set_phase_state(&self, operation: &Operation, phase_id: &str, state: PhaseState) -> Result<OperationPlan> {
        self.fsm(operation)?.set_phase_state(phase_id, state).await
    }

    pub async fn get_operation(&self, key: &OperationKey, kind: OperationType) -> Result<Operation> {
        self.store_for(kind)?.get_operation(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::ServerRole;

    fn dispatcher(factory: Arc<MemoryEnvironmentFactory>) -> OperationDispatcher {
        OperationDispatcher::new(
            factory,
            Arc::new(ExecutorRegistry::new()),
            FsmConfig::default(),
            RetryPolicy::default(),
            Span::none(),
        )
    }

    fn noop_phases() -> Vec<Phase> {
        vec![
            Phase::new("/a", "A").with_executor("noop"),
            Phase::new("/b", "B").with_executor("noop").requires("/a"),
        ]
    }

    fn request(kind: OperationType) -> CreateOperation {
        CreateOperation {
            kind,
            cluster_name: "prod".to_string(),
            servers: vec![Server::new("m1", "10.0.0.1", ServerRole::Master)],
            phases: Some(noop_phases()),
        }
    }

    #[tokio::test]
    async fn test_update_uses_local_and_cluster_backends() {
        let factory = Arc::new(MemoryEnvironmentFactory::default());
        let dispatcher = dispatcher(factory.clone());

        let (op, plan) = dispatcher.create_operation(request(OperationType::Update)).await.unwrap();
        assert_eq!(factory.update().get_plan(&op.key()).await.unwrap().plan, plan);
        assert_eq!(factory.cluster().get_plan(&op.key()).await.unwrap().plan, plan);
        assert!(factory.wizard().get_plan(&op.key()).await.is_err());
    }

    #[tokio::test]
    async fn test_install_uses_wizard_backend() {
        let factory = Arc::new(MemoryEnvironmentFactory::default());
        let dispatcher = dispatcher(factory.clone());

        let (op, _) = dispatcher.create_operation(request(OperationType::Install)).await.unwrap();
        assert!(factory.wizard().get_plan(&op.key()).await.is_ok());
        assert!(factory.cluster().get_plan(&op.key()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_gc_rollback_is_bad_parameter() {
        let factory = Arc::new(MemoryEnvironmentFactory::default());
        let dispatcher = dispatcher(factory);

        let (op, _) = dispatcher.create_operation(request(OperationType::GarbageCollect)).await.unwrap();
        let err = dispatcher
            .rollback_phase(&OpContext::default(), &op, &PhaseParams::root())
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::BadParameter(_)));
    }

    #[tokio::test]
    async fn test_invalid_plan_is_rejected_before_anything_is_stored() {
        let factory = Arc::new(MemoryEnvironmentFactory::default());
        let dispatcher = dispatcher(factory.clone());

        let mut req = request(OperationType::Update);
        req.phases = Some(vec![Phase::new("/a", "A").requires("/missing")]);
        assert!(dispatcher.create_operation(req).await.is_err());
        assert!(factory.update().list_operations(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_operation_runs_to_completion() {
        let factory = Arc::new(MemoryEnvironmentFactory::default());
        let dispatcher = dispatcher(factory);

        let op = dispatcher
            .start_operation(&OpContext::default(), request(OperationType::Update), false)
            .await
            .unwrap();
        assert_eq!(op.state, OperationState::Completed);
        assert!(dispatcher.plan(&op).await.unwrap().is_completed());
    }
}
