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

//! Phase executors and the registry the FSM resolves them from

use crate::domain::plan::{OperationPlan, Phase};
use crate::infrastructure::agent::{AgentRunner, HookRunner, PhaseSpec};
use crate::infrastructure::constants::{EXECUTOR_HOOK, EXECUTOR_NOOP};
use crate::shared::context::OpContext;
use crate::shared::error::{OpsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, Span};

/// Runs the side effect of a leaf phase. Implementations must be idempotent:
/// a phase interrupted after its effect happened is run again on resume.
#[async_trait::async_trait]
pub trait PhaseExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn supports_rollback(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &OpContext, plan: &OperationPlan, phase: &Phase) -> Result<()>;

    async fn rollback(&self, ctx: &OpContext, plan: &OperationPlan, phase: &Phase) -> Result<()>;
}

/// Marker phases with no side effect.
pub struct NoopExecutor;

#[async_trait::async_trait]
impl PhaseExecutor for NoopExecutor {
    fn name(&self) -> &str {
        EXECUTOR_NOOP
    }

    async fn execute(&self, _ctx: &OpContext, _plan: &OperationPlan, _phase: &Phase) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self, _ctx: &OpContext, _plan: &OperationPlan, _phase: &Phase) -> Result<()> {
        Ok(())
    }
}

/// Payload of a phase run by the `hook` executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookAction {
    pub action: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
    /// Hook run on rollback. Defaults to `action` with the rollback flag set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_action: Option<String>,
}

impl HookAction {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            args: BTreeMap::new(),
            rollback_action: None,
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_phase(phase: &Phase) -> Result<Self> {
        let data = phase.data.clone().ok_or_else(|| {
            OpsError::bad_parameter(format!("phase {} has no hook action", phase.id))
        })?;
        Ok(serde_json::from_value(data)?)
    }
}

/// Runs a named hook on the phase's node: in-process when the node is the
/// local one, through the node's agent otherwise.
pub struct HookExecutor {
    local_hostname: String,
    hooks: HookRunner,
    agents: Option<Arc<AgentRunner>>,
    span: Span,
}

impl HookExecutor {
    pub fn new(local_hostname: impl Into<String>, hooks: HookRunner, agents: Option<Arc<AgentRunner>>, span: Span) -> Self {
        Self {
            local_hostname: local_hostname.into(),
            hooks,
            agents,
            span,
        }
    }

    fn spec(&self, plan: &OperationPlan, phase: &Phase, rollback: bool) -> Result<PhaseSpec> {
        let hook = HookAction::from_phase(phase)?;
        let action = match (&hook.rollback_action, rollback) {
            (Some(action), true) => action.clone(),
            _ => hook.action,
        };
        Ok(PhaseSpec {
            operation_id: plan.operation_id.clone(),
            phase_id: phase.id.clone(),
            action,
            args: hook.args,
            rollback,
        })
    }

    async fn run(&self, ctx: &OpContext, plan: &OperationPlan, phase: &Phase, rollback: bool) -> Result<()> {
        let spec = self.spec(plan, phase, rollback)?;

        let remote = phase
            .server
            .as_ref()
            .filter(|server| server.hostname != self.local_hostname);
        let output = match remote {
            None => {
                debug!(parent: &self.span, phase = %phase.id, action = %spec.action, "running hook locally");
                let what = format!("hook {} for phase {}", spec.action, spec.phase_id);
                ctx.run(&what, self.hooks.run(&spec, ctx.token())).await?
            }
            Some(server) => {
                let agents = self.agents.as_ref().ok_or_else(|| {
                    OpsError::precondition(format!(
                        "phase {} targets {} but no agent runner is available",
                        phase.id, server.hostname
                    ))
                })?;
                agents.run_phase(ctx, &server.advertise_addr, &spec).await?
            }
        };

        if !output.is_empty() {
            debug!(parent: &self.span, phase = %phase.id, output = %output, "hook output");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PhaseExecutor for HookExecutor {
    fn name(&self) -> &str {
        EXECUTOR_HOOK
    }

    async fn execute(&self, ctx: &OpContext, plan: &OperationPlan, phase: &Phase) -> Result<()> {
        self.run(ctx, plan, phase, false).await
    }

    async fn rollback(&self, ctx: &OpContext, plan: &OperationPlan, phase: &Phase) -> Result<()> {
        self.run(ctx, plan, phase, true).await
    }
}

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn PhaseExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(NoopExecutor));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn PhaseExecutor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    pub fn with(mut self, executor: Arc<dyn PhaseExecutor>) -> Self {
        self.register(executor);
        self
    }

    /// Looks up the executor of a leaf phase; an empty name means `noop`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn PhaseExecutor>> {
        let name = if name.is_empty() { EXECUTOR_NOOP } else { name };
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| OpsError::bad_parameter(format!("unknown phase executor '{}'", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::{Operation, OperationType, Server, ServerRole};

    #[test]
    fn test_registry_resolves_defaults() {
        let registry = ExecutorRegistry::new();
        assert_eq!(registry.resolve("").unwrap().name(), "noop");
        assert!(matches!(registry.resolve("missing"), Err(OpsError::BadParameter(_))));
    }

    #[test]
    fn test_hook_action_from_phase() {
        let action = HookAction::new("drain").arg("node", "node-2");
        let phase = Phase::new("/drain/node-2", "Drain").with_executor("hook").with_data(action.to_value());
        assert_eq!(HookAction::from_phase(&phase).unwrap(), action);
        assert!(HookAction::from_phase(&Phase::new("/x", "X")).is_err());
    }

    #[tokio::test]
    async fn test_remote_phase_without_agents_is_precondition() {
        let executor = HookExecutor::new("node-1", HookRunner::new("/nonexistent", Span::none()), None, Span::none());
        let op = Operation::new(OperationType::Update, "prod", vec![]);
        let plan = OperationPlan::new(&op, vec![]);
        let phase = Phase::new("/drain/node-2", "Drain")
            .with_executor("hook")
            .with_server(Server::new("node-2", "10.0.0.2", ServerRole::Node))
            .with_data(HookAction::new("drain").to_value());

        let err = executor.execute(&OpContext::default(), &plan, &phase).await.unwrap_err();
        assert!(matches!(err, OpsError::Precondition(_)));
    }
}
