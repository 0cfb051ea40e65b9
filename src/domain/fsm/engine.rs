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

//! Phase state machine of one operation
//!
//! Leaves run through their executor; containers run their children as a
//! DAG ordered by sibling requirements. Siblings without a dependency path
//! between them run concurrently, bounded by `parallel_workers`. A failed
//! phase blocks only the siblings that depend on it; a failed state write or
//! cancellation stops the whole run.

use super::executor::ExecutorRegistry;
use crate::domain::operation::{Operation, OperationKey, OperationState};
use crate::domain::plan::{is_within, OperationPlan, Phase, PhaseState, ROOT_PHASE};
use crate::domain::store::PlanStore;
use crate::shared::context::OpContext;
use crate::shared::error::{ErrorDetail, OpsError, Result};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Span};

#[derive(Debug, Clone)]
pub struct FsmConfig {
    pub parallel_workers: usize,
    pub phase_timeout: Duration,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            parallel_workers: crate::infrastructure::constants::DEFAULT_PARALLEL_WORKERS,
            phase_timeout: crate::infrastructure::constants::DEFAULT_PHASE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RunOptions {
    force: bool,
    /// Re-run a completed leaf. Only set when the leaf is addressed directly.
    rerun_completed: bool,
    /// Re-run leaves left in progress by an interrupted executor.
    retry_interrupted: bool,
    timeout: Option<Duration>,
}

/// Why a subtree stopped. Phase failures let independent siblings go on;
/// fatal ones stop the run.
enum Failure {
    Phase(OpsError),
    Fatal(OpsError),
}

impl Failure {
    fn into_error(self) -> OpsError {
        match self {
            Failure::Phase(e) | Failure::Fatal(e) => e,
        }
    }
}

struct FsmInner {
    key: OperationKey,
    store: Arc<PlanStore>,
    executors: Arc<ExecutorRegistry>,
    config: FsmConfig,
    workers: Semaphore,
    span: Span,
}

#[derive(Clone)]
pub struct Fsm {
    inner: Arc<FsmInner>,
}

impl Fsm {
    pub fn new(
        key: OperationKey,
        store: Arc<PlanStore>,
        executors: Arc<ExecutorRegistry>,
        config: FsmConfig,
        span: Span,
    ) -> Self {
        let workers = Semaphore::new(config.parallel_workers.max(1));
        Self {
            inner: Arc::new(FsmInner {
                key,
                store,
                executors,
                config,
                workers,
                span,
            }),
        }
    }

    pub fn key(&self) -> &OperationKey {
        &self.inner.key
    }

    pub fn store(&self) -> &Arc<PlanStore> {
        &self.inner.store
    }

    /// Current plan, reconciled with the cluster copy when there is one.
    pub async fn plan(&self) -> Result<OperationPlan> {
        self.inner.store.load_plan(&self.inner.key).await
    }

    pub async fn operation(&self) -> Result<Operation> {
        self.inner.store.get_operation(&self.inner.key).await
    }

    /// Executes a phase, or every eligible phase for `/`.
    pub async fn execute_phase(&self, ctx: &OpContext, phase_id: &str, timeout: Option<Duration>, force: bool) -> Result<()> {
        let plan = self.plan().await?;
        if phase_id != ROOT_PHASE {
            plan.get(phase_id)?;
        }
        self.ensure_started().await?;

        let direct = phase_id != ROOT_PHASE;
        let opts = RunOptions {
            force,
            rerun_completed: force && direct,
            retry_interrupted: false,
            timeout,
        };
        let result = if direct {
            self.clone().run_tree(ctx.clone(), phase_id.to_string(), opts).await
        } else {
            self.run_group(ctx.clone(), plan.child_ids(ROOT_PHASE)?, opts).await
        };
        result.map_err(Failure::into_error)
    }

    /// Picks up an interrupted or failed plan where it stopped. Completed
    /// phases are never run again.
    pub async fn resume(&self, ctx: &OpContext) -> Result<()> {
        let plan = self.plan().await?;
        if plan.is_completed() {
            info!(parent: &self.inner.span, operation = %self.inner.key, "plan already completed, nothing to resume");
            return Ok(());
        }
        if let Some(next) = plan.leaves().into_iter().find(|p| p.state != PhaseState::Completed) {
            info!(parent: &self.inner.span, operation = %self.inner.key, phase = %next.id,
                state = %next.state, "resuming plan");
        }
        self.ensure_started().await?;

        let opts = RunOptions {
            force: false,
            rerun_completed: false,
            retry_interrupted: true,
            timeout: None,
        };
        self.run_group(ctx.clone(), plan.child_ids(ROOT_PHASE)?, opts)
            .await
            .map_err(Failure::into_error)
    }

    /// Runs the compensating action of a phase, or of the whole plan for `/`
    /// in reverse order.
    pub async fn rollback_phase(&self, ctx: &OpContext, phase_id: &str, timeout: Option<Duration>, force: bool) -> Result<()> {
        let plan = self.plan().await?;
        if phase_id != ROOT_PHASE {
            plan.get(phase_id)?;
            if !force {
                check_dependents(&plan, phase_id)?;
            }
        }
        self.rollback_tree(ctx, phase_id.to_string(), timeout, force, true).await
    }

    /// Marks the operation finished: failed when `error` is given, completed
    /// otherwise. The final state is copied to the cluster backend.
    pub async fn complete(&self, error: Option<&OpsError>) -> Result<Operation> {
        let mut operation = self.operation().await?;
        let plan = self.plan().await?;

        let next = match error {
            Some(_) => OperationState::Failed,
            None => {
                if !plan.is_completed() {
                    warn!(parent: &self.inner.span, operation = %self.inner.key,
                        "marking operation completed although its plan is not");
                }
                OperationState::Completed
            }
        };
        operation.transition(next)?;
        operation.error = error.map(|e| e.to_string());

        self.inner.store.update_operation(&operation).await?;
        self.inner.store.archive(&operation, &plan).await;
        info!(parent: &self.inner.span, operation = %self.inner.key, state = %operation.state, "operation finished");
        Ok(operation)
    }

    /// Records a phase state without running anything.
    pub async fn set_phase_state(&self, phase_id: &str, state: PhaseState) -> Result<OperationPlan> {
        let id = phase_id.to_string();
        let plan = self
            .inner
            .store
            .update_plan(&self.inner.key, move |plan| plan.set_state(&id, state, None))
            .await?;
        warn!(parent: &self.inner.span, operation = %self.inner.key, phase = phase_id, state = %state,
            "phase state set manually");
        Ok(plan)
    }

    async fn ensure_started(&self) -> Result<()> {
        let mut operation = self.operation().await?;
        match operation.state {
            OperationState::InProgress => Ok(()),
            OperationState::Pending => {
                operation.transition(OperationState::InProgress)?;
                self.inner.store.update_operation(&operation).await
            }
            state => Err(OpsError::precondition(format!(
                "operation {} is already {}",
                operation.id, state
            ))),
        }
    }

    async fn record(&self, phase_id: &str, state: PhaseState, error: Option<ErrorDetail>) -> Result<()> {
        let id = phase_id.to_string();
        self.inner
            .store
            .update_plan(&self.inner.key, move |plan| plan.set_state(&id, state, error.clone()))
            .await?;
        Ok(())
    }

    fn run_tree(self, ctx: OpContext, id: String, opts: RunOptions) -> BoxFuture<'static, std::result::Result<(), Failure>> {
        Box::pin(async move {
            let plan = self.plan().await.map_err(Failure::Fatal)?;
            let phase = plan.get(&id).map_err(Failure::Phase)?.clone();

            if !opts.force {
                let unmet = plan.unmet_requirements(&id).map_err(Failure::Phase)?;
                if let Some(first) = unmet.first() {
                    let state = plan.find(first).map(|p| p.state).unwrap_or_default();
                    return Err(Failure::Phase(OpsError::precondition(format!(
                        "phase {} requires {} which is {}",
                        id, first, state
                    ))));
                }
            }

            if phase.is_leaf() {
                return self.run_leaf(&ctx, &plan, phase, opts).await;
            }

            let children = plan.child_ids(&id).map_err(Failure::Phase)?;
            let child_opts = RunOptions {
                rerun_completed: false,
                ..opts
            };
            self.run_group(ctx, children, child_opts).await
        })
    }

    async fn run_group(&self, ctx: OpContext, group: Vec<String>, opts: RunOptions) -> std::result::Result<(), Failure> {
        let plan = self.plan().await.map_err(Failure::Fatal)?;
        let order = plan.topological_order(&group).map_err(Failure::Phase)?;
        let deps = plan.sibling_dependencies(&group).map_err(Failure::Phase)?;
        drop(plan);

        let group_ctx = ctx.child();
        let mut finished: HashMap<String, bool> = HashMap::new();
        let mut started: HashSet<String> = HashSet::new();
        let mut errors: Vec<OpsError> = Vec::new();
        let mut fatal: Option<OpsError> = None;
        let mut tasks: JoinSet<(String, std::result::Result<(), Failure>)> = JoinSet::new();

        loop {
            // Skipped phases may unblock further skips, so scan until stable.
            while fatal.is_none() {
                let before = finished.len();
                for id in &order {
                    if started.contains(id) {
                        continue;
                    }
                    let waits = deps.get(id).map(Vec::as_slice).unwrap_or_default();
                    if !waits.iter().all(|d| finished.contains_key(d)) {
                        continue;
                    }
                    started.insert(id.clone());

                    if let Some(failed) = waits.iter().find(|d| finished.get(*d) == Some(&false)) {
                        warn!(parent: &self.inner.span, phase = %id, requirement = %failed,
                            "not attempting phase, its requirement did not complete");
                        finished.insert(id.clone(), false);
                        continue;
                    }

                    let fsm = self.clone();
                    let task_ctx = group_ctx.clone();
                    let task_id = id.clone();
                    tasks.spawn(async move {
                        let result = fsm.run_tree(task_ctx, task_id.clone(), opts).await;
                        (task_id, result)
                    });
                }
                if finished.len() == before {
                    break;
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((id, Ok(()))) => {
                    finished.insert(id, true);
                }
                Ok((id, Err(Failure::Phase(e)))) => {
                    finished.insert(id, false);
                    match e {
                        OpsError::Aggregate(inner) => errors.extend(inner),
                        e => errors.push(e),
                    }
                }
                Ok((id, Err(Failure::Fatal(e)))) => {
                    finished.insert(id, false);
                    if fatal.is_none() {
                        group_ctx.cancel();
                        fatal = Some(e);
                    }
                }
                Err(e) => {
                    group_ctx.cancel();
                    fatal.get_or_insert(OpsError::backend(format!("phase task aborted: {}", e)));
                }
            }
        }

        if let Some(e) = fatal {
            return Err(Failure::Fatal(e));
        }
        OpsError::aggregate(errors).map_err(Failure::Phase)
    }

    async fn run_leaf(&self, ctx: &OpContext, plan: &OperationPlan, phase: Phase, opts: RunOptions) -> std::result::Result<(), Failure> {
        match phase.state {
            PhaseState::Completed if !opts.rerun_completed => {
                debug!(parent: &self.inner.span, phase = %phase.id, "phase already completed");
                return Ok(());
            }
            PhaseState::InProgress if !opts.force && !opts.retry_interrupted => {
                return Err(Failure::Phase(OpsError::precondition(format!(
                    "phase {} is already in progress, use force to run it again",
                    phase.id
                ))));
            }
            _ => {}
        }

        let executor = self.inner.executors.resolve(&phase.executor).map_err(Failure::Phase)?;
        let what = format!("phase {}", phase.id);

        let _permit = tokio::select! {
            permit = self.inner.workers.acquire() => permit.map_err(|e| Failure::Fatal(OpsError::backend(e.to_string())))?,
            _ = ctx.token().cancelled() => return Err(Failure::Fatal(OpsError::Cancelled(what))),
        };

        self.record(&phase.id, PhaseState::InProgress, None).await.map_err(Failure::Fatal)?;
        info!(parent: &self.inner.span, phase = %phase.id, executor = executor.name(), "executing phase");

        let timeout = opts.timeout.unwrap_or(self.inner.config.phase_timeout);
        let phase_ctx = ctx.with_timeout(timeout);
        let result = phase_ctx.run(&what, executor.execute(&phase_ctx, plan, &phase)).await;

        match result {
            Ok(()) => {
                self.record(&phase.id, PhaseState::Completed, None).await.map_err(Failure::Fatal)?;
                info!(parent: &self.inner.span, phase = %phase.id, "phase completed");
                Ok(())
            }
            Err(e) => {
                let interrupted = ctx.is_cancelled();
                let err = phase_error(&phase.id, e);
                error!(parent: &self.inner.span, phase = %phase.id, error = %err, "phase failed");
                self.record(&phase.id, PhaseState::Failed, Some(ErrorDetail::from(&err)))
                    .await
                    .map_err(Failure::Fatal)?;
                if interrupted {
                    Err(Failure::Fatal(err))
                } else {
                    Err(Failure::Phase(err))
                }
            }
        }
    }

    fn rollback_tree<'a>(
        &'a self,
        ctx: &'a OpContext,
        id: String,
        timeout: Option<Duration>,
        force: bool,
        direct: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let plan = self.plan().await?;
            let state = plan.state_of(&id)?;
            let is_leaf = id != ROOT_PHASE && plan.get(&id)?.is_leaf();

            if state == PhaseState::RolledBack {
                debug!(parent: &self.inner.span, phase = %id, "phase already rolled back");
                return Ok(());
            }
            if state == PhaseState::Unstarted {
                if direct {
                    return Err(OpsError::precondition(format!("phase {} has not been executed", id)));
                }
                return Ok(());
            }

            if !is_leaf {
                let children = plan.child_ids(&id)?;
                let mut order = plan.topological_order(&children)?;
                order.reverse();
                for child in order {
                    ctx.check(&format!("rollback of {}", child))?;
                    self.rollback_tree(ctx, child, timeout, force, false).await?;
                }
                return Ok(());
            }

            let phase = plan.get(&id)?.clone();
            if phase.state != PhaseState::Completed && !force {
                if direct {
                    return Err(OpsError::precondition(format!(
                        "phase {} is {}, only completed phases can be rolled back without force",
                        id, phase.state
                    )));
                }
                warn!(parent: &self.inner.span, phase = %id, state = %phase.state,
                    "skipping rollback of phase that did not complete");
                return Ok(());
            }

            let executor = self.inner.executors.resolve(&phase.executor)?;
            if !executor.supports_rollback() {
                return Err(OpsError::bad_parameter(format!(
                    "phase {} ({} executor) cannot be rolled back",
                    id,
                    executor.name()
                )));
            }

            self.record(&id, PhaseState::InProgress, None).await?;
            info!(parent: &self.inner.span, phase = %id, "rolling back phase");

            let phase_ctx = ctx.with_timeout(timeout.unwrap_or(self.inner.config.phase_timeout));
            let what = format!("rollback of phase {}", id);
            match phase_ctx.run(&what, executor.rollback(&phase_ctx, &plan, &phase)).await {
                Ok(()) => {
                    self.record(&id, PhaseState::RolledBack, None).await?;
                    info!(parent: &self.inner.span, phase = %id, "phase rolled back");
                    Ok(())
                }
                Err(e) => {
                    let err = phase_error(&id, e);
                    error!(parent: &self.inner.span, phase = %id, error = %err, "rollback failed");
                    self.record(&id, PhaseState::Failed, Some(ErrorDetail::from(&err))).await?;
                    Err(err)
                }
            }
        })
    }
}

/// Fails if a phase that depends on `id` still holds its effect.
fn check_dependents(plan: &OperationPlan, id: &str) -> Result<()> {
    for leaf in plan.leaves() {
        if is_within(&leaf.id, id) || !matches!(leaf.state, PhaseState::Completed | PhaseState::InProgress) {
            continue;
        }
        let depends = plan
            .requirements_of(&leaf.id)?
            .iter()
            .any(|req| is_within(req, id) || is_within(id, req));
        if depends {
            return Err(OpsError::precondition(format!(
                "phase {} depends on {} and is {}, roll it back first or use force",
                leaf.id, id, leaf.state
            )));
        }
    }
    Ok(())
}

fn phase_error(id: &str, err: OpsError) -> OpsError {
    match err {
        OpsError::PhaseFailed { .. }
        | OpsError::Timeout(_)
        | OpsError::Cancelled(_)
        | OpsError::AccessDenied(_)
        | OpsError::Precondition(_) => err,
        other => OpsError::PhaseFailed {
            phase: id.to_string(),
            message: other.to_string(),
        },
    }
}
