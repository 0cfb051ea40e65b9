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

//! Built-in phase layouts for each operation type
//!
//! Masters are handled one at a time; workers are independent siblings and
//! run in parallel up to the configured worker bound.

use crate::domain::fsm::HookAction;
use crate::domain::operation::{Operation, Server};
use crate::domain::plan::Phase;
use crate::infrastructure::constants::{EXECUTOR_HOOK, EXECUTOR_NOOP};
use crate::shared::error::{OpsError, Result};

pub type PlanBuilder = fn(&Operation) -> Result<Vec<Phase>>;

fn hook(id: impl Into<String>, description: impl Into<String>, action: HookAction) -> Phase {
    Phase::new(id, description)
        .with_executor(EXECUTOR_HOOK)
        .with_data(action.to_value())
}

fn node_hook(id: impl Into<String>, description: impl Into<String>, action: &str, operation: &Operation, server: &Server) -> Phase {
    let action = HookAction::new(action)
        .arg("node", &server.hostname)
        .arg("address", &server.advertise_addr)
        .arg("operation", operation.kind.as_str());
    hook(id, description, action).with_server(server.clone())
}

fn require_servers(operation: &Operation) -> Result<()> {
    if operation.servers.is_empty() {
        return Err(OpsError::bad_parameter(format!(
            "{} operation needs at least one server",
            operation.kind
        )));
    }
    Ok(())
}

/// One container per node under `group`, each running `steps` in order.
/// With `sequential`, every node waits for the previous one.
fn rolling_group(
    group: &str,
    description: &str,
    operation: &Operation,
    servers: &[&Server],
    steps: &[(&str, &str)],
    sequential: bool,
) -> Phase {
    let mut container = Phase::new(group, description);
    let mut previous: Option<String> = None;

    for server in servers {
        let node_id = format!("{}/{}", group, server.hostname);
        let mut node = Phase::new(&node_id, format!("{} on {}", description, server.hostname));
        if sequential {
            if let Some(prev) = &previous {
                node = node.requires(prev.clone());
            }
        }

        let mut prev_step: Option<String> = None;
        for (step, action) in steps {
            let step_id = format!("{}/{}", node_id, step);
            let mut phase = node_hook(&step_id, format!("Run {} on {}", action, server.hostname), action, operation, server);
            if let Some(prev) = &prev_step {
                phase = phase.requires(prev.clone());
            }
            prev_step = Some(step_id);
            node = node.child(phase);
        }

        previous = Some(node_id);
        container = container.child(node);
    }
    container
}

fn masters(operation: &Operation) -> Vec<&Server> {
    operation.servers.iter().filter(|s| s.is_master()).collect()
}

fn workers(operation: &Operation) -> Vec<&Server> {
    operation.servers.iter().filter(|s| !s.is_master()).collect()
}

/// Appends masters then workers, each group requiring what came before.
fn push_node_groups(phases: &mut Vec<Phase>, operation: &Operation, after: &str, steps: &[(&str, &str)]) -> String {
    let mut last = after.to_string();
    let masters = masters(operation);
    if !masters.is_empty() {
        phases.push(rolling_group("/masters", "Update masters", operation, &masters, steps, true).requires(&last));
        last = "/masters".to_string();
    }
    let workers = workers(operation);
    if !workers.is_empty() {
        phases.push(rolling_group("/workers", "Update workers", operation, &workers, steps, false).requires(&last));
        last = "/workers".to_string();
    }
    last
}

pub fn install_plan(operation: &Operation) -> Result<Vec<Phase>> {
    require_servers(operation)?;
    let mut phases = vec![
        hook("/init", "Initialize installation", HookAction::new("init")),
        hook("/checks", "Run preflight checks", HookAction::new("checks")).requires("/init"),
    ];

    let all: Vec<&Server> = operation.servers.iter().collect();
    phases.push(
        rolling_group("/bootstrap", "Bootstrap nodes", operation, &all, &[("configure", "bootstrap")], false)
            .requires("/checks"),
    );

    let masters = masters(operation);
    if masters.is_empty() {
        return Err(OpsError::bad_parameter("install needs at least one master server"));
    }
    phases.push(
        rolling_group("/masters", "Install masters", operation, &masters, &[("install", "install-master")], true)
            .requires("/bootstrap"),
    );
    let workers = workers(operation);
    let mut last = "/masters";
    if !workers.is_empty() {
        phases.push(
            rolling_group("/nodes", "Install nodes", operation, &workers, &[("install", "install-node")], false)
                .requires("/masters"),
        );
        last = "/nodes";
    }
    phases.push(hook("/status", "Wait for the cluster to become healthy", HookAction::new("status")).requires(last));
    Ok(phases)
}

pub fn expand_plan(operation: &Operation) -> Result<Vec<Phase>> {
    require_servers(operation)?;
    let mut phases = vec![hook("/init", "Initialize join", HookAction::new("init"))];
    let joining: Vec<&Server> = operation.servers.iter().collect();
    phases.push(
        rolling_group(
            "/join",
            "Join nodes",
            operation,
            &joining,
            &[("bootstrap", "bootstrap"), ("join", "join"), ("wait", "wait-node")],
            false,
        )
        .requires("/init"),
    );
    phases.push(
        Phase::new("/elect", "Enable leader election on joined masters")
            .with_executor(EXECUTOR_NOOP)
            .requires("/join"),
    );
    Ok(phases)
}

pub fn update_plan(operation: &Operation) -> Result<Vec<Phase>> {
    require_servers(operation)?;
    let mut phases = vec![
        hook("/init", "Initialize update", HookAction::new("init")),
        hook("/checks", "Run update preflight checks", HookAction::new("checks")).requires("/init"),
        hook("/pre-update", "Run pre-update hooks", HookAction::new("pre-update")).requires("/checks"),
    ];
    let last = push_node_groups(
        &mut phases,
        operation,
        "/pre-update",
        &[("drain", "drain"), ("upgrade", "upgrade"), ("uncordon", "uncordon")],
    );
    phases.push(hook("/post-update", "Run post-update hooks", HookAction::new("post-update")).requires(last));
    Ok(phases)
}

pub fn update_config_plan(operation: &Operation) -> Result<Vec<Phase>> {
    require_servers(operation)?;
    let mut phases = vec![hook("/init", "Initialize configuration update", HookAction::new("init"))];
    push_node_groups(
        &mut phases,
        operation,
        "/init",
        &[("drain", "drain"), ("config", "update-config"), ("restart", "restart"), ("uncordon", "uncordon")],
    );
    Ok(phases)
}

pub fn update_environ_plan(operation: &Operation) -> Result<Vec<Phase>> {
    require_servers(operation)?;
    let mut phases = vec![hook("/init", "Initialize runtime environment update", HookAction::new("init"))];
    push_node_groups(
        &mut phases,
        operation,
        "/init",
        &[("drain", "drain"), ("environ", "update-env"), ("restart", "restart"), ("uncordon", "uncordon")],
    );
    Ok(phases)
}

pub fn gc_plan(operation: &Operation) -> Result<Vec<Phase>> {
    require_servers(operation)?;
    let all: Vec<&Server> = operation.servers.iter().collect();
    Ok(vec![
        hook("/init", "Collect garbage candidates", HookAction::new("gc-init")),
        rolling_group("/gc", "Collect garbage", operation, &all, &[("prune", "gc")], false).requires("/init"),
    ])
}

pub fn reconfigure_plan(operation: &Operation) -> Result<Vec<Phase>> {
    require_servers(operation)?;
    let mut phases = vec![hook("/checks", "Run reconfiguration checks", HookAction::new("checks"))];
    let all: Vec<&Server> = operation.servers.iter().collect();
    phases.push(
        rolling_group(
            "/reconfigure",
            "Reconfigure nodes",
            operation,
            &all,
            &[("network", "reconfigure"), ("restart", "restart")],
            true,
        )
        .requires("/checks"),
    );
    Ok(phases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::{OperationType, ServerRole};
    use crate::domain::plan::OperationPlan;

    fn operation(kind: OperationType) -> Operation {
        Operation::new(
            kind,
            "prod",
            vec![
                Server::new("m1", "10.0.0.1", ServerRole::Master),
                Server::new("m2", "10.0.0.2", ServerRole::Master),
                Server::new("w1", "10.0.0.3", ServerRole::Node),
                Server::new("w2", "10.0.0.4", ServerRole::Node),
            ],
        )
    }

    #[test]
    fn test_every_builder_produces_a_valid_plan() {
        let builders: [(OperationType, PlanBuilder); 7] = [
            (OperationType::Install, install_plan),
            (OperationType::Expand, expand_plan),
            (OperationType::Update, update_plan),
            (OperationType::UpdateConfig, update_config_plan),
            (OperationType::UpdateRuntimeEnviron, update_environ_plan),
            (OperationType::GarbageCollect, gc_plan),
            (OperationType::Reconfigure, reconfigure_plan),
        ];
        for (kind, builder) in builders {
            let op = operation(kind);
            let plan = OperationPlan::new(&op, builder(&op).unwrap());
            plan.validate().unwrap_or_else(|e| panic!("{} plan is invalid: {}", kind, e));
        }
    }

    #[test]
    fn test_update_masters_sequential_workers_parallel() {
        let op = operation(OperationType::Update);
        let plan = OperationPlan::new(&op, update_plan(&op).unwrap());

        assert_eq!(plan.get("/masters/m2").unwrap().requires, vec!["/masters/m1".to_string()]);
        assert!(plan.get("/workers/w2").unwrap().requires.is_empty());
        assert_eq!(
            plan.get("/workers/w1/upgrade").unwrap().requires,
            vec!["/workers/w1/drain".to_string()]
        );
        assert_eq!(plan.get("/workers/w1/upgrade").unwrap().server.as_ref().unwrap().hostname, "w1");
    }

    #[test]
    fn test_builders_need_servers() {
        let op = Operation::new(OperationType::GarbageCollect, "prod", vec![]);
        assert!(matches!(gc_plan(&op), Err(OpsError::BadParameter(_))));
    }
}
