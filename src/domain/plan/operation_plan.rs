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

use super::phase::{is_within, parent_id, Phase, PhaseState, ROOT_PHASE};
use crate::domain::operation::{Operation, OperationKey, OperationType, Server};
use crate::shared::error::{ErrorDetail, OpsError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// The tree of phases owned by one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPlan {
    pub operation_id: String,
    pub operation_type: OperationType,
    #[serde(default = "default_account")]
    pub account_id: String,
    pub cluster_name: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<Server>,
    pub phases: Vec<Phase>,
}

fn default_account() -> String {
    crate::domain::operation::DEFAULT_ACCOUNT.to_string()
}

impl OperationPlan {
    pub fn new(operation: &Operation, phases: Vec<Phase>) -> Self {
        Self {
            operation_id: operation.id.clone(),
            operation_type: operation.kind,
            account_id: operation.account_id.clone(),
            cluster_name: operation.cluster_name.clone(),
            created: Utc::now(),
            servers: operation.servers.clone(),
            phases,
        }
    }

    pub fn key(&self) -> OperationKey {
        OperationKey {
            account_id: self.account_id.clone(),
            cluster_name: self.cluster_name.clone(),
            operation_id: self.operation_id.clone(),
        }
    }

    /// Every phase, depth-first with parents first.
    pub fn all_phases(&self) -> Vec<&Phase> {
        let mut out = Vec::new();
        for phase in &self.phases {
            phase.walk(&mut out);
        }
        out
    }

    pub fn leaves(&self) -> Vec<&Phase> {
        self.all_phases().into_iter().filter(|p| p.is_leaf()).collect()
    }

    pub fn find(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find_map(|p| p.find(id))
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find_map(|p| p.find_mut(id))
    }

    pub fn get(&self, id: &str) -> Result<&Phase> {
        self.find(id)
            .ok_or_else(|| OpsError::bad_parameter(format!("phase {} does not exist in plan {}", id, self.operation_id)))
    }

    /// IDs of the direct children of `id`; for `/` the top-level phases.
    pub fn child_ids(&self, id: &str) -> Result<Vec<String>> {
        if id == ROOT_PHASE {
            return Ok(self.phases.iter().map(|p| p.id.clone()).collect());
        }
        Ok(self.get(id)?.phases.iter().map(|p| p.id.clone()).collect())
    }

    /// State of a phase, the aggregate of the whole plan for `/`.
    pub fn state_of(&self, id: &str) -> Result<PhaseState> {
        if id == ROOT_PHASE {
            return Ok(PhaseState::aggregate(self.phases.iter().map(|p| p.state)));
        }
        Ok(self.get(id)?.state)
    }

    pub fn is_completed(&self) -> bool {
        !self.phases.is_empty() && self.phases.iter().all(|p| p.is_completed())
    }

    pub fn is_failed(&self) -> bool {
        self.phases.iter().any(|p| p.state == PhaseState::Failed)
    }

    pub fn is_rolled_back(&self) -> bool {
        self.all_phases()
            .iter()
            .filter(|p| p.is_leaf())
            .all(|p| matches!(p.state, PhaseState::RolledBack | PhaseState::Unstarted))
    }

    /// Requirements of a phase including those inherited from its ancestors.
    pub fn requirements_of(&self, id: &str) -> Result<Vec<String>> {
        let mut out = self.get(id)?.requires.clone();
        let mut current = parent_id(id);
        while let Some(parent) = current {
            if parent == ROOT_PHASE {
                break;
            }
            if let Some(phase) = self.find(parent) {
                out.extend(phase.requires.iter().cloned());
            }
            current = parent_id(parent);
        }
        Ok(out)
    }

    /// Requirements of `id` that are not completed, in declaration order.
    pub fn unmet_requirements(&self, id: &str) -> Result<Vec<String>> {
        let mut unmet = Vec::new();
        for req in self.requirements_of(id)? {
            let satisfied = self.find(&req).map(|p| p.is_completed()).unwrap_or(false);
            if !satisfied {
                unmet.push(req);
            }
        }
        Ok(unmet)
    }

    /// Sets the recorded state of a phase and every phase below it, then
    /// re-derives container states.
    pub fn set_state(&mut self, id: &str, state: PhaseState, error: Option<ErrorDetail>) -> Result<()> {
        let now = Utc::now();
        if id == ROOT_PHASE {
            for phase in &mut self.phases {
                mark_subtree(phase, state, error.clone(), now);
            }
        } else {
            let plan_id = self.operation_id.clone();
            let phase = self
                .find_mut(id)
                .ok_or_else(|| OpsError::bad_parameter(format!("phase {} does not exist in plan {}", id, plan_id)))?;
            mark_subtree(phase, state, error, now);
        }
        self.normalize();
        Ok(())
    }

    pub fn normalize(&mut self) {
        for phase in &mut self.phases {
            phase.normalize();
        }
    }

    /// Copies leaf states from `other` wherever `other` recorded a later
    /// change. Returns the IDs that changed.
    pub fn merge_newer(&mut self, other: &OperationPlan) -> Vec<String> {
        let newer: HashMap<&str, &Phase> = other
            .leaves()
            .into_iter()
            .map(|p| (p.id.as_str(), p))
            .collect();

        let mut changed = Vec::new();
        let ids: Vec<String> = self.leaves().iter().map(|p| p.id.clone()).collect();
        for id in ids {
            let Some(theirs) = newer.get(id.as_str()) else {
                continue;
            };
            let Some(ours) = self.find_mut(&id) else {
                continue;
            };
            let take = match (ours.updated, theirs.updated) {
                (None, Some(_)) => true,
                (Some(mine), Some(their)) => their > mine,
                _ => false,
            };
            if take && (ours.state != theirs.state || ours.updated != theirs.updated) {
                ours.state = theirs.state;
                ours.error = theirs.error.clone();
                ours.updated = theirs.updated;
                changed.push(id);
            }
        }

        if !changed.is_empty() {
            self.normalize();
        }
        changed
    }

    /// Checks the tree invariants: unique IDs, children nested under their
    /// parent's ID, known requirements, and acyclic sibling ordering.
    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(OpsError::bad_parameter(format!(
                "plan {} has no phases",
                self.operation_id
            )));
        }

        let all = self.all_phases();
        let mut seen = HashSet::new();
        for phase in &all {
            if phase.id.is_empty() || !phase.id.starts_with('/') || phase.id == ROOT_PHASE {
                return Err(OpsError::bad_parameter(format!(
                    "invalid phase ID '{}': must be an absolute path below /",
                    phase.id
                )));
            }
            if !seen.insert(phase.id.as_str()) {
                return Err(OpsError::bad_parameter(format!(
                    "duplicate phase ID {} in plan {}",
                    phase.id, self.operation_id
                )));
            }
            for child in &phase.phases {
                if parent_id(&child.id) != Some(phase.id.as_str()) {
                    return Err(OpsError::bad_parameter(format!(
                        "phase {} must be nested directly under {}",
                        child.id, phase.id
                    )));
                }
            }
        }

        for phase in &all {
            for req in &phase.requires {
                if !seen.contains(req.as_str()) {
                    return Err(OpsError::bad_parameter(format!(
                        "phase {} requires unknown phase {}",
                        phase.id, req
                    )));
                }
                if is_within(req, &phase.id) || is_within(&phase.id, req) {
                    return Err(OpsError::bad_parameter(format!(
                        "phase {} cannot require its own ancestor or descendant {}",
                        phase.id, req
                    )));
                }
            }
        }

        let mut groups: Vec<Vec<String>> = vec![self.phases.iter().map(|p| p.id.clone()).collect()];
        for phase in &all {
            if !phase.is_leaf() {
                groups.push(phase.phases.iter().map(|p| p.id.clone()).collect());
            }
        }
        for group in groups {
            self.topological_order(&group)?;
        }

        Ok(())
    }

    /// For each phase in a sibling group, the siblings it must wait for.
    /// A requirement on a phase nested under a sibling maps to that sibling.
    pub fn sibling_dependencies(&self, group: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
        let mut deps = BTreeMap::new();
        for id in group {
            let phase = self.get(id)?;
            let mut waits: Vec<String> = Vec::new();
            for req in &phase.requires {
                if let Some(sibling) = group.iter().find(|s| is_within(req, s)) {
                    if sibling != id && !waits.contains(sibling) {
                        waits.push(sibling.clone());
                    }
                }
            }
            deps.insert(id.clone(), waits);
        }
        Ok(deps)
    }

    /// Orders a sibling group so every phase follows the siblings it needs.
    /// Ties keep declaration order.
    pub fn topological_order(&self, group: &[String]) -> Result<Vec<String>> {
        let deps = self.sibling_dependencies(group)?;
        let mut done: HashSet<String> = HashSet::new();
        let mut order = Vec::with_capacity(group.len());

        while order.len() < group.len() {
            let next = group.iter().find(|id| {
                !done.contains(*id) && deps[*id].iter().all(|d| done.contains(d))
            });
            match next {
                Some(id) => {
                    done.insert(id.clone());
                    order.push(id.clone());
                }
                None => {
                    let stuck: Vec<&String> = group.iter().filter(|id| !done.contains(*id)).collect();
                    return Err(OpsError::bad_parameter(format!(
                        "dependency cycle among phases {:?}",
                        stuck
                    )));
                }
            }
        }

        Ok(order)
    }
}

fn mark_subtree(phase: &mut Phase, state: PhaseState, error: Option<ErrorDetail>, at: DateTime<Utc>) {
    if phase.is_leaf() {
        phase.mark(state, error, at);
        return;
    }
    for child in &mut phase.phases {
        mark_subtree(child, state, error.clone(), at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::OperationType;

    fn sample_plan() -> OperationPlan {
        let op = Operation::new(OperationType::Update, "prod", vec![]);
        OperationPlan::new(
            &op,
            vec![
                Phase::new("/init", "Initialize").with_executor("noop"),
                Phase::new("/masters", "Update masters")
                    .requires("/init")
                    .child(Phase::new("/masters/node-1", "Update node-1").with_executor("noop"))
                    .child(
                        Phase::new("/masters/node-2", "Update node-2")
                            .with_executor("noop")
                            .requires("/masters/node-1"),
                    ),
                Phase::new("/gc", "Garbage collect")
                    .with_executor("noop")
                    .requires("/masters/node-2"),
            ],
        )
    }

    #[test]
    fn test_validate_ok() {
        sample_plan().validate().unwrap();
    }

    #[test]
    fn test_validate_duplicate_id() {
        let mut plan = sample_plan();
        plan.phases.push(Phase::new("/init", "Again"));
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate phase ID /init"));
    }

    #[test]
    fn test_validate_cycle() {
        let mut plan = sample_plan();
        plan.phases[0].requires.push("/gc".to_string());
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_validate_bad_nesting() {
        let mut plan = sample_plan();
        plan.phases[1].phases.push(Phase::new("/other/node-3", "Misplaced"));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_inherited_requirements() {
        let plan = sample_plan();
        let reqs = plan.requirements_of("/masters/node-2").unwrap();
        assert_eq!(reqs, vec!["/masters/node-1".to_string(), "/init".to_string()]);
    }

    #[test]
    fn test_set_state_derives_parent() {
        let mut plan = sample_plan();
        plan.set_state("/masters/node-1", PhaseState::Completed, None).unwrap();
        assert_eq!(plan.get("/masters").unwrap().state, PhaseState::InProgress);
        plan.set_state("/masters/node-2", PhaseState::Completed, None).unwrap();
        assert_eq!(plan.get("/masters").unwrap().state, PhaseState::Completed);
        assert!(!plan.is_completed());
        plan.set_state("/", PhaseState::Completed, None).unwrap();
        assert!(plan.is_completed());
    }

    #[test]
    fn test_sibling_dependencies_map_nested_requirements() {
        let plan = sample_plan();
        let group = plan.child_ids("/").unwrap();
        let deps = plan.sibling_dependencies(&group).unwrap();
        assert_eq!(deps["/gc"], vec!["/masters".to_string()]);
        assert_eq!(deps["/masters"], vec!["/init".to_string()]);
        assert_eq!(
            plan.topological_order(&group).unwrap(),
            vec!["/init".to_string(), "/masters".to_string(), "/gc".to_string()]
        );
    }

    #[test]
    fn test_merge_newer_takes_later_changes() {
        let mut local = sample_plan();
        let mut cluster = local.clone();
        cluster.set_state("/init", PhaseState::Completed, None).unwrap();

        let changed = local.merge_newer(&cluster);
        assert_eq!(changed, vec!["/init".to_string()]);
        assert_eq!(local.get("/init").unwrap().state, PhaseState::Completed);

        // Older cluster data does not override newer local data.
        local.set_state("/init", PhaseState::RolledBack, None).unwrap();
        assert!(local.merge_newer(&cluster).is_empty());
        assert_eq!(local.get("/init").unwrap().state, PhaseState::RolledBack);
    }
}
