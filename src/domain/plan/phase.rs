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

use crate::domain::operation::Server;
use crate::shared::error::ErrorDetail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// ID of the implicit phase that contains every top-level phase.
pub const ROOT_PHASE: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Unstarted,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl PhaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// States from which a phase may be (re)started without force.
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Unstarted | Self::Failed | Self::RolledBack)
    }

    /// Derives a parent's state from its children.
    pub fn aggregate<I>(states: I) -> PhaseState
    where
        I: IntoIterator<Item = PhaseState>,
    {
        let states: Vec<PhaseState> = states.into_iter().collect();
        if states.is_empty() {
            return PhaseState::Unstarted;
        }
        if states.iter().any(|s| *s == PhaseState::Failed) {
            return PhaseState::Failed;
        }
        if states.iter().all(|s| *s == PhaseState::Completed) {
            return PhaseState::Completed;
        }
        if states.iter().all(|s| *s == PhaseState::RolledBack) {
            return PhaseState::RolledBack;
        }
        if states.iter().all(|s| *s == PhaseState::Unstarted) {
            return PhaseState::Unstarted;
        }
        PhaseState::InProgress
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "unstarted" => Ok(Self::Unstarted),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            _ => Err(format!(
                "Invalid phase state: {}. Valid options: unstarted, in_progress, completed, failed, rolled_back",
                s
            )),
        }
    }
}

/// One step of an operation plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Name of the executor that runs this phase. Empty for pure containers.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub executor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Server>,
    #[serde(default)]
    pub state: PhaseState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Executor specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<Phase>,
}

impl Phase {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            executor: String::new(),
            server: None,
            state: PhaseState::Unstarted,
            requires: Vec::new(),
            data: None,
            error: None,
            updated: None,
            phases: Vec::new(),
        }
    }

    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = executor.into();
        self
    }

    pub fn with_server(mut self, server: Server) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn requires(mut self, id: impl Into<String>) -> Self {
        self.requires.push(id.into());
        self
    }

    pub fn child(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn is_completed(&self) -> bool {
        self.state == PhaseState::Completed
    }

    /// Records a state change on this phase only.
    pub(crate) fn mark(&mut self, state: PhaseState, error: Option<ErrorDetail>, at: DateTime<Utc>) {
        self.state = state;
        self.error = error;
        self.updated = Some(at);
    }

    /// Recomputes the state of every container phase below and including
    /// this one. Leaves keep their recorded state.
    pub(crate) fn normalize(&mut self) {
        if self.phases.is_empty() {
            return;
        }
        for child in &mut self.phases {
            child.normalize();
        }
        self.state = PhaseState::aggregate(self.phases.iter().map(|p| p.state));
        self.updated = self.phases.iter().filter_map(|p| p.updated).max();
        if self.state != PhaseState::Failed {
            self.error = None;
        }
    }

    /// Depth-first, parents before children.
    pub fn walk<'a>(&'a self, out: &mut Vec<&'a Phase>) {
        out.push(self);
        for child in &self.phases {
            child.walk(out);
        }
    }

    pub fn find(&self, id: &str) -> Option<&Phase> {
        if self.id == id {
            return Some(self);
        }
        self.phases.iter().find_map(|p| p.find(id))
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Phase> {
        if self.id == id {
            return Some(self);
        }
        self.phases.iter_mut().find_map(|p| p.find_mut(id))
    }
}

/// Returns the parent ID of a path-like phase ID, `/` for top-level phases.
pub fn parent_id(id: &str) -> Option<&str> {
    if id == ROOT_PHASE {
        return None;
    }
    match id.trim_end_matches('/').rfind('/') {
        Some(0) => Some(ROOT_PHASE),
        Some(idx) => Some(&id[..idx]),
        None => Some(ROOT_PHASE),
    }
}

/// Whether `id` is `ancestor` itself or nested below it.
pub fn is_within(id: &str, ancestor: &str) -> bool {
    if ancestor == ROOT_PHASE {
        return true;
    }
    id == ancestor
        || (id.len() > ancestor.len() && id.starts_with(ancestor) && id.as_bytes()[ancestor.len()] == b'/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_state() {
        use PhaseState::*;
        assert_eq!(PhaseState::aggregate([Completed, Completed]), Completed);
        assert_eq!(PhaseState::aggregate([Completed, Failed]), Failed);
        assert_eq!(PhaseState::aggregate([Completed, Unstarted]), InProgress);
        assert_eq!(PhaseState::aggregate([Unstarted, Unstarted]), Unstarted);
        assert_eq!(PhaseState::aggregate([RolledBack, RolledBack]), RolledBack);
        assert_eq!(PhaseState::aggregate([RolledBack, Completed]), InProgress);
        assert_eq!(PhaseState::aggregate(Vec::new()), Unstarted);
    }

    #[test]
    fn test_parent_id() {
        assert_eq!(parent_id("/masters/node-1/drain"), Some("/masters/node-1"));
        assert_eq!(parent_id("/masters"), Some("/"));
        assert_eq!(parent_id("/"), None);
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/masters/node-1", "/masters"));
        assert!(is_within("/masters", "/masters"));
        assert!(!is_within("/masters-extra", "/masters"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn test_state_from_str() {
        assert_eq!("rolled-back".parse::<PhaseState>().unwrap(), PhaseState::RolledBack);
        assert_eq!("Completed".parse::<PhaseState>().unwrap(), PhaseState::Completed);
        assert!("done".parse::<PhaseState>().is_err());
    }
}
