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

use crate::shared::error::{OpsError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_ACCOUNT: &str = "system";

/// Cluster-mutating action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    Install,
    Expand,
    Update,
    UpdateConfig,
    UpdateRuntimeEnviron,
    GarbageCollect,
    Reconfigure,
}

impl OperationType {
    pub const ALL: [OperationType; 7] = [
        Self::Install,
        Self::Expand,
        Self::Update,
        Self::UpdateConfig,
        Self::UpdateRuntimeEnviron,
        Self::GarbageCollect,
        Self::Reconfigure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Expand => "expand",
            Self::Update => "update",
            Self::UpdateConfig => "update-config",
            Self::UpdateRuntimeEnviron => "update-runtime-environ",
            Self::GarbageCollect => "garbage-collect",
            Self::Reconfigure => "reconfigure",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "install" => Ok(Self::Install),
            "expand" | "join" => Ok(Self::Expand),
            "update" | "upgrade" => Ok(Self::Update),
            "update-config" => Ok(Self::UpdateConfig),
            "update-runtime-environ" | "update-env" => Ok(Self::UpdateRuntimeEnviron),
            "garbage-collect" | "gc" => Ok(Self::GarbageCollect),
            "reconfigure" => Ok(Self::Reconfigure),
            _ => Err(format!(
                "Invalid operation type: {}. Valid options: {}",
                s,
                Self::ALL
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationState {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl OperationState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Master,
    #[default]
    Node,
}

/// A cluster member participating in an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    pub hostname: String,
    pub advertise_addr: String,
    #[serde(default)]
    pub role: ServerRole,
}

impl Server {
    pub fn new(hostname: impl Into<String>, advertise_addr: impl Into<String>, role: ServerRole) -> Self {
        Self {
            hostname: hostname.into(),
            advertise_addr: advertise_addr.into(),
            role,
        }
    }

    pub fn is_master(&self) -> bool {
        self.role == ServerRole::Master
    }

    /// Parse `hostname=addr[:role]`, e.g. `node-1=10.0.0.1:master`.
    pub fn parse(spec: &str) -> std::result::Result<Self, String> {
        let (hostname, rest) = spec
            .split_once('=')
            .ok_or_else(|| format!("Invalid server '{}'. Expected 'hostname=addr[:role]'", spec))?;
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Err(format!("Empty hostname in server '{}'", spec));
        }

        let (addr, role) = match rest.rsplit_once(':') {
            Some((addr, "master")) => (addr, ServerRole::Master),
            Some((addr, "node")) => (addr, ServerRole::Node),
            _ => (rest, ServerRole::Node),
        };
        if addr.trim().is_empty() {
            return Err(format!("Empty address in server '{}'", spec));
        }

        Ok(Self::new(hostname, addr.trim(), role))
    }
}

/// Identifies an operation within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationKey {
    pub account_id: String,
    pub cluster_name: String,
    pub operation_id: String,
}

impl OperationKey {
    pub fn new(cluster_name: impl Into<String>, operation_id: impl Into<String>) -> Self {
        Self {
            account_id: DEFAULT_ACCOUNT.to_string(),
            cluster_name: cluster_name.into(),
            operation_id: operation_id.into(),
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster_name, self.operation_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub account_id: String,
    pub cluster_name: String,
    #[serde(rename = "type")]
    pub kind: OperationType,
    pub state: OperationState,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<Server>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Operation {
    pub fn new(kind: OperationType, cluster_name: impl Into<String>, servers: Vec<Server>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: DEFAULT_ACCOUNT.to_string(),
            cluster_name: cluster_name.into(),
            kind,
            state: OperationState::Pending,
            created: now,
            updated: now,
            servers,
            error: None,
        }
    }

    pub fn key(&self) -> OperationKey {
        OperationKey {
            account_id: self.account_id.clone(),
            cluster_name: self.cluster_name.clone(),
            operation_id: self.id.clone(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn is_completed(&self) -> bool {
        self.state == OperationState::Completed
    }

    /// Moves the operation to `next`. Finished operations are immutable.
    pub fn transition(&mut self, next: OperationState) -> Result<()> {
        use OperationState::*;

        let allowed = match (self.state, next) {
            (a, b) if a == b && !a.is_finished() => true,
            (Pending, InProgress) | (Pending, Completed) | (Pending, Failed) => true,
            (InProgress, Completed) | (InProgress, Failed) => true,
            _ => false,
        };

        if !allowed {
            return Err(OpsError::bad_parameter(format!(
                "operation {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }

        self.state = next;
        self.updated = Utc::now();
        Ok(())
    }

    pub fn find_server(&self, hostname: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.hostname == hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_type_round_trip() {
        for kind in OperationType::ALL {
            assert_eq!(kind.as_str().parse::<OperationType>().unwrap(), kind);
        }
        assert_eq!("gc".parse::<OperationType>().unwrap(), OperationType::GarbageCollect);
        assert!("bogus".parse::<OperationType>().is_err());
    }

    #[test]
    fn test_finished_operation_is_immutable() {
        let mut op = Operation::new(OperationType::Update, "prod", vec![]);
        op.transition(OperationState::InProgress).unwrap();
        op.transition(OperationState::Completed).unwrap();
        assert!(op.transition(OperationState::Failed).is_err());
        assert!(op.transition(OperationState::InProgress).is_err());
        assert!(op.is_completed());
    }

    #[test]
    fn test_parse_server() {
        let s = Server::parse("node-1=10.0.0.1:master").unwrap();
        assert_eq!(s.hostname, "node-1");
        assert_eq!(s.advertise_addr, "10.0.0.1");
        assert!(s.is_master());

        let s = Server::parse("node-2=10.0.0.2:3012").unwrap();
        assert_eq!(s.advertise_addr, "10.0.0.2:3012");
        assert_eq!(s.role, ServerRole::Node);

        assert!(Server::parse("node-3").is_err());
        assert!(Server::parse("=10.0.0.3").is_err());
    }
}
