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

//! Agent wire format: one JSON document per line in each direction.

use crate::shared::error::{OpsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a node agent is asked to run for a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub operation_id: String,
    pub phase_id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub rollback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentCommand {
    Run { spec: PhaseSpec },
    Cancel { phase_id: String },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub token: String,
    pub command: AgentCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    AccessDenied,
    NotFound,
    BadRequest,
    Busy,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentResponse {
    Completed { output: String },
    Cancelled { phase_id: String },
    Pong { hostname: String },
    Error { error: AgentErrorKind, message: String },
}

impl AgentResponse {
    pub fn error(error: AgentErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            error,
            message: message.into(),
        }
    }

    /// Converts an error reply into the caller-side error taxonomy. Errors
    /// reported by the agent are never retryable: the request was delivered.
    pub fn into_error(error: AgentErrorKind, message: String, node: &str) -> OpsError {
        match error {
            AgentErrorKind::AccessDenied => OpsError::AccessDenied(format!("{}: {}", node, message)),
            AgentErrorKind::NotFound => OpsError::not_found("agent action", message),
            AgentErrorKind::BadRequest => OpsError::bad_parameter(message),
            AgentErrorKind::Cancelled => OpsError::Cancelled(message),
            AgentErrorKind::Busy | AgentErrorKind::Failed => OpsError::agent(node, message, false),
        }
    }
}

pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T> {
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = AgentRequest {
            token: "secret".to_string(),
            command: AgentCommand::Cancel {
                phase_id: "/masters/node-1".to_string(),
            },
        };
        let line = encode_line(&request).unwrap();
        assert_eq!(*line.last().unwrap(), b'\n');

        let json: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(json["command"]["kind"], "cancel");
        assert_eq!(json["command"]["phase_id"], "/masters/node-1");

        let decoded: AgentRequest = decode_line(std::str::from_utf8(&line).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_error_mapping() {
        let err = AgentResponse::into_error(AgentErrorKind::AccessDenied, "bad token".into(), "node-1");
        assert!(matches!(err, OpsError::AccessDenied(_)));
        let err = AgentResponse::into_error(AgentErrorKind::Failed, "exit 1".into(), "node-1");
        assert!(!err.is_retryable());
    }
}
