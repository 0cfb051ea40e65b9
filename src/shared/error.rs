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

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OpsError>;

/// Exit code reported when a command panics.
pub const EXIT_CODE_PANIC: i32 = 255;

#[derive(Error, Debug)]
pub enum OpsError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("agent error on {node}: {message}")]
    Agent {
        node: String,
        message: String,
        retryable: bool,
    },

    #[error("phase {phase} failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<OpsError>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("version parse error: {0}")]
    Version(#[from] semver::Error),
}

fn format_aggregate(errors: &[OpsError]) -> String {
    match errors {
        [] => "no errors".to_string(),
        [single] => single.to_string(),
        many => {
            let lines: Vec<String> = many.iter().map(|e| format!("  - {}", e)).collect();
            format!("{} errors occurred:\n{}", many.len(), lines.join("\n"))
        }
    }
}

impl OpsError {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn bad_parameter(context: impl Into<String>) -> Self {
        Self::BadParameter(context.into())
    }

    pub fn precondition(context: impl Into<String>) -> Self {
        Self::Precondition(context.into())
    }

    pub fn backend(context: impl Into<String>) -> Self {
        Self::Backend(context.into())
    }

    pub fn agent(node: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Agent {
            node: node.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Collapses a list of errors: none is `Ok`, one is returned as is.
    pub fn aggregate(mut errors: Vec<OpsError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate(errors)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Whether retrying the same call may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend(_) | Self::Timeout(_) | Self::Conflict(_) => true,
            Self::Agent { retryable, .. } => *retryable,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Whether the error means the backend could not be reached at all,
    /// which permits falling back to a local copy.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Backend(_) | Self::Timeout(_) => true,
            Self::Io(_) => self.is_retryable(),
            _ => false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BadParameter(_) => 2,
            Self::NotFound { .. } => 3,
            Self::AlreadyExists { .. } => 4,
            Self::AccessDenied(_) => 5,
            Self::Precondition(_) => 6,
            Self::Timeout(_) => 7,
            Self::Cancelled(_) => 130,
            Self::Aggregate(errors) => errors.first().map(|e| e.exit_code()).unwrap_or(1),
            _ => 1,
        }
    }
}

/// Serializable error detail recorded on a failed phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl From<&OpsError> for ErrorDetail {
    fn from(err: &OpsError) -> Self {
        let kind = match err {
            OpsError::NotFound { .. } => "not-found",
            OpsError::BadParameter(_) => "bad-parameter",
            OpsError::AlreadyExists { .. } => "already-exists",
            OpsError::AccessDenied(_) => "access-denied",
            OpsError::Precondition(_) => "precondition",
            OpsError::Conflict(_) => "conflict",
            OpsError::Timeout(_) => "timeout",
            OpsError::Cancelled(_) => "cancelled",
            OpsError::Backend(_) => "backend",
            OpsError::Agent { .. } => "agent",
            OpsError::PhaseFailed { .. } => "phase",
            OpsError::Aggregate(_) => "aggregate",
            _ => "internal",
        };
        let causes = match err {
            OpsError::Aggregate(errors) => errors.iter().map(|e| e.to_string()).collect(),
            _ => Vec::new(),
        };
        Self {
            kind: kind.to_string(),
            message: err.to_string(),
            causes,
        }
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_collapses() {
        assert!(OpsError::aggregate(vec![]).is_ok());

        let single = OpsError::aggregate(vec![OpsError::bad_parameter("x")]).unwrap_err();
        assert!(matches!(single, OpsError::BadParameter(_)));

        let many = OpsError::aggregate(vec![
            OpsError::not_found("phase", "/a"),
            OpsError::backend("down"),
        ])
        .unwrap_err();
        let text = many.to_string();
        assert!(text.contains("2 errors occurred"));
        assert!(text.contains("/a"));
        assert_eq!(many.exit_code(), 3);
    }

    #[test]
    fn test_retry_classification() {
        assert!(OpsError::backend("etcd unavailable").is_retryable());
        assert!(OpsError::Conflict("version".into()).is_retryable());
        assert!(!OpsError::AccessDenied("bad token".into()).is_retryable());
        assert!(OpsError::agent("node-1", "refused", true).is_retryable());
        assert!(!OpsError::agent("node-1", "rejected", false).is_retryable());
        assert!(!OpsError::Conflict("version".into()).is_unreachable());
    }

    #[test]
    fn test_error_detail_kind() {
        let detail = ErrorDetail::from(&OpsError::Timeout("phase /a".into()));
        assert_eq!(detail.kind, "timeout");
        assert!(detail.message.contains("phase /a"));
    }
}
