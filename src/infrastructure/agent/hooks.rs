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

//! Runs phase actions as executables found in a hooks directory

use super::protocol::PhaseSpec;
use crate::shared::error::{OpsError, Result};
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Span};

/// Bytes of stderr kept in a failure message.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Clone)]
pub struct HookRunner {
    hooks_dir: PathBuf,
    span: Span,
}

impl HookRunner {
    pub fn new(hooks_dir: impl Into<PathBuf>, span: Span) -> Self {
        Self {
            hooks_dir: hooks_dir.into(),
            span,
        }
    }

    pub fn resolve(&self, action: &str) -> Result<PathBuf> {
        let valid = Regex::new(r"^[a-z0-9][a-z0-9_-]*$").map_err(|e| OpsError::bad_parameter(e.to_string()))?;
        if !valid.is_match(action) {
            return Err(OpsError::bad_parameter(format!("invalid action name '{}'", action)));
        }

        let path = self.hooks_dir.join(action);
        if !path.is_file() {
            return Err(OpsError::not_found("hook", path.display().to_string()));
        }
        Ok(path)
    }

    /// Runs the hook for `spec` and returns its stdout. Cancelling `cancel`
    /// kills the hook process.
    pub async fn run(&self, spec: &PhaseSpec, cancel: &CancellationToken) -> Result<String> {
        let path = self.resolve(&spec.action)?;

        let mut command = Command::new(&path);
        command
            .env("OPSCTL_OPERATION_ID", &spec.operation_id)
            .env("OPSCTL_PHASE_ID", &spec.phase_id)
            .env("OPSCTL_ROLLBACK", if spec.rollback { "1" } else { "0" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.args {
            command.env(arg_env_name(key), value);
        }

        debug!(parent: &self.span, hook = %path.display(), phase = %spec.phase_id,
            rollback = spec.rollback, "running hook");

        let child = command.spawn().map_err(|e| {
            OpsError::PhaseFailed {
                phase: spec.phase_id.clone(),
                message: format!("failed to start {}: {}", path.display(), e),
            }
        })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = cancel.cancelled() => {
                return Err(OpsError::Cancelled(format!("hook {} for phase {}", spec.action, spec.phase_id)));
            }
        };

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let start = stderr.len().saturating_sub(STDERR_TAIL);
        let start = (start..stderr.len())
            .find(|i| stderr.is_char_boundary(*i))
            .unwrap_or(stderr.len());
        Err(OpsError::PhaseFailed {
            phase: spec.phase_id.clone(),
            message: format!(
                "{} exited with {}: {}",
                spec.action,
                output.status,
                stderr[start..].trim()
            ),
        })
    }
}

/// `node-name` becomes `OPSCTL_ARG_NODE_NAME`.
fn arg_env_name(key: &str) -> String {
    let normalized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("OPSCTL_ARG_{}", normalized)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_hook(dir: &TempDir, name: &str, body: &str) {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn spec(action: &str) -> PhaseSpec {
        let mut args = BTreeMap::new();
        args.insert("node-name".to_string(), "node-1".to_string());
        PhaseSpec {
            operation_id: "op-1".to_string(),
            phase_id: "/masters/node-1".to_string(),
            action: action.to_string(),
            args,
            rollback: false,
        }
    }

    #[tokio::test]
    async fn test_hook_receives_environment() {
        let dir = TempDir::new().unwrap();
        write_hook(&dir, "drain", "echo \"$OPSCTL_PHASE_ID $OPSCTL_ARG_NODE_NAME $OPSCTL_ROLLBACK\"");
        let runner = HookRunner::new(dir.path(), Span::none());

        let output = runner.run(&spec("drain"), &CancellationToken::new()).await.unwrap();
        assert_eq!(output, "/masters/node-1 node-1 0");
    }

    #[tokio::test]
    async fn test_failing_hook_reports_stderr() {
        let dir = TempDir::new().unwrap();
        write_hook(&dir, "broken", "echo 'disk full' >&2; exit 3");
        let runner = HookRunner::new(dir.path(), Span::none());

        let err = runner.run(&spec("broken"), &CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }

    #[tokio::test]
    async fn test_missing_and_invalid_actions() {
        let dir = TempDir::new().unwrap();
        let runner = HookRunner::new(dir.path(), Span::none());
        assert!(runner.resolve("absent").unwrap_err().is_not_found());
        assert!(matches!(runner.resolve("../etc/passwd"), Err(OpsError::BadParameter(_))));
    }

    #[tokio::test]
    async fn test_cancel_kills_hook() {
        let dir = TempDir::new().unwrap();
        write_hook(&dir, "slow", "sleep 30");
        let runner = HookRunner::new(dir.path(), Span::none());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = runner.run(&spec("slow"), &cancel).await.unwrap_err();
        assert!(matches!(err, OpsError::Cancelled(_)));
    }
}
