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

//! Dispatches phase actions to node agents
//!
//! Only failures that happened before the agent received the request are
//! retried. Once a request was delivered its outcome is final: phase actions
//! are never re-run behind the operator's back.

use super::client::{AgentClient, AgentConnector};
use super::credentials::Credentials;
use super::protocol::PhaseSpec;
use crate::infrastructure::constants::AGENT_CANCEL_TIMEOUT;
use crate::shared::context::OpContext;
use crate::shared::error::{OpsError, Result};
use crate::shared::retry::RetryPolicy;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Span};

pub struct AgentRunner {
    connector: Arc<dyn AgentConnector>,
    credentials: Credentials,
    clients: Mutex<HashMap<String, Arc<dyn AgentClient>>>,
    retry: RetryPolicy,
    span: Span,
}

impl AgentRunner {
    pub fn new(connector: Arc<dyn AgentConnector>, credentials: Credentials, retry: RetryPolicy, span: Span) -> Self {
        Self {
            connector,
            credentials,
            clients: Mutex::new(HashMap::new()),
            retry,
            span,
        }
    }

    /// Returns the cached channel to `node_addr`, connecting on first use.
    async fn client(&self, node_addr: &str) -> Result<Arc<dyn AgentClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(node_addr) {
            return Ok(Arc::clone(client));
        }
        let client = self.connector.connect(node_addr, &self.credentials).await?;
        clients.insert(node_addr.to_string(), Arc::clone(&client));
        Ok(client)
    }

    async fn forget(&self, node_addr: &str) {
        self.clients.lock().await.remove(node_addr);
    }

    async fn dispatch_once(&self, node_addr: &str, spec: &PhaseSpec) -> Result<String> {
        let client = self.client(node_addr).await?;
        match client.run(spec).await {
            Ok(output) => Ok(output),
            Err(e) => {
                if matches!(e, OpsError::Agent { .. } | OpsError::Io(_)) {
                    self.forget(node_addr).await;
                }
                Err(e)
            }
        }
    }

    /// Runs `spec` on the agent at `node_addr` and waits for its result or
    /// for `ctx` to expire. On expiry the agent is asked to stop the phase.
    pub async fn run_phase(&self, ctx: &OpContext, node_addr: &str, spec: &PhaseSpec) -> Result<String> {
        ctx.check(&format!("phase {} on {}", spec.phase_id, node_addr))?;
        info!(parent: &self.span, node = node_addr, phase = %spec.phase_id, action = %spec.action,
            rollback = spec.rollback, "dispatching phase to agent");

        let what = format!("dispatch of {} to {}", spec.phase_id, node_addr);
        let dispatch = self.retry.run(&self.span, &what, || self.dispatch_once(node_addr, spec));
        let result = ctx.run(&format!("phase {} on {}", spec.phase_id, node_addr), dispatch).await;

        match &result {
            Ok(_) => {
                debug!(parent: &self.span, node = node_addr, phase = %spec.phase_id, "agent reported completion");
            }
            Err(OpsError::Cancelled(_)) | Err(OpsError::Timeout(_)) => {
                warn!(parent: &self.span, node = node_addr, phase = %spec.phase_id,
                    "abandoning phase on agent, requesting cancellation");
                // The abandoned exchange may still be answered; never reuse its channel.
                self.forget(node_addr).await;
                self.cancel_remote(node_addr, &spec.phase_id).await;
            }
            Err(e) => {
                warn!(parent: &self.span, node = node_addr, phase = %spec.phase_id, error = %e, "agent dispatch failed");
            }
        }
        result
    }

    /// Best effort: the remote side effect may still complete.
    async fn cancel_remote(&self, node_addr: &str, phase_id: &str) {
        let attempt = async {
            let client = self.client(node_addr).await?;
            client.cancel(phase_id).await
        };
        match tokio::time::timeout(AGENT_CANCEL_TIMEOUT, attempt).await {
            Ok(Ok(())) => info!(parent: &self.span, node = node_addr, phase = phase_id, "agent cancelled phase"),
            Ok(Err(e)) => debug!(parent: &self.span, node = node_addr, phase = phase_id, error = %e,
                "agent could not cancel phase"),
            Err(_) => debug!(parent: &self.span, node = node_addr, phase = phase_id, "cancel request timed out"),
        }
    }

    /// Pings the agent and returns the hostname it reports.
    pub async fn status(&self, node_addr: &str) -> Result<String> {
        let client = self.client(node_addr).await?;
        match client.ping().await {
            Ok(hostname) => Ok(hostname),
            Err(e) => {
                self.forget(node_addr).await;
                Err(e)
            }
        }
    }
}
