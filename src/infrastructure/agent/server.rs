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

//! Node agent: accepts phase requests and runs them through local hooks

use super::credentials::Credentials;
use super::hooks::HookRunner;
use super::protocol::{decode_line, encode_line, AgentCommand, AgentErrorKind, AgentRequest, AgentResponse};
use crate::shared::error::{OpsError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

pub struct AgentServer {
    hostname: String,
    credentials: Credentials,
    hooks: HookRunner,
    running: Mutex<HashMap<String, CancellationToken>>,
    span: Span,
}

impl AgentServer {
    pub fn new(hostname: impl Into<String>, credentials: Credentials, hooks: HookRunner, span: Span) -> Arc<Self> {
        Arc::new(Self {
            hostname: hostname.into(),
            credentials,
            hooks,
            running: Mutex::new(HashMap::new()),
            span,
        })
    }

    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| OpsError::bad_parameter(format!("failed to listen on {}: {}", addr, e)))
    }

    /// Accepts connections until `shutdown` fires. Running hooks are
    /// cancelled on shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr()?;
        info!(parent: &self.span, address = %local, "agent listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(parent: &self.span, error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    let conn_shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer, conn_shutdown).await {
                            debug!(parent: &server.span, peer = %peer, error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }

        for (_, token) in self.running.lock().await.drain() {
            token.cancel();
        }
        info!(parent: &self.span, "agent stopped");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                read = reader.read_line(&mut line) => read?,
            };
            if read == 0 {
                return Ok(());
            }

            let response = match decode_line::<AgentRequest>(&line) {
                Ok(request) => self.handle_request(request, peer, &shutdown).await,
                Err(e) => AgentResponse::error(AgentErrorKind::BadRequest, e.to_string()),
            };
            reader.get_mut().write_all(&encode_line(&response)?).await?;
        }
    }

    async fn handle_request(&self, request: AgentRequest, peer: SocketAddr, shutdown: &CancellationToken) -> AgentResponse {
        if !self.credentials.matches(&request.token) {
            warn!(parent: &self.span, peer = %peer, "rejected request with invalid token");
            return AgentResponse::error(AgentErrorKind::AccessDenied, "invalid agent token");
        }

        match request.command {
            AgentCommand::Ping => AgentResponse::Pong {
                hostname: self.hostname.clone(),
            },
            AgentCommand::Cancel { phase_id } => match self.running.lock().await.get(&phase_id) {
                Some(token) => {
                    info!(parent: &self.span, phase = %phase_id, "cancelling phase on request");
                    token.cancel();
                    AgentResponse::Cancelled { phase_id }
                }
                None => AgentResponse::error(AgentErrorKind::NotFound, format!("phase {} is not running", phase_id)),
            },
            AgentCommand::Run { spec } => {
                let token = shutdown.child_token();
                {
                    let mut running = self.running.lock().await;
                    if running.contains_key(&spec.phase_id) {
                        return AgentResponse::error(
                            AgentErrorKind::Busy,
                            format!("phase {} is already running", spec.phase_id),
                        );
                    }
                    running.insert(spec.phase_id.clone(), token.clone());
                }

                info!(parent: &self.span, phase = %spec.phase_id, action = %spec.action,
                    rollback = spec.rollback, "running phase");
                let result = self.hooks.run(&spec, &token).await;
                self.running.lock().await.remove(&spec.phase_id);

                match result {
                    Ok(output) => AgentResponse::Completed { output },
                    Err(OpsError::Cancelled(_)) => AgentResponse::Cancelled {
                        phase_id: spec.phase_id,
                    },
                    Err(e) => {
                        error!(parent: &self.span, phase = %spec.phase_id, error = %e, "phase failed");
                        let kind = match e {
                            OpsError::NotFound { .. } => AgentErrorKind::NotFound,
                            OpsError::BadParameter(_) => AgentErrorKind::BadRequest,
                            _ => AgentErrorKind::Failed,
                        };
                        AgentResponse::error(kind, e.to_string())
                    }
                }
            }
        }
    }
}
