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

use super::credentials::Credentials;
use super::protocol::{decode_line, encode_line, AgentCommand, AgentRequest, AgentResponse, PhaseSpec};
use crate::shared::error::{OpsError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Request/response channel to one node agent.
#[async_trait::async_trait]
pub trait AgentClient: Send + Sync {
    /// Runs a phase action and blocks until the agent reports back.
    async fn run(&self, spec: &PhaseSpec) -> Result<String>;

    /// Asks the agent to stop an in-flight phase.
    async fn cancel(&self, phase_id: &str) -> Result<()>;

    async fn ping(&self) -> Result<String>;
}

/// Opens authenticated channels to node agents.
#[async_trait::async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, node_addr: &str, credentials: &Credentials) -> Result<Arc<dyn AgentClient>>;
}

pub struct TcpConnector {
    default_port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(default_port: u16, connect_timeout: Duration) -> Self {
        Self {
            default_port,
            connect_timeout,
        }
    }

    /// Appends the agent port when `node_addr` has none.
    pub fn endpoint(&self, node_addr: &str) -> String {
        if node_addr.parse::<std::net::SocketAddr>().is_ok() {
            return node_addr.to_string();
        }
        match node_addr.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => node_addr.to_string(),
            _ => format!("{}:{}", node_addr, self.default_port),
        }
    }
}

#[async_trait::async_trait]
impl AgentConnector for TcpConnector {
    async fn connect(&self, node_addr: &str, credentials: &Credentials) -> Result<Arc<dyn AgentClient>> {
        let endpoint = self.endpoint(node_addr);
        let client = TcpAgentClient::new(endpoint, credentials.clone(), self.connect_timeout);
        client.ensure_connected().await?;
        Ok(Arc::new(client))
    }
}

pub struct TcpAgentClient {
    endpoint: String,
    credentials: Credentials,
    connect_timeout: Duration,
    conn: Mutex<Option<BufReader<TcpStream>>>,
}

impl TcpAgentClient {
    pub fn new(endpoint: String, credentials: Credentials, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            credentials,
            connect_timeout,
            conn: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<BufReader<TcpStream>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| OpsError::agent(&self.endpoint, "connection timed out", true))?
            .map_err(|e| OpsError::agent(&self.endpoint, format!("failed to connect: {}", e), true))?;
        stream.set_nodelay(true)?;
        Ok(BufReader::new(stream))
    }

    async fn ensure_connected(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(self.open().await?);
        }
        Ok(())
    }

    fn request(&self, command: AgentCommand) -> AgentRequest {
        AgentRequest {
            token: self.credentials.token().to_string(),
            command,
        }
    }

    /// Sends one request over the cached connection. A failure to send is
    /// retryable because the agent never saw a complete request; a failure
    /// after sending is not.
    ///
    /// The connection is taken out of the slot for the whole exchange and
    /// returned only after a full response was read, so a call dropped
    /// mid-flight closes its socket instead of leaving a stale response
    /// for the next request.
    async fn call(&self, command: AgentCommand) -> Result<AgentResponse> {
        let frame = encode_line(&self.request(command))?;
        let cached = self.conn.lock().await.take();
        let mut conn = match cached {
            Some(conn) => conn,
            None => self.open().await?,
        };

        if let Err(e) = conn.get_mut().write_all(&frame).await {
            return Err(OpsError::agent(&self.endpoint, format!("failed to send request: {}", e), true));
        }

        let mut line = String::new();
        match conn.read_line(&mut line).await {
            Ok(0) => Err(OpsError::agent(&self.endpoint, "agent closed the connection", false)),
            Ok(_) => {
                let response = decode_line(&line)?;
                let mut slot = self.conn.lock().await;
                if slot.is_none() {
                    *slot = Some(conn);
                }
                Ok(response)
            }
            Err(e) => Err(OpsError::agent(&self.endpoint, format!("failed to read response: {}", e), false)),
        }
    }

    /// One-shot request on a dedicated connection, used while the shared
    /// one is busy with a running phase.
    async fn call_detached(&self, command: AgentCommand) -> Result<AgentResponse> {
        let mut conn = self.open().await?;
        conn.get_mut().write_all(&encode_line(&self.request(command))?).await?;
        let mut line = String::new();
        conn.read_line(&mut line).await?;
        decode_line(&line)
    }
}

#[async_trait::async_trait]
impl AgentClient for TcpAgentClient {
    async fn run(&self, spec: &PhaseSpec) -> Result<String> {
        match self.call(AgentCommand::Run { spec: spec.clone() }).await? {
            AgentResponse::Completed { output } => Ok(output),
            AgentResponse::Cancelled { phase_id } if phase_id == spec.phase_id => {
                Err(OpsError::Cancelled(format!("phase {} on {}", phase_id, self.endpoint)))
            }
            AgentResponse::Error { error, message } => Err(AgentResponse::into_error(error, message, &self.endpoint)),
            other => Err(OpsError::agent(&self.endpoint, format!("unexpected response {:?}", other), false)),
        }
    }

    async fn cancel(&self, phase_id: &str) -> Result<()> {
        let command = AgentCommand::Cancel {
            phase_id: phase_id.to_string(),
        };
        match self.call_detached(command).await? {
            AgentResponse::Cancelled { .. } => Ok(()),
            AgentResponse::Error { error, message } => Err(AgentResponse::into_error(error, message, &self.endpoint)),
            other => Err(OpsError::agent(&self.endpoint, format!("unexpected response {:?}", other), false)),
        }
    }

    async fn ping(&self) -> Result<String> {
        match self.call(AgentCommand::Ping).await? {
            AgentResponse::Pong { hostname } => Ok(hostname),
            AgentResponse::Error { error, message } => Err(AgentResponse::into_error(error, message, &self.endpoint)),
            other => Err(OpsError::agent(&self.endpoint, format!("unexpected response {:?}", other), false)),
        }
    }
}
