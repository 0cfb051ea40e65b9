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

//! opsctl configuration file

use crate::domain::operation::Server;
use crate::infrastructure::constants::*;
use crate::shared::error::{OpsError, Result};
use crate::shared::logging::LoggingConfig;
use crate::shared::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Main configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cluster_name: String,
    pub node: NodeConf,
    pub state: StateConf,
    pub backend: BackendConf,
    pub agent: AgentConf,
    pub executor: ExecutorConf,
    pub logging: LoggingConfig,
    pub upgrade: UpgradeConf,
    pub servers: Vec<Server>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cluster_name: "default".to_string(),
            node: NodeConf::default(),
            state: StateConf::default(),
            backend: BackendConf::default(),
            agent: AgentConf::default(),
            executor: ExecutorConf::default(),
            logging: LoggingConfig::default(),
            upgrade: UpgradeConf::default(),
            servers: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from TOML file
    pub fn from<T: AsRef<Path>>(path: T) -> Result<Self> {
        let path = path.as_ref();
        let content = read_to_string(path).map_err(|e| {
            OpsError::bad_parameter(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let conf: Self = toml::from_str(content)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Resolves the configuration from an explicit path, `$OPSCTL_CONFIG`,
    /// or the default location. Defaults are used when no file exists at
    /// the default location.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from(path);
        }
        let default = Path::new(CONFIG_FILE);
        if default.is_file() {
            return Self::from(default);
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(OpsError::bad_parameter("cluster_name must not be empty"));
        }
        if self.executor.parallel_workers == 0 {
            return Err(OpsError::bad_parameter("executor.parallel_workers must be at least 1"));
        }
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.hostname.as_str()) {
                return Err(OpsError::bad_parameter(format!(
                    "server {} is listed more than once",
                    server.hostname
                )));
            }
        }
        Ok(())
    }

    /// Retry policy for backend writes.
    pub fn write_retry(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_times(self.backend.write_retries)
    }

    /// Retry policy for agent dispatch.
    pub fn agent_retry(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_times(self.agent.connect_attempts.saturating_sub(1))
    }
}

// ============================================================================
// Local node
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConf {
    pub hostname: String,
    pub advertise_addr: String,
}

impl Default for NodeConf {
    fn default() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            hostname,
            advertise_addr: "127.0.0.1".to_string(),
        }
    }
}

// ============================================================================
// State directories
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConf {
    pub home: PathBuf,
    pub cluster_dir: PathBuf,
    pub update_dir: PathBuf,
    pub join_dir: PathBuf,
    pub wizard_dir: PathBuf,
}

impl Default for StateConf {
    fn default() -> Self {
        Self {
            home: PathBuf::from(STATE_HOME),
            cluster_dir: PathBuf::from(CLUSTER_STATE_DIR),
            update_dir: PathBuf::from(UPDATE_STATE_DIR),
            join_dir: PathBuf::from(JOIN_STATE_DIR),
            wizard_dir: PathBuf::from(WIZARD_STATE_DIR),
        }
    }
}

impl StateConf {
    fn resolve(&self, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.home.join(dir)
        }
    }

    pub fn cluster_path(&self) -> PathBuf {
        self.resolve(&self.cluster_dir)
    }

    pub fn update_path(&self) -> PathBuf {
        self.resolve(&self.update_dir)
    }

    pub fn join_path(&self) -> PathBuf {
        self.resolve(&self.join_dir)
    }

    pub fn wizard_path(&self) -> PathBuf {
        self.resolve(&self.wizard_dir)
    }
}

// ============================================================================
// Backend access
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConf {
    #[serde(with = "crate::shared::duration")]
    pub connect_timeout: Duration,
    /// Bound on "is there an active operation" lookups against the cluster.
    #[serde(with = "crate::shared::duration")]
    pub active_operation_timeout: Duration,
    pub write_retries: usize,
}

impl Default for BackendConf {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            active_operation_timeout: ACTIVE_OPERATION_TIMEOUT,
            write_retries: DEFAULT_WRITE_RETRIES,
        }
    }
}

// ============================================================================
// Node agents
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConf {
    pub port: u16,
    pub listen_addr: String,
    pub secrets_dir: PathBuf,
    pub hooks_dir: PathBuf,
    pub connect_attempts: usize,
    #[serde(with = "crate::shared::duration")]
    pub connect_timeout: Duration,
}

impl Default for AgentConf {
    fn default() -> Self {
        Self {
            port: AGENT_DEFAULT_PORT,
            listen_addr: AGENT_LISTEN_ADDR.to_string(),
            secrets_dir: PathBuf::from(AGENT_SECRETS_DIR),
            hooks_dir: PathBuf::from(AGENT_HOOKS_DIR),
            connect_attempts: AGENT_CONNECT_ATTEMPTS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl AgentConf {
    pub fn listen_endpoint(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }
}

// ============================================================================
// Phase execution
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConf {
    pub parallel_workers: usize,
    #[serde(with = "crate::shared::duration")]
    pub phase_timeout: Duration,
}

impl Default for ExecutorConf {
    fn default() -> Self {
        Self {
            parallel_workers: DEFAULT_PARALLEL_WORKERS,
            phase_timeout: DEFAULT_PHASE_TIMEOUT,
        }
    }
}

// ============================================================================
// Package upgrades
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ComparatorKind {
    #[default]
    Semver,
    BuildMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UpgradeConf {
    /// YAML package catalog.
    pub catalog: Option<PathBuf>,
    /// Repository holding the cluster packages.
    pub repository: String,
    pub runtime_package: String,
    pub config_package: Option<String>,
    pub comparator: ComparatorKind,
}
