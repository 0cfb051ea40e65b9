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

//! Backends an operation can live in

use crate::domain::config::StateConf;
use crate::infrastructure::backend::{Backend, FileBackend, MemoryBackend, TimeoutBackend};
use crate::infrastructure::constants::{BACKEND_CLUSTER, BACKEND_JOIN, BACKEND_UPDATE, BACKEND_WIZARD};
use crate::shared::error::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Where an operation record was found, which also decides the backend
/// pairing its plan store uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationSource {
    Cluster,
    Update,
    Join,
    Wizard,
}

impl OperationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => BACKEND_CLUSTER,
            Self::Update => BACKEND_UPDATE,
            Self::Join => BACKEND_JOIN,
            Self::Wizard => BACKEND_WIZARD,
        }
    }
}

impl fmt::Display for OperationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens backends on demand. Callers hold a backend only for the duration
/// of one command.
pub trait EnvironmentFactory: Send + Sync {
    /// The cluster-wide backend. `timeout` bounds every call when given.
    fn new_cluster_env(&self, timeout: Option<Duration>) -> Result<Arc<dyn Backend>>;

    /// Node-local backend of update operations.
    fn new_update_env(&self) -> Result<Option<Arc<dyn Backend>>>;

    /// Node-local backend of join/expand operations.
    fn new_join_env(&self) -> Result<Option<Arc<dyn Backend>>>;

    /// Backend of the install wizard, used before a cluster exists.
    fn new_wizard_env(&self) -> Result<Arc<dyn Backend>>;

    fn env(&self, source: OperationSource, timeout: Option<Duration>) -> Result<Option<Arc<dyn Backend>>> {
        match source {
            OperationSource::Cluster => self.new_cluster_env(timeout).map(Some),
            OperationSource::Update => self.new_update_env(),
            OperationSource::Join => self.new_join_env(),
            OperationSource::Wizard => self.new_wizard_env().map(Some),
        }
    }
}

/// File backends under the configured state directories.
pub struct LocalEnvironmentFactory {
    state: StateConf,
    connect_timeout: Duration,
}

impl LocalEnvironmentFactory {
    pub fn new(state: StateConf, connect_timeout: Duration) -> Self {
        Self {
            state,
            connect_timeout,
        }
    }

    fn bounded(&self, backend: FileBackend, timeout: Option<Duration>) -> Arc<dyn Backend> {
        let timeout = timeout.unwrap_or(self.connect_timeout);
        Arc::new(TimeoutBackend::new(Arc::new(backend), timeout))
    }

    /// Local environments exist only once their directory was created.
    fn existing(&self, name: &str, path: std::path::PathBuf) -> Option<Arc<dyn Backend>> {
        let backend = FileBackend::new(name, path);
        if backend.exists() {
            Some(self.bounded(backend, None))
        } else {
            None
        }
    }
}

impl EnvironmentFactory for LocalEnvironmentFactory {
    fn new_cluster_env(&self, timeout: Option<Duration>) -> Result<Arc<dyn Backend>> {
        Ok(self.bounded(FileBackend::new(BACKEND_CLUSTER, self.state.cluster_path()), timeout))
    }

    fn new_update_env(&self) -> Result<Option<Arc<dyn Backend>>> {
        Ok(self.existing(BACKEND_UPDATE, self.state.update_path()))
    }

    fn new_join_env(&self) -> Result<Option<Arc<dyn Backend>>> {
        Ok(self.existing(BACKEND_JOIN, self.state.join_path()))
    }

    fn new_wizard_env(&self) -> Result<Arc<dyn Backend>> {
        Ok(self.bounded(FileBackend::new(BACKEND_WIZARD, self.state.wizard_path()), None))
    }
}

/// In-process backends, one per source. Used by tests and dry runs.
pub struct MemoryEnvironmentFactory {
    cluster: Arc<MemoryBackend>,
    update: Arc<MemoryBackend>,
    join: Arc<MemoryBackend>,
    wizard: Arc<MemoryBackend>,
}

impl Default for MemoryEnvironmentFactory {
    fn default() -> Self {
        Self {
            cluster: Arc::new(MemoryBackend::new(BACKEND_CLUSTER)),
            update: Arc::new(MemoryBackend::new(BACKEND_UPDATE)),
            join: Arc::new(MemoryBackend::new(BACKEND_JOIN)),
            wizard: Arc::new(MemoryBackend::new(BACKEND_WIZARD)),
        }
    }
}

impl MemoryEnvironmentFactory {
    pub fn cluster(&self) -> Arc<dyn Backend> {
        self.cluster.clone()
    }

    pub fn update(&self) -> Arc<dyn Backend> {
        self.update.clone()
    }

    pub fn join(&self) -> Arc<dyn Backend> {
        self.join.clone()
    }

    pub fn wizard(&self) -> Arc<dyn Backend> {
        self.wizard.clone()
    }
}

impl EnvironmentFactory for MemoryEnvironmentFactory {
    fn new_cluster_env(&self, _timeout: Option<Duration>) -> Result<Arc<dyn Backend>> {
        Ok(self.cluster())
    }

    fn new_update_env(&self) -> Result<Option<Arc<dyn Backend>>> {
        Ok(Some(self.update()))
    }

    fn new_join_env(&self) -> Result<Option<Arc<dyn Backend>>> {
        Ok(Some(self.join()))
    }

    fn new_wizard_env(&self) -> Result<Arc<dyn Backend>> {
        Ok(self.wizard())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_envs_exist_only_when_created() {
        let dir = TempDir::new().unwrap();
        let state = StateConf {
            home: dir.path().to_path_buf(),
            ..StateConf::default()
        };
        let factory = LocalEnvironmentFactory::new(state.clone(), Duration::from_secs(1));
        assert!(factory.new_update_env().unwrap().is_none());

        std::fs::create_dir_all(state.update_path()).unwrap();
        let update = factory.new_update_env().unwrap().unwrap();
        assert_eq!(update.name(), BACKEND_UPDATE);
        assert_eq!(factory.new_cluster_env(None).unwrap().name(), BACKEND_CLUSTER);
    }
}
