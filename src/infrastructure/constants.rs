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

use std::time::Duration;

/// Application paths
pub const STATE_HOME: &str = "/var/lib/opsctl";
pub const CONFIG_FILE: &str = "/etc/opsctl/opsctl.toml";
pub const CONFIG_ENV: &str = "OPSCTL_CONFIG";

/// Backend state directories, relative to the state home
pub const CLUSTER_STATE_DIR: &str = "cluster";
pub const UPDATE_STATE_DIR: &str = "local/update";
pub const JOIN_STATE_DIR: &str = "local/join";
pub const WIZARD_STATE_DIR: &str = "wizard";

/// Backend names
pub const BACKEND_CLUSTER: &str = "cluster";
pub const BACKEND_UPDATE: &str = "update";
pub const BACKEND_JOIN: &str = "join";
pub const BACKEND_WIZARD: &str = "wizard";

/// Backend timeouts
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const ACTIVE_OPERATION_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_WRITE_RETRIES: usize = 5;

/// Agent settings
pub const AGENT_DEFAULT_PORT: u16 = 3012;
pub const AGENT_LISTEN_ADDR: &str = "0.0.0.0";
pub const AGENT_TOKEN_FILE: &str = "agent.token";
pub const AGENT_SECRETS_DIR: &str = "/var/lib/opsctl/secrets";
pub const AGENT_HOOKS_DIR: &str = "/usr/lib/opsctl/hooks";
pub const AGENT_CONNECT_ATTEMPTS: usize = 3;
pub const AGENT_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Executor settings
pub const DEFAULT_PARALLEL_WORKERS: usize = 4;
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const FOLLOW_INTERVAL: Duration = Duration::from_secs(2);

/// Executor names
pub const EXECUTOR_NOOP: &str = "noop";
pub const EXECUTOR_HOOK: &str = "hook";

/// Package labels
pub const LABEL_INSTALLED: &str = "installed";
