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

pub mod client;
pub mod credentials;
pub mod hooks;
pub mod protocol;
pub mod runner;
pub mod server;

pub use self::client::{AgentClient, AgentConnector, TcpAgentClient, TcpConnector};
pub use self::credentials::Credentials;
pub use self::hooks::HookRunner;
pub use self::protocol::{AgentCommand, AgentRequest, AgentResponse, PhaseSpec};
pub use self::runner::AgentRunner;
pub use self::server::AgentServer;
