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

// Core modules
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod shared;

// Re-export commonly used types
pub use domain::dispatcher::{CreateOperation, OperationDispatcher, OperationSourceResolver, PhaseParams};
pub use domain::fsm::{ExecutorRegistry, Fsm, FsmConfig, PhaseExecutor};
pub use domain::operation::{Operation, OperationKey, OperationState, OperationType, Server, ServerRole};
pub use domain::plan::{OperationPlan, Phase, PhaseState};
pub use domain::store::PlanStore;
pub use shared::{OpContext, OpsError, Result};
