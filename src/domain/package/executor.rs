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

use super::service::PackageService;
use super::update::{apply_package_update, revert_package_update, PackageUpdate};
use crate::domain::fsm::PhaseExecutor;
use crate::domain::plan::{OperationPlan, Phase};
use crate::shared::context::OpContext;
use crate::shared::error::{OpsError, Result};
use std::sync::Arc;
use tracing::Span;

pub const EXECUTOR_PACKAGES: &str = "packages";

/// Moves the installed label from the old packages to the new ones. The phase
/// data is a serialized [`PackageUpdate`].
pub struct PackageLabelExecutor {
    service: Arc<dyn PackageService>,
    span: Span,
}

impl PackageLabelExecutor {
    pub fn new(service: Arc<dyn PackageService>, span: Span) -> Self {
        Self { service, span }
    }

    pub fn phase(id: impl Into<String>, update: &PackageUpdate) -> Result<Phase> {
        let description = format!("Update package {} to {}", update.from, update.to.version);
        Ok(Phase::new(id, description)
            .with_executor(EXECUTOR_PACKAGES)
            .with_data(serde_json::to_value(update)?))
    }

    fn update(phase: &Phase) -> Result<PackageUpdate> {
        let data = phase
            .data
            .clone()
            .ok_or_else(|| OpsError::bad_parameter(format!("phase {} has no package update", phase.id)))?;
        Ok(serde_json::from_value(data)?)
    }
}

#[async_trait::async_trait]
impl PhaseExecutor for PackageLabelExecutor {
    fn name(&self) -> &str {
        EXECUTOR_PACKAGES
    }

    async fn execute(&self, ctx: &OpContext, _plan: &OperationPlan, phase: &Phase) -> Result<()> {
        let update = Self::update(phase)?;
        let what = format!("package update {}", update.to);
        ctx.run(&what, apply_package_update(self.service.as_ref(), &update, &self.span))
            .await
    }

    async fn rollback(&self, ctx: &OpContext, _plan: &OperationPlan, phase: &Phase) -> Result<()> {
        let update = Self::update(phase)?;
        let what = format!("package revert {}", update.from);
        ctx.run(&what, revert_package_update(self.service.as_ref(), &update, &self.span))
            .await
    }
}
