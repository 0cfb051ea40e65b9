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

mod test_utils {
    use opsctl::domain::package::{Locator, MemoryPackageService, Package, PackageFilter, PackageService};
    use opsctl::{OpsError, Result};
    use std::collections::BTreeMap;

    pub fn loc(s: &str) -> Locator {
        s.parse().unwrap()
    }

    pub fn installed(s: &str) -> Package {
        Package::new(loc(s)).with_label("installed", "true")
    }

    pub fn available(s: &str) -> Package {
        Package::new(loc(s))
    }

    /// Rejects label changes on one package.
    pub struct BrokenPackageService {
        pub inner: MemoryPackageService,
        pub broken: Locator,
    }

    #[async_trait::async_trait]
    impl PackageService for BrokenPackageService {
        async fn list_packages(&self, filter: &PackageFilter) -> Result<Vec<Package>> {
            self.inner.list_packages(filter).await
        }

        async fn read_package(&self, locator: &Locator) -> Result<Package> {
            self.inner.read_package(locator).await
        }

        async fn update_package_labels(
            &self,
            locator: &Locator,
            add: &BTreeMap<String, String>,
            remove: &[String],
        ) -> Result<()> {
            if *locator == self.broken {
                return Err(OpsError::backend(format!("{} is read-only", locator)));
            }
            self.inner.update_package_labels(locator, add, remove).await
        }
    }
}

use opsctl::domain::package::*;
use opsctl::infrastructure::backend::MemoryBackend;
use opsctl::shared::RetryPolicy;
use opsctl::*;
use std::sync::Arc;
use test_utils::*;
use tracing::Span;

fn runtime_request() -> PackageUpdateRequest {
    PackageUpdateRequest::new(loc("repo/runtime:1.2.0")).with_config(ConfigUpdateRequest {
        installed: loc("repo/runtime-config:1.2.0"),
        target: None,
    })
}

#[tokio::test]
async fn test_finds_newest_runtime_and_config() {
    let service = MemoryPackageService::new(vec![
        installed("repo/runtime:1.2.0"),
        available("repo/runtime:1.3.0"),
        available("repo/runtime:1.2.5"),
        installed("repo/runtime-config:1.2.0"),
        available("repo/runtime-config:1.3.0"),
    ]);

    let update = find_package_update(&service, &runtime_request()).await.unwrap();
    assert_eq!(update.from, loc("repo/runtime:1.2.0"));
    assert_eq!(update.to, loc("repo/runtime:1.3.0"));
    let config = update.config.as_ref().unwrap();
    assert_eq!(config.to, loc("repo/runtime-config:1.3.0"));
    assert_eq!(update.steps().len(), 2);
}

#[tokio::test]
async fn test_only_older_candidates_is_not_found() {
    let service = MemoryPackageService::new(vec![
        available("repo/runtime:1.1.0"),
        installed("repo/runtime:1.2.0"),
    ]);
    let err = find_package_update(&service, &PackageUpdateRequest::new(loc("repo/runtime:1.2.0")))
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{}", err);
}

#[tokio::test]
async fn test_missing_config_update_is_omitted() {
    let service = MemoryPackageService::new(vec![
        installed("repo/runtime:1.2.0"),
        available("repo/runtime:1.3.0"),
        installed("repo/runtime-config:1.2.0"),
    ]);
    let update = find_package_update(&service, &runtime_request()).await.unwrap();
    assert_eq!(update.to, loc("repo/runtime:1.3.0"));
    assert!(update.config.is_none());
}

#[tokio::test]
async fn test_apply_moves_installed_label() {
    let service = MemoryPackageService::new(vec![
        installed("repo/runtime:1.2.0"),
        available("repo/runtime:1.3.0"),
        installed("repo/runtime-config:1.2.0"),
        available("repo/runtime-config:1.3.0"),
    ]);
    let update = find_package_update(&service, &runtime_request()).await.unwrap();
    apply_package_update(&service, &update, &Span::none()).await.unwrap();

    let runtime = service.find_installed_package("repo", "runtime").await.unwrap();
    assert_eq!(runtime.locator, loc("repo/runtime:1.3.0"));
    let config = service.find_installed_package("repo", "runtime-config").await.unwrap();
    assert_eq!(config.locator, loc("repo/runtime-config:1.3.0"));

    revert_package_update(&service, &update, &Span::none()).await.unwrap();
    let runtime = service.find_installed_package("repo", "runtime").await.unwrap();
    assert_eq!(runtime.locator, loc("repo/runtime:1.2.0"));
}

#[tokio::test]
async fn test_failed_step_reverts_applied_steps() {
    let inner = MemoryPackageService::new(vec![
        installed("repo/runtime:1.2.0"),
        available("repo/runtime:1.3.0"),
        installed("repo/runtime-config:1.2.0"),
        available("repo/runtime-config:1.3.0"),
    ]);
    let service = BrokenPackageService {
        inner,
        broken: loc("repo/runtime-config:1.3.0"),
    };

    let update = find_package_update(&service, &runtime_request()).await.unwrap();
    assert!(apply_package_update(&service, &update, &Span::none()).await.is_err());

    let runtime = service.find_installed_package("repo", "runtime").await.unwrap();
    assert_eq!(runtime.locator, loc("repo/runtime:1.2.0"));
    let config = service.find_installed_package("repo", "runtime-config").await.unwrap();
    assert_eq!(config.locator, loc("repo/runtime-config:1.2.0"));
}

#[tokio::test]
async fn test_package_phase_runs_and_rolls_back_through_fsm() {
    let service = Arc::new(MemoryPackageService::new(vec![
        installed("repo/runtime:1.2.0"),
        available("repo/runtime:1.3.0"),
    ]));
    let update = find_package_update(service.as_ref(), &PackageUpdateRequest::new(loc("repo/runtime:1.2.0")))
        .await
        .unwrap();

    let executor = Arc::new(PackageLabelExecutor::new(service.clone(), Span::none()));
    let phase = PackageLabelExecutor::phase("/packages", &update).unwrap();

    let operation = Operation::new(OperationType::Update, "prod", vec![]);
    let plan = OperationPlan::new(&operation, vec![phase]);
    let store = Arc::new(
        PlanStore::new(Some(Arc::new(MemoryBackend::new("cluster"))), None, RetryPolicy::none(), Span::none()).unwrap(),
    );
    store.create_plan(&operation, &plan).await.unwrap();
    let fsm = Fsm::new(
        operation.key(),
        store,
        Arc::new(ExecutorRegistry::new().with(executor)),
        FsmConfig::default(),
        Span::none(),
    );

    let ctx = OpContext::default();
    fsm.execute_phase(&ctx, "/packages", None, false).await.unwrap();
    let runtime = service.find_installed_package("repo", "runtime").await.unwrap();
    assert_eq!(runtime.locator, loc("repo/runtime:1.3.0"));

    fsm.rollback_phase(&ctx, "/packages", None, false).await.unwrap();
    let runtime = service.find_installed_package("repo", "runtime").await.unwrap();
    assert_eq!(runtime.locator, loc("repo/runtime:1.2.0"));
    assert_eq!(fsm.plan().await.unwrap().state_of("/packages").unwrap(), PhaseState::RolledBack);
}
