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
    use opsctl::infrastructure::backend::{Backend, MemoryBackend, VersionedPlan};
    use opsctl::shared::RetryPolicy;
    use opsctl::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    pub fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_times: 2,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    pub fn sample() -> (Operation, OperationPlan) {
        let op = Operation::new(OperationType::Update, "prod", vec![]);
        let plan = OperationPlan::new(
            &op,
            vec![
                Phase::new("/init", "Init").with_executor("noop"),
                Phase::new("/upgrade", "Upgrade").with_executor("noop").requires("/init"),
            ],
        );
        (op, plan)
    }

    /// A memory backend that can be switched off like a lost etcd.
    pub struct SwitchableBackend {
        inner: MemoryBackend,
        down: AtomicBool,
    }

    impl SwitchableBackend {
        pub fn new() -> Self {
            Self {
                inner: MemoryBackend::new("cluster"),
                down: AtomicBool::new(false),
            }
        }

        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(OpsError::backend("connection refused"));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Backend for SwitchableBackend {
        fn name(&self) -> &str {
            "cluster"
        }

        async fn create_operation(&self, operation: &Operation) -> Result<()> {
            self.check()?;
            self.inner.create_operation(operation).await
        }

        async fn get_operation(&self, key: &OperationKey) -> Result<Operation> {
            self.check()?;
            self.inner.get_operation(key).await
        }

        async fn update_operation(&self, operation: &Operation) -> Result<()> {
            self.check()?;
            self.inner.update_operation(operation).await
        }

        async fn list_operations(&self, cluster_name: Option<&str>) -> Result<Vec<Operation>> {
            self.check()?;
            self.inner.list_operations(cluster_name).await
        }

        async fn get_plan(&self, key: &OperationKey) -> Result<VersionedPlan> {
            self.check()?;
            self.inner.get_plan(key).await
        }

        async fn put_plan(&self, plan: &OperationPlan, expected: Option<u64>) -> Result<u64> {
            self.check()?;
            self.inner.put_plan(plan, expected).await
        }

        async fn upsert_plan(&self, plan: &OperationPlan) -> Result<u64> {
            self.check()?;
            self.inner.upsert_plan(plan).await
        }
    }

    /// Never answers.
    pub struct HangingBackend;

    #[async_trait::async_trait]
    impl Backend for HangingBackend {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn create_operation(&self, _operation: &Operation) -> Result<()> {
            std::future::pending().await
        }

        async fn get_operation(&self, _key: &OperationKey) -> Result<Operation> {
            std::future::pending().await
        }

        async fn update_operation(&self, _operation: &Operation) -> Result<()> {
            std::future::pending().await
        }

        async fn list_operations(&self, _cluster_name: Option<&str>) -> Result<Vec<Operation>> {
            std::future::pending().await
        }

        async fn get_plan(&self, _key: &OperationKey) -> Result<VersionedPlan> {
            std::future::pending().await
        }

        async fn put_plan(&self, _plan: &OperationPlan, _expected: Option<u64>) -> Result<u64> {
            std::future::pending().await
        }

        async fn upsert_plan(&self, _plan: &OperationPlan) -> Result<u64> {
            std::future::pending().await
        }
    }
}

use opsctl::infrastructure::backend::{Backend, FileBackend, MemoryBackend, TimeoutBackend};
use opsctl::*;
use std::sync::Arc;
use std::time::Duration;
use test_utils::*;
use tracing::Span;

#[tokio::test]
async fn test_degraded_mode_reads_and_writes_local_copy() {
    let cluster = Arc::new(SwitchableBackend::new());
    let shared: Arc<dyn Backend> = cluster.clone();
    let local: Arc<dyn Backend> = Arc::new(MemoryBackend::new("local"));
    let store = PlanStore::new(Some(shared), Some(local.clone()), fast_retry(), Span::none()).unwrap();

    let (op, plan) = sample();
    store.create_plan(&op, &plan).await.unwrap();

    cluster.set_down(true);
    assert_eq!(store.get_plan(&op.key()).await.unwrap(), plan);

    store
        .update_plan(&op.key(), |p| p.set_state("/init", PhaseState::Completed, None))
        .await
        .unwrap();
    let loaded = store.load_plan(&op.key()).await.unwrap();
    assert_eq!(loaded.state_of("/init").unwrap(), PhaseState::Completed);

    // The cluster copy catches up once it is reachable and synced again.
    cluster.set_down(false);
    assert_eq!(
        cluster.get_plan(&op.key()).await.unwrap().plan.state_of("/init").unwrap(),
        PhaseState::Unstarted
    );
    store.sync_plan_to_cluster(&op, &loaded).await.unwrap();
    assert_eq!(
        cluster.get_plan(&op.key()).await.unwrap().plan.state_of("/init").unwrap(),
        PhaseState::Completed
    );
}

#[tokio::test]
async fn test_unresponsive_cluster_falls_back_after_timeout() {
    let local: Arc<dyn Backend> = Arc::new(MemoryBackend::new("local"));
    let (op, plan) = sample();
    local.create_operation(&op).await.unwrap();
    local.put_plan(&plan, None).await.unwrap();

    let cluster: Arc<dyn Backend> = Arc::new(TimeoutBackend::new(Arc::new(HangingBackend), Duration::from_millis(20)));
    let store = PlanStore::new(Some(cluster), Some(local), fast_retry(), Span::none()).unwrap();

    let read = tokio::time::timeout(Duration::from_secs(5), store.get_plan(&op.key()))
        .await
        .expect("degraded read must not hang");
    assert_eq!(read.unwrap(), plan);
}

#[tokio::test]
async fn test_cluster_only_store_surfaces_outage() {
    let cluster = Arc::new(SwitchableBackend::new());
    let shared: Arc<dyn Backend> = cluster.clone();
    let store = PlanStore::new(Some(shared), None, fast_retry(), Span::none()).unwrap();
    let (op, plan) = sample();
    store.create_plan(&op, &plan).await.unwrap();

    cluster.set_down(true);
    let err = store.get_plan(&op.key()).await.unwrap_err();
    assert!(err.is_unreachable(), "{}", err);
}

#[tokio::test]
async fn test_stale_write_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileBackend::new("local", dir.path());
    let (op, plan) = sample();
    backend.create_operation(&op).await.unwrap();
    let first = backend.put_plan(&plan, None).await.unwrap();

    let mut changed = plan.clone();
    changed.set_state("/init", PhaseState::Completed, None).unwrap();
    let second = backend.put_plan(&changed, Some(first)).await.unwrap();
    assert!(second > first);

    let err = backend.put_plan(&plan, Some(first)).await.unwrap_err();
    assert!(matches!(err, OpsError::Conflict(_)), "{}", err);
    assert!(matches!(backend.put_plan(&plan, None).await, Err(OpsError::AlreadyExists { .. })));

    // A second instance over the same directory sees the persisted write.
    let reopened = FileBackend::new("local", dir.path());
    let stored = reopened.get_plan(&op.key()).await.unwrap();
    assert_eq!(stored.version, second);
    assert_eq!(stored.plan.state_of("/init").unwrap(), PhaseState::Completed);
}

#[tokio::test]
async fn test_concurrent_updates_are_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let local: Arc<dyn Backend> = Arc::new(FileBackend::new("local", dir.path()));
    let store = Arc::new(PlanStore::new(None, Some(local), fast_retry(), Span::none()).unwrap());

    let (op, plan) = sample();
    store.create_plan(&op, &plan).await.unwrap();

    let key = op.key();
    let (a, b) = tokio::join!(
        store.update_plan(&key, |p| p.set_state("/init", PhaseState::Completed, None)),
        store.update_plan(&key, |p| p.set_state("/upgrade", PhaseState::Failed, None)),
    );
    a.unwrap();
    b.unwrap();

    let stored = store.load_plan(&key).await.unwrap();
    assert_eq!(stored.state_of("/init").unwrap(), PhaseState::Completed);
    assert_eq!(stored.state_of("/upgrade").unwrap(), PhaseState::Failed);
}

#[tokio::test]
async fn test_missing_plan_is_not_found() {
    let store = PlanStore::new(Some(Arc::new(MemoryBackend::new("cluster"))), None, fast_retry(), Span::none()).unwrap();
    let err = store
        .get_plan(&OperationKey::new("prod", "missing"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_nodes_with_stale_local_copies_keep_each_others_updates() {
    let cluster: Arc<dyn Backend> = Arc::new(MemoryBackend::new("cluster"));
    let local_a: Arc<dyn Backend> = Arc::new(MemoryBackend::new("local"));
    let local_b: Arc<dyn Backend> = Arc::new(MemoryBackend::new("local"));
    let node_a = PlanStore::new(Some(cluster.clone()), Some(local_a), fast_retry(), Span::none()).unwrap();
    let node_b = PlanStore::new(Some(cluster.clone()), Some(local_b.clone()), fast_retry(), Span::none()).unwrap();

    let (op, plan) = sample();
    node_a.create_plan(&op, &plan).await.unwrap();
    local_b.create_operation(&op).await.unwrap();
    local_b.put_plan(&plan, None).await.unwrap();

    // Neither node reconciles before writing.
    node_a
        .update_plan(&op.key(), |p| p.set_state("/init", PhaseState::Completed, None))
        .await
        .unwrap();
    node_b
        .update_plan(&op.key(), |p| p.set_state("/upgrade", PhaseState::Failed, None))
        .await
        .unwrap();

    let shared = cluster.get_plan(&op.key()).await.unwrap().plan;
    assert_eq!(shared.state_of("/init").unwrap(), PhaseState::Completed);
    assert_eq!(shared.state_of("/upgrade").unwrap(), PhaseState::Failed);

    let reconciled = node_b.load_plan(&op.key()).await.unwrap();
    assert_eq!(reconciled.state_of("/init").unwrap(), PhaseState::Completed);
}
