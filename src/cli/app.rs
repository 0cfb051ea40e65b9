//! Services shared by every command, built once per invocation

use crate::domain::config::{AppConfig, ComparatorKind};
use crate::domain::dispatcher::{
    EnvironmentFactory, LocalEnvironmentFactory, OperationDispatcher, OperationSourceResolver, ResolvedOperation,
};
use crate::domain::fsm::{ExecutorRegistry, FsmConfig, HookExecutor};
use crate::domain::package::{
    BuildMetadataComparator, CatalogPackageService, PackageLabelExecutor, PackageService, SemverComparator,
    VersionComparator,
};
use crate::infrastructure::agent::{AgentRunner, Credentials, HookRunner, TcpConnector};
use crate::shared::context::OpContext;
use crate::shared::error::Result;
use crate::shared::logging;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn, Span};

pub struct App {
    pub config: AppConfig,
    /// Config file given on the command line, passed on to child processes.
    pub config_path: Option<PathBuf>,
    /// Cancelled on SIGINT/SIGTERM.
    pub ctx: OpContext,
    pub dispatcher: OperationDispatcher,
    pub resolver: OperationSourceResolver,
    pub packages: Option<Arc<dyn PackageService>>,
    pub span: Span,
}

impl App {
    pub async fn new(config: AppConfig, config_path: Option<PathBuf>, ctx: OpContext) -> Result<Self> {
        let factory: Arc<dyn EnvironmentFactory> = Arc::new(LocalEnvironmentFactory::new(
            config.state.clone(),
            config.backend.connect_timeout,
        ));
        Self::with_factory(config, config_path, ctx, factory).await
    }

    /// Builds the services over the given backends instead of the state
    /// directories named in `config`.
    pub async fn with_factory(
        config: AppConfig,
        config_path: Option<PathBuf>,
        ctx: OpContext,
        factory: Arc<dyn EnvironmentFactory>,
    ) -> Result<Self> {
        let span = logging::component("cli");

        let agents = match Credentials::load(&config.agent.secrets_dir) {
            Ok(credentials) => {
                let connector = Arc::new(TcpConnector::new(config.agent.port, config.agent.connect_timeout));
                Some(Arc::new(AgentRunner::new(
                    connector,
                    credentials,
                    config.agent_retry(),
                    logging::component("agent-runner"),
                )))
            }
            Err(e) => {
                debug!(parent: &span, error = %e, "no agent credentials, remote phases are unavailable");
                None
            }
        };

        let hooks = HookRunner::new(&config.agent.hooks_dir, logging::component("hooks"));
        let mut executors = ExecutorRegistry::new();
        executors.register(Arc::new(HookExecutor::new(
            &config.node.hostname,
            hooks,
            agents,
            logging::component("hook-executor"),
        )));

        let packages: Option<Arc<dyn PackageService>> = match &config.upgrade.catalog {
            Some(path) => match CatalogPackageService::open(path).await {
                Ok(service) => Some(Arc::new(service)),
                Err(e) => {
                    warn!(parent: &span, catalog = %path.display(), error = %e, "package catalog unavailable");
                    None
                }
            },
            None => None,
        };
        if let Some(service) = &packages {
            executors.register(Arc::new(PackageLabelExecutor::new(
                service.clone(),
                logging::component("packages"),
            )));
        }

        let fsm_config = FsmConfig {
            parallel_workers: config.executor.parallel_workers,
            phase_timeout: config.executor.phase_timeout,
        };
        let dispatcher = OperationDispatcher::new(
            factory.clone(),
            Arc::new(executors),
            fsm_config,
            config.write_retry(),
            logging::component("dispatcher"),
        );
        let resolver = OperationSourceResolver::new(
            factory,
            config.backend.active_operation_timeout,
            logging::component("resolver"),
        );

        Ok(Self {
            config,
            config_path,
            ctx,
            dispatcher,
            resolver,
            packages,
            span,
        })
    }

    /// The operation named by `operation_id`, or the active one.
    pub async fn resolve(&self, operation_id: Option<&str>) -> Result<ResolvedOperation> {
        self.resolver
            .resolve(Some(&self.config.cluster_name), operation_id)
            .await
    }

    pub fn comparator(&self) -> Arc<dyn VersionComparator> {
        match self.config.upgrade.comparator {
            ComparatorKind::Semver => Arc::new(SemverComparator),
            ComparatorKind::BuildMetadata => Arc::new(BuildMetadataComparator),
        }
    }
}
