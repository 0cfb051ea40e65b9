//! Operation and plan commands

use super::app::App;
use super::display::{render_plan, OutputFormat, TableRenderer};
use crate::domain::dispatcher::builders;
use crate::domain::dispatcher::{CreateOperation, PhaseParams};
use crate::domain::operation::{Operation, OperationType, Server};
use crate::domain::package::{
    find_package_update, ConfigUpdateRequest, Locator, PackageLabelExecutor, PackageUpdate, PackageUpdateRequest,
};
use crate::domain::plan::{OperationPlan, Phase, PhaseState, ROOT_PHASE};
use crate::infrastructure::constants::FOLLOW_INTERVAL;
use crate::shared::duration::parse_duration;
use crate::shared::error::{OpsError, Result};
use clap::{ArgAction, Parser};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::info;

/// Flags shared by the phase-level commands.
#[derive(Parser, Debug, Clone)]
pub struct PhaseArgs {
    /// Phase ID, e.g. /masters/node-1/drain. Defaults to the whole plan
    #[arg(long, default_value = ROOT_PHASE)]
    pub phase: String,

    /// Bypass predecessor and state checks
    #[arg(long)]
    pub force: bool,

    /// Per phase timeout (e.g. "30s", "10m")
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Operation ID. Defaults to the active operation
    #[arg(long)]
    pub operation_id: Option<String>,
}

impl PhaseArgs {
    fn params(&self) -> PhaseParams {
        PhaseParams {
            phase_id: self.phase.clone(),
            force: self.force,
            timeout: self.timeout,
        }
    }
}

/// How a newly started operation is driven.
#[derive(Parser, Debug, Clone)]
pub struct LaunchArgs {
    /// Only create the operation; phases are executed by hand
    #[arg(long)]
    pub manual: bool,

    /// Run in the foreground. --block=false resumes in a background process
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub block: bool,
}

#[derive(Parser, Debug)]
pub struct DisplayCommand {
    #[arg(long)]
    pub operation_id: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Keep printing the plan until the operation finishes
    #[arg(long)]
    pub follow: bool,
}

#[derive(Parser, Debug)]
pub struct ListCommand {}

#[derive(Parser, Debug)]
pub struct InitCommand {
    /// Operation type
    #[arg(long = "type", value_name = "TYPE")]
    pub kind: OperationType,

    /// Plan document (JSON or YAML) to use instead of the built-in layout
    #[arg(long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Participating servers as hostname=address[:role]. Defaults to the configured servers
    #[arg(long = "server", value_parser = Server::parse)]
    pub servers: Vec<Server>,
}

#[derive(Parser, Debug)]
pub struct ExecuteCommand {
    #[command(flatten)]
    pub phase: PhaseArgs,
}

#[derive(Parser, Debug)]
pub struct RollbackPhaseCommand {
    #[command(flatten)]
    pub phase: PhaseArgs,
}

#[derive(Parser, Debug)]
pub struct ResumeCommand {
    #[arg(long)]
    pub operation_id: Option<String>,

    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Run in the foreground. --block=false resumes in a background process
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub block: bool,
}

#[derive(Parser, Debug)]
pub struct CompleteCommand {
    #[arg(long)]
    pub operation_id: Option<String>,
}

#[derive(Parser, Debug)]
pub struct SetCommand {
    #[arg(long)]
    pub phase: String,

    /// New state: unstarted, in_progress, completed, failed, rolled_back
    #[arg(long)]
    pub state: PhaseState,

    #[arg(long)]
    pub operation_id: Option<String>,
}

#[derive(Parser, Debug)]
pub struct UpgradeCommand {
    /// Runtime package to upgrade to (repository/name:version). Defaults to the latest
    pub package: Option<String>,

    /// Accept a target that is not newer than the installed package
    #[arg(long)]
    pub skip_version_check: bool,

    #[command(flatten)]
    pub launch: LaunchArgs,
}

#[derive(Parser, Debug)]
pub struct RollbackCommand {
    #[arg(long)]
    pub operation_id: Option<String>,

    #[arg(long)]
    pub force: bool,

    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
}

#[derive(Parser, Debug)]
pub struct GcCommand {
    /// Phase to execute on an existing garbage collection operation
    #[arg(long)]
    pub phase: Option<String>,

    #[arg(long)]
    pub force: bool,

    #[arg(long)]
    pub operation_id: Option<String>,

    #[command(flatten)]
    pub launch: LaunchArgs,
}

impl DisplayCommand {
    pub async fn execute(&self, app: &App) -> anyhow::Result<()> {
        self.watch(app, FOLLOW_INTERVAL, |rendered| println!("{}", rendered))
            .await?;
        Ok(())
    }

    /// Renders the plan once, or with `--follow` every `interval` until the
    /// operation finishes or the invocation is interrupted.
    async fn watch(&self, app: &App, interval: Duration, mut emit: impl FnMut(String)) -> Result<()> {
        loop {
            let resolved = app.resolve(self.operation_id.as_deref()).await?;
            let plan = app.dispatcher.plan(&resolved.operation).await?;
            emit(render_plan(self.format, Some(&resolved.operation), &plan)?);

            if !self.follow || resolved.operation.is_finished() {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = app.ctx.token().cancelled() => return Ok(()),
            }
        }
    }
}

impl ListCommand {
    pub async fn execute(&self, app: &App) -> anyhow::Result<()> {
        let operations = app.resolver.operations(Some(&app.config.cluster_name)).await?;
        println!("{}", TableRenderer::new().render_operations(&operations.list()));
        Ok(())
    }
}

fn read_plan_document(path: &PathBuf) -> Result<Vec<Phase>> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    let plan: OperationPlan = if is_json {
        serde_json::from_str(&content)?
    } else {
        serde_yaml::from_str(&content)?
    };
    Ok(plan.phases)
}

fn servers_or_configured(app: &App, servers: &[Server]) -> Vec<Server> {
    if servers.is_empty() {
        app.config.servers.clone()
    } else {
        servers.to_vec()
    }
}

impl InitCommand {
    pub async fn execute(&self, app: &App) -> anyhow::Result<()> {
        app.resolver.ensure_no_active(&app.config.cluster_name).await?;
        let phases = self.file.as_ref().map(read_plan_document).transpose()?;
        let (operation, plan) = app
            .dispatcher
            .create_operation(CreateOperation {
                kind: self.kind,
                cluster_name: app.config.cluster_name.clone(),
                servers: servers_or_configured(app, &self.servers),
                phases,
            })
            .await?;
        println!(
            "{} Created {} operation {} with {} phases",
            "✓".green(),
            operation.kind,
            operation.id,
            plan.all_phases().len()
        );
        Ok(())
    }
}

impl ExecuteCommand {
    pub async fn execute(&self, app: &App) -> anyhow::Result<()> {
        let resolved = app.resolve(self.phase.operation_id.as_deref()).await?;
        app.dispatcher
            .execute_phase(&app.ctx, &resolved.operation, &self.phase.params())
            .await?;
        println!("{} Executed phase {}", "✓".green(), self.phase.phase);
        Ok(())
    }
}

impl RollbackPhaseCommand {
    pub async fn execute(&self, app: &App) -> anyhow::Result<()> {
        let resolved = app.resolve(self.phase.operation_id.as_deref()).await?;
        app.dispatcher
            .rollback_phase(&app.ctx, &resolved.operation, &self.phase.params())
            .await?;
        println!("{} Rolled back phase {}", "✓".green(), self.phase.phase);
        Ok(())
    }
}

/// `plan resume --block` for `operation_id`, detached from this terminal.
fn resume_command(exe: &Path, config_path: Option<&Path>, operation_id: &str) -> tokio::process::Command {
    let mut command = tokio::process::Command::new(exe);
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }
    command
        .args(["plan", "resume", "--block=true", "--operation-id", operation_id])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    command.process_group(0);
    command
}

/// Re-launches this binary to drive `operation` in the background.
async fn resume_in_background(app: &App, operation: &Operation) -> Result<()> {
    let exe = std::env::current_exe()?;
    let mut command = resume_command(&exe, app.config_path.as_deref(), &operation.id);
    let child = command.spawn()?;
    info!(parent: &app.span, operation = %operation.id, pid = ?child.id(), "resuming operation in background");
    println!(
        "Operation {} is running in the background. Watch it with 'opsctl plan display --follow'",
        operation.id
    );
    Ok(())
}

async fn drive(app: &App, operation: &Operation, block: bool) -> Result<()> {
    if !block {
        return resume_in_background(app, operation).await;
    }
    let operation = app.dispatcher.run_to_completion(&app.ctx, operation).await?;
    println!("{} Operation {} {}", "✓".green(), operation.id, operation.state);
    Ok(())
}

impl ResumeCommand {
    pub async fn execute(&self, app: &App) -> anyhow::Result<()> {
        let resolved = app.resolve(self.operation_id.as_deref()).await?;
        if !self.block {
            resume_in_background(app, &resolved.operation).await?;
            return Ok(());
        }
        let ctx = match self.timeout {
            Some(timeout) => app.ctx.with_timeout(timeout),
            None => app.ctx.clone(),
        };
        let operation = app.dispatcher.run_to_completion(&ctx, &resolved.operation).await?;
        println!("{} Operation {} {}", "✓".green(), operation.id, operation.state);
        Ok(())
    }
}

impl CompleteCommand {
    pub async fn execute(&self, app: &App) -> anyhow::Result<()> {
        let resolved = app.resolve(self.operation_id.as_deref()).await?;
        let plan = app.dispatcher.plan(&resolved.operation).await?;
        let error = if plan.is_completed() {
            None
        } else {
            Some(OpsError::precondition("operation was completed with unfinished phases"))
        };
        let operation = app.dispatcher.complete(&resolved.operation, error.as_ref()).await?;
        println!("Operation {} marked {}", operation.id, operation.state);
        Ok(())
    }
}

impl SetCommand {
    pub async fn execute(&self, app: &App) -> anyhow::Result<()> {
        let resolved = app.resolve(self.operation_id.as_deref()).await?;
        app.dispatcher
            .set_phase_state(&resolved.operation, &self.phase, self.state)
            .await?;
        println!("Phase {} set to {}", self.phase, self.state);
        Ok(())
    }
}

impl UpgradeCommand {
    async fn package_update(&self, app: &App) -> Result<Option<PackageUpdate>> {
        let Some(service) = &app.packages else {
            if self.package.is_some() {
                return Err(OpsError::precondition("no package catalog is configured"));
            }
            return Ok(None);
        };
        let conf = &app.config.upgrade;
        let installed = service
            .find_installed_package(&conf.repository, &conf.runtime_package)
            .await?
            .locator;

        let mut request = PackageUpdateRequest::new(installed).with_comparator(app.comparator());
        request.skip_version_check = self.skip_version_check;
        if let Some(target) = &self.package {
            request = request.with_target(target.parse::<Locator>()?);
        }
        if let Some(config_package) = &conf.config_package {
            match service.find_installed_package(&conf.repository, config_package).await {
                Ok(package) => {
                    request = request.with_config(ConfigUpdateRequest {
                        installed: package.locator,
                        target: None,
                    })
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(Some(find_package_update(service.as_ref(), &request).await?))
    }

    pub async fn execute(&self, app: &App) -> anyhow::Result<()> {
        app.resolver.ensure_no_active(&app.config.cluster_name).await?;
        let update = self.package_update(app).await?;

        let servers = app.config.servers.clone();
        let layout = Operation::new(OperationType::Update, &app.config.cluster_name, servers.clone());
        let mut phases = builders::update_plan(&layout)?;
        if let Some(update) = &update {
            println!("Updating {} to {}", update.from, update.to.version);
            let mut phase = PackageLabelExecutor::phase("/packages", update)?;
            if let Some(last) = phases.last() {
                phase = phase.requires(last.id.clone());
            }
            phases.push(phase);
        }

        let (operation, _) = app
            .dispatcher
            .create_operation(CreateOperation {
                kind: OperationType::Update,
                cluster_name: app.config.cluster_name.clone(),
                servers,
                phases: Some(phases),
            })
            .await?;

        if self.launch.manual {
            println!(
                "Created update operation {}. Execute it with 'opsctl plan execute' or 'opsctl plan resume'",
                operation.id
            );
            return Ok(());
        }
        drive(app, &operation, self.launch.block).await?;
        Ok(())
    }
}

impl RollbackCommand {
    pub async fn execute(&self, app: &App) -> anyhow::Result<()> {
        let resolved = app.resolve(self.operation_id.as_deref()).await?;
        let params = PhaseParams {
            phase_id: ROOT_PHASE.to_string(),
            force: self.force,
            timeout: self.timeout,
        };
        app.dispatcher
            .rollback_phase(&app.ctx, &resolved.operation, &params)
            .await?;
        let cause = OpsError::Cancelled("operation rolled back".to_string());
        let operation = app.dispatcher.complete(&resolved.operation, Some(&cause)).await?;
        println!("{} Rolled back operation {}", "✓".green(), operation.id);
        Ok(())
    }
}

impl GcCommand {
    pub async fn execute(&self, app: &App) -> anyhow::Result<()> {
        if let Some(phase) = &self.phase {
            let resolved = app.resolve(self.operation_id.as_deref()).await?;
            if resolved.operation.kind != OperationType::GarbageCollect {
                return Err(OpsError::bad_parameter(format!(
                    "operation {} is not a garbage collection",
                    resolved.operation.id
                ))
                .into());
            }
            let params = PhaseParams {
                phase_id: phase.clone(),
                force: self.force,
                timeout: None,
            };
            app.dispatcher
                .execute_phase(&app.ctx, &resolved.operation, &params)
                .await?;
            println!("{} Executed phase {}", "✓".green(), phase);
            return Ok(());
        }

        app.resolver.ensure_no_active(&app.config.cluster_name).await?;
        let (operation, _) = app
            .dispatcher
            .create_operation(CreateOperation {
                kind: OperationType::GarbageCollect,
                cluster_name: app.config.cluster_name.clone(),
                servers: app.config.servers.clone(),
                phases: None,
            })
            .await?;
        if self.launch.manual {
            println!("Created garbage collection operation {}", operation.id);
            return Ok(());
        }
        drive(app, &operation, self.launch.block).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::AppConfig;
    use crate::domain::dispatcher::{EnvironmentFactory, MemoryEnvironmentFactory};
    use crate::shared::context::OpContext;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Parser, Debug)]
    struct Harness {
        #[command(flatten)]
        phase: PhaseArgs,
        #[command(flatten)]
        launch: LaunchArgs,
    }

    #[test]
    fn test_phase_flags() {
        let args = Harness::parse_from([
            "opsctl",
            "--phase",
            "/masters/m1",
            "--force",
            "--timeout",
            "5m",
            "--block=false",
        ]);
        assert_eq!(args.phase.phase, "/masters/m1");
        assert!(args.phase.force);
        assert_eq!(args.phase.timeout, Some(Duration::from_secs(300)));
        assert!(!args.launch.block);
        assert!(!args.launch.manual);

        let defaults = Harness::parse_from(["opsctl"]);
        assert_eq!(defaults.phase.phase, ROOT_PHASE);
        assert!(defaults.launch.block);
    }

    async fn memory_app() -> App {
        let factory: Arc<dyn EnvironmentFactory> = Arc::new(MemoryEnvironmentFactory::default());
        App::with_factory(AppConfig::default(), None, OpContext::default(), factory)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_follow_stops_once_operation_finishes() {
        let app = memory_app().await;
        let (operation, _) = app
            .dispatcher
            .create_operation(CreateOperation {
                kind: OperationType::Update,
                cluster_name: app.config.cluster_name.clone(),
                servers: vec![],
                phases: Some(vec![Phase::new("/init", "Init").with_executor("noop")]),
            })
            .await
            .unwrap();

        let display = DisplayCommand {
            operation_id: None,
            format: OutputFormat::Short,
            follow: true,
        };
        let finishing = AtomicBool::new(false);
        let mut renders = Vec::new();
        let watch = display.watch(&app, Duration::from_millis(10), |rendered| {
            renders.push((finishing.load(Ordering::SeqCst), rendered));
        });
        let finish = async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            finishing.store(true, Ordering::SeqCst);
            app.dispatcher.complete(&operation, None).await.unwrap();
        };

        let (watched, ()) = tokio::join!(tokio::time::timeout(Duration::from_secs(5), watch), finish);
        watched.expect("follow kept running after the operation finished").unwrap();

        assert!(renders.len() >= 2, "{} renders", renders.len());
        assert!(renders.iter().all(|(_, rendered)| rendered.contains("/init")));
        assert!(renders.last().is_some_and(|(after_finish, _)| *after_finish));
    }

    #[tokio::test]
    async fn test_display_without_follow_renders_once() {
        let app = memory_app().await;
        app.dispatcher
            .create_operation(CreateOperation {
                kind: OperationType::Update,
                cluster_name: app.config.cluster_name.clone(),
                servers: vec![],
                phases: Some(vec![Phase::new("/init", "Init").with_executor("noop")]),
            })
            .await
            .unwrap();

        let display = DisplayCommand {
            operation_id: None,
            format: OutputFormat::Json,
            follow: false,
        };
        let mut renders = Vec::new();
        display
            .watch(&app, Duration::from_millis(10), |rendered| renders.push(rendered))
            .await
            .unwrap();
        assert_eq!(renders.len(), 1);
    }

    #[test]
    fn test_background_resume_command_line() {
        let command = resume_command(
            Path::new("/usr/bin/opsctl"),
            Some(Path::new("/etc/opsctl/custom.toml")),
            "op-42",
        );
        let std_command = command.as_std();
        assert_eq!(std_command.get_program(), "/usr/bin/opsctl");
        let args: Vec<&std::ffi::OsStr> = std_command.get_args().collect();
        assert_eq!(
            args,
            [
                "--config",
                "/etc/opsctl/custom.toml",
                "plan",
                "resume",
                "--block=true",
                "--operation-id",
                "op-42"
            ]
        );

        let without_config = resume_command(Path::new("opsctl"), None, "op-42");
        assert_eq!(without_config.as_std().get_args().next().unwrap(), "plan");
    }
}
