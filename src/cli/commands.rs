// CLI command definitions

use super::agent::{BootstrapCommand, ServeCommand, StatusCommand};
use super::app::App;
use super::ops::{
    CompleteCommand, DisplayCommand, ExecuteCommand, GcCommand, InitCommand, ListCommand, ResumeCommand,
    RollbackCommand, RollbackPhaseCommand, SetCommand, UpgradeCommand,
};
use clap::Parser;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "opsctl",
    version,
    about = "Cluster lifecycle operations driven by resumable phase plans",
    long_about = "Creates, executes, resumes and rolls back cluster operations (install, expand, update, \
                  garbage collection, ...) whose progress is tracked as a persisted tree of phases"
)]
pub struct CliArgs {
    /// Path to opsctl.toml. Defaults to $OPSCTL_CONFIG, then /etc/opsctl/opsctl.toml
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Inspect and drive an operation plan
    #[command(subcommand)]
    Plan(PlanCommands),

    /// Start a cluster update to a newer runtime package
    Upgrade(UpgradeCommand),

    /// Roll back every phase of an operation and mark it failed
    Rollback(RollbackCommand),

    /// Start a garbage collection, or execute one of its phases
    Gc(GcCommand),

    /// Run or check node agents
    #[command(subcommand)]
    Agent(AgentCommands),
}

#[derive(clap::Subcommand, Debug)]
pub enum PlanCommands {
    /// Show the plan of an operation
    Display(DisplayCommand),

    /// List known operations
    List(ListCommand),

    /// Create an operation and its plan without running it
    Init(InitCommand),

    /// Execute one phase, or the whole plan
    Execute(ExecuteCommand),

    /// Roll back one phase, or every completed phase
    Rollback(RollbackPhaseCommand),

    /// Continue an operation from where it stopped
    Resume(ResumeCommand),

    /// Mark an operation finished
    Complete(CompleteCommand),

    /// Overwrite the recorded state of a phase
    Set(SetCommand),
}

#[derive(clap::Subcommand, Debug)]
pub enum AgentCommands {
    /// Serve phase requests on this node
    Serve(ServeCommand),

    /// Generate the token agents and the CLI authenticate with
    Bootstrap(BootstrapCommand),

    /// Ping agents
    Status(StatusCommand),
}

impl Commands {
    /// Key of the handler that runs this command.
    pub fn id(&self) -> &'static str {
        match self {
            Commands::Plan(plan) => match plan {
                PlanCommands::Display(_) => "plan.display",
                PlanCommands::List(_) => "plan.list",
                PlanCommands::Init(_) => "plan.init",
                PlanCommands::Execute(_) => "plan.execute",
                PlanCommands::Rollback(_) => "plan.rollback",
                PlanCommands::Resume(_) => "plan.resume",
                PlanCommands::Complete(_) => "plan.complete",
                PlanCommands::Set(_) => "plan.set",
            },
            Commands::Upgrade(_) => "upgrade",
            Commands::Rollback(_) => "rollback",
            Commands::Gc(_) => "gc",
            Commands::Agent(agent) => match agent {
                AgentCommands::Serve(_) => "agent.serve",
                AgentCommands::Bootstrap(_) => "agent.bootstrap",
                AgentCommands::Status(_) => "agent.status",
            },
        }
    }
}

pub type Handler = Box<dyn Fn(Arc<App>, Commands) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Command ID to handler, registered once at startup.
pub struct HandlerTable {
    handlers: HashMap<&'static str, Handler>,
}

/// Registers a handler that unpacks its command variant and runs it.
macro_rules! route {
    ($table:ident, $id:literal, $variant:pat => $cmd:ident) => {
        $table.register($id, |app: Arc<App>, command: Commands| async move {
            match command {
                $variant => $cmd.execute(&app).await,
                other => Err(anyhow::anyhow!("handler {} cannot run command {}", $id, other.id())),
            }
        });
    };
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        let mut table = Self {
            handlers: HashMap::new(),
        };
        route!(table, "plan.display", Commands::Plan(PlanCommands::Display(cmd)) => cmd);
        route!(table, "plan.list", Commands::Plan(PlanCommands::List(cmd)) => cmd);
        route!(table, "plan.init", Commands::Plan(PlanCommands::Init(cmd)) => cmd);
        route!(table, "plan.execute", Commands::Plan(PlanCommands::Execute(cmd)) => cmd);
        route!(table, "plan.rollback", Commands::Plan(PlanCommands::Rollback(cmd)) => cmd);
        route!(table, "plan.resume", Commands::Plan(PlanCommands::Resume(cmd)) => cmd);
        route!(table, "plan.complete", Commands::Plan(PlanCommands::Complete(cmd)) => cmd);
        route!(table, "plan.set", Commands::Plan(PlanCommands::Set(cmd)) => cmd);
        route!(table, "upgrade", Commands::Upgrade(cmd) => cmd);
        route!(table, "rollback", Commands::Rollback(cmd) => cmd);
        route!(table, "gc", Commands::Gc(cmd) => cmd);
        route!(table, "agent.serve", Commands::Agent(AgentCommands::Serve(cmd)) => cmd);
        route!(table, "agent.bootstrap", Commands::Agent(AgentCommands::Bootstrap(cmd)) => cmd);
        route!(table, "agent.status", Commands::Agent(AgentCommands::Status(cmd)) => cmd);
        table
    }

    pub fn register<F, Fut>(&mut self, id: &'static str, handler: F)
    where
        F: Fn(Arc<App>, Commands) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers
            .insert(id, Box::new(move |app, command| Box::pin(handler(app, command))));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    pub async fn dispatch(&self, app: Arc<App>, command: Commands) -> anyhow::Result<()> {
        let id = command.id();
        let handler = self
            .handlers
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("no handler registered for command {}", id))?;
        handler(app, command).await
    }
}
