//! Node agent commands

use super::app::App;
use super::display::StatusIcon;
use crate::infrastructure::agent::{AgentRunner, AgentServer, Credentials, HookRunner, TcpConnector};
use crate::shared::error::OpsError;
use crate::shared::logging;
use clap::Parser;
use colored::Colorize;
use std::sync::Arc;

#[derive(Parser, Debug)]
pub struct ServeCommand {
    /// Listen address. Defaults to agent.listen_addr:agent.port
    #[arg(long)]
    pub listen: Option<String>,
}

#[derive(Parser, Debug)]
pub struct BootstrapCommand {
    /// Replace an existing token
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Parser, Debug)]
pub struct StatusCommand {
    /// Agent addresses to check. Defaults to every configured server
    #[arg(long = "node")]
    pub nodes: Vec<String>,
}

impl ServeCommand {
    pub async fn execute(&self, app: &App) -> anyhow::Result<()> {
        let conf = &app.config.agent;
        let credentials = Credentials::load(&conf.secrets_dir)?;
        let hooks = HookRunner::new(&conf.hooks_dir, logging::component("hooks"));
        let server = AgentServer::new(
            &app.config.node.hostname,
            credentials,
            hooks,
            logging::component("agent"),
        );

        let addr = self.listen.clone().unwrap_or_else(|| conf.listen_endpoint());
        let listener = AgentServer::bind(&addr).await?;
        println!("Agent for {} listening on {}", app.config.node.hostname, addr);
        server.serve(listener, app.ctx.token().clone()).await?;
        Ok(())
    }
}

impl BootstrapCommand {
    pub async fn execute(&self, app: &App) -> anyhow::Result<()> {
        let dir = &app.config.agent.secrets_dir;
        Credentials::bootstrap(dir, self.overwrite)?;
        println!(
            "{} Agent token written to {}. Copy it to every node before starting agents",
            StatusIcon::SUCCESS.green(),
            Credentials::token_path(dir).display()
        );
        Ok(())
    }
}

impl StatusCommand {
    pub async fn execute(&self, app: &App) -> anyhow::Result<()> {
        let conf = &app.config.agent;
        let credentials = Credentials::load(&conf.secrets_dir)?;
        let runner = AgentRunner::new(
            Arc::new(TcpConnector::new(conf.port, conf.connect_timeout)),
            credentials,
            app.config.agent_retry(),
            logging::component("agent-runner"),
        );

        let nodes: Vec<String> = if self.nodes.is_empty() {
            app.config.servers.iter().map(|s| s.advertise_addr.clone()).collect()
        } else {
            self.nodes.clone()
        };
        if nodes.is_empty() {
            return Err(OpsError::bad_parameter("no servers configured; pass --node").into());
        }

        let mut errors = Vec::new();
        for node in &nodes {
            match runner.status(node).await {
                Ok(hostname) => println!("{} {} ({})", StatusIcon::SUCCESS.green(), node, hostname),
                Err(e) => {
                    println!("{} {}: {}", StatusIcon::ERROR.red(), node, e);
                    errors.push(e);
                }
            }
        }
        OpsError::aggregate(errors)?;
        Ok(())
    }
}
