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

use clap::Parser;
use colored::Colorize;
use opsctl::cli::{App, CliArgs, HandlerTable};
use opsctl::domain::config::AppConfig;
use opsctl::shared::error::EXIT_CODE_PANIC;
use opsctl::shared::{logging, OpContext, OpsError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    // Run in a task so a panic surfaces as a JoinError instead of unwinding
    // through main.
    let code = match tokio::spawn(run(args)).await {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            eprintln!("{} {:#}", "✗".red(), e);
            exit_code(&e)
        }
        Err(e) => {
            eprintln!("{} opsctl crashed: {}", "✗".red(), e);
            EXIT_CODE_PANIC
        }
    };
    std::process::exit(code);
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    let config = AppConfig::load(args.config.as_deref())?;
    logging::init(&config.logging, args.debug)?;

    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    let app = Arc::new(App::new(config, args.config.clone(), OpContext::new(cancel)).await?);
    HandlerTable::new().dispatch(app, args.command).await
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<OpsError>()
        .map(OpsError::exit_code)
        .unwrap_or(1)
}

/// Cancels `cancel` on SIGINT or SIGTERM so running phases can record
/// their interruption.
async fn watch_signals(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    warn!("termination signal received, cancelling");
    cancel.cancel();
}
