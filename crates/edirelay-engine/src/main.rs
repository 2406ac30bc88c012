// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edirelay engine
//!
//! Exit codes:
//! - 0: all runs finished without errors
//! - 1: startup or system error
//! - 2: a run reported errors, stuck files or process errors
//! - 3: another engine instance is running

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use edirelay_engine::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edirelay=info".into()),
        )
        .init();

    let command_line = std::env::args().collect::<Vec<_>>().join(" ");
    let cli = Cli::parse();
    info!(%command_line, "Starting edirelay engine");

    match edirelay_engine::run(cli, command_line).await {
        Ok(summary) => {
            let code = summary.exit_code();
            info!(code, "Engine finished");
            ExitCode::from(code)
        }
        Err(err) => {
            error!(error = %err, code = err.exit_code(), "Engine stopped");
            ExitCode::from(err.exit_code())
        }
    }
}
