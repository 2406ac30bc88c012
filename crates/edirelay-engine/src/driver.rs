// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One engine invocation: startup checks, the requested run commands and
//! the retention cleanup.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use edirelay_core::catalog::CatalogFile;
use edirelay_core::commands::execute;
use edirelay_core::hooks::hook_error;
use edirelay_core::maintenance::{CleanupStats, cleanup, cleanup_due};
use edirelay_core::persistence::CatalogStore;
use edirelay_core::runtime::EngineBuilder;
use edirelay_core::{Command, Config, Engine, RunVerdict, SqliteLedgerStore};

use crate::cli::Cli;
use crate::error::DriverError;
use crate::lock::{LivenessLock, MarkerState, RunMarker};

/// Environment file read from the configuration directory.
pub const ENV_FILE: &str = "edirelay.env";
/// Catalog file upserted at startup when present.
pub const CATALOG_FILE: &str = "catalog.json";

/// Load `<config-dir>/edirelay.env` into the environment, then parse it.
pub fn load_config(config_dir: &Path) -> Result<Config, DriverError> {
    let env_file = config_dir.join(ENV_FILE);
    match dotenvy::from_path(&env_file) {
        Ok(()) => info!(path = %env_file.display(), "Environment file loaded"),
        Err(err) if err.not_found() => {
            debug!(path = %env_file.display(), "No environment file")
        }
        Err(err) => warn!(path = %env_file.display(), error = %err, "Environment file not loaded"),
    }
    Ok(Config::from_env()?)
}

/// What an invocation did.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub verdicts: Vec<(Command, RunVerdict)>,
    pub cleanup: Option<CleanupStats>,
}

impl RunSummary {
    pub fn has_errors(&self) -> bool {
        self.verdicts.iter().any(|(_, verdict)| verdict.has_errors())
    }

    /// 2 when any run reported errors, 0 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.has_errors() { 2 } else { 0 }
    }
}

/// A started engine: both single-instance guards are held.
pub struct Driver {
    cli: Cli,
    engine: Engine,
    marker: RunMarker,
    crashed: bool,
    _liveness: LivenessLock,
}

impl Driver {
    /// Take the liveness port, open the ledger, load the catalog file and
    /// set the crash marker.
    pub async fn start(cli: Cli, config: Config, command_line: String) -> Result<Self, DriverError> {
        Self::start_with(cli, config, command_line, |builder| builder).await
    }

    /// Like [`Driver::start`], with `customize` adding scripts, channel
    /// drivers or translators to the engine.
    pub async fn start_with(
        cli: Cli,
        config: Config,
        command_line: String,
        customize: impl FnOnce(EngineBuilder) -> EngineBuilder,
    ) -> Result<Self, DriverError> {
        let liveness = LivenessLock::acquire(config.port).await?;

        let store = Arc::new(SqliteLedgerStore::connect(&config.database_url).await?);
        info!("Ledger database ready");

        let catalog_file = cli.config_dir.join(CATALOG_FILE);
        if catalog_file.exists() {
            let catalog = CatalogFile::from_path(&catalog_file)?;
            store.upsert_catalog(&catalog).await?;
            info!(
                path = %catalog_file.display(),
                channels = catalog.channels.len(),
                routes = catalog.routes.len(),
                "Catalog file loaded"
            );
        }

        let builder = Engine::builder(config)
            .store(store.clone())
            .command_line(command_line);
        let engine = customize(builder).build()?;
        let (marker, state) = RunMarker::acquire(store).await?;
        let crashed = state == MarkerState::Crashed;
        if crashed {
            let body = "The previous engine run ended unexpectedly. \
                        Crash recovery runs before the requested commands.";
            if let Err(err) = engine
                .notifier()
                .notify("[edirelay severe error] previous run crashed", body)
                .await
            {
                warn!(error = %err, "Cannot send crash notification");
            }
        }

        Ok(Self {
            cli,
            engine,
            marker,
            crashed,
            _liveness: liveness,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Whether crash recovery runs first.
    pub fn crashed(&self) -> bool {
        self.crashed
    }

    /// Run the commands and the cleanup, then release the crash marker.
    ///
    /// The marker is released even when a command fails.
    pub async fn run(self) -> Result<RunSummary, DriverError> {
        let result = self.run_commands().await;
        let released = self.marker.release().await;
        let summary = result?;
        released?;
        Ok(summary)
    }

    async fn run_commands(&self) -> Result<RunSummary, DriverError> {
        let engine = &self.engine;
        let script = engine.engine_script();
        let commands = self.cli.commands(self.crashed);
        let mut summary = RunSummary::default();

        if let Some(script) = script {
            script
                .pre(engine, &commands)
                .await
                .map_err(|e| hook_error("pre", e))?;
        }
        for &command in &commands {
            info!(%command, routes = ?self.cli.routes, "Run");
            if let Some(script) = script {
                script
                    .pre_command(engine, command, &self.cli.routes)
                    .await
                    .map_err(|e| hook_error(format!("pre_{command}"), e))?;
            }
            let verdict = execute(engine, command, &self.cli.routes).await?;
            if let Some(report) = verdict.report() {
                info!(
                    %command,
                    received = report.last_received,
                    done = report.last_done,
                    errors = report.last_error,
                    stuck = report.last_ok,
                    process_errors = report.process_errors,
                    "Run finished"
                );
            }
            if let Some(script) = script {
                script
                    .post_command(engine, command, &verdict)
                    .await
                    .map_err(|e| hook_error(format!("post_{command}"), e))?;
            }
            summary.verdicts.push((command, verdict));
        }
        if let Some(script) = script {
            script
                .post(engine, &commands)
                .await
                .map_err(|e| hook_error("post", e))?;
        }

        let now = Utc::now();
        if self.cli.cleanup || cleanup_due(engine, now).await? {
            summary.cleanup = Some(cleanup(engine, now).await?);
        }
        Ok(summary)
    }
}

/// Full invocation: configuration, startup, commands.
pub async fn run(cli: Cli, command_line: String) -> Result<RunSummary, DriverError> {
    let config = load_config(&cli.config_dir).inspect_err(|err| {
        error!(error = %err, "Configuration error");
    })?;
    info!(
        database = %config.database_url,
        data_dir = %config.data_dir.display(),
        port = config.port,
        "Configuration loaded"
    );
    Driver::start(cli, config, command_line).await?.run().await
}
