// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process markers.
//!
//! Every named operation of a run (the run itself, each route, each route
//! part, each channel session) writes a process row. Rows created while the
//! operation runs are tagged with that row's id through the [`ProcessCtx`]
//! handed down the call chain.

use std::future::Future;

use tracing::error;

use crate::error::{EngineError, LedgerError};
use crate::ledger::Ledger;
use crate::persistence::{Outcome, Stage, TaChanges};

/// The enclosing process of the code currently running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessCtx {
    process: i64,
    route: String,
}

impl ProcessCtx {
    /// Context outside any process: rows created here are run roots.
    pub fn root() -> Self {
        Self::default()
    }

    /// Id of the enclosing process row, 0 at the top.
    pub fn process(&self) -> i64 {
        self.process
    }

    /// Route being executed, empty outside routes.
    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn with_route(&self, route: impl Into<String>) -> Self {
        Self {
            process: self.process,
            route: route.into(),
        }
    }

    fn enter(&self, process: i64) -> Self {
        Self {
            process,
            route: self.route.clone(),
        }
    }
}

fn marker(ctx: &ProcessCtx, name: &str) -> TaChanges {
    TaChanges {
        filename: Some(name.to_string()),
        route: Some(ctx.route().to_string()),
        ..Default::default()
    }
}

/// Create an open process row and return the context that tags rows with it.
///
/// The caller must finish the process with [`finish_process`].
pub async fn start_process(
    ledger: &Ledger,
    ctx: &ProcessCtx,
    name: &str,
) -> Result<ProcessCtx, LedgerError> {
    let id = ledger
        .create_root(ctx, Stage::Process, marker(ctx, name))
        .await?;
    Ok(ctx.enter(id))
}

/// Close a process row opened by [`start_process`].
pub async fn finish_process(
    ledger: &Ledger,
    ctx: &ProcessCtx,
    failure: Option<&EngineError>,
) -> Result<(), LedgerError> {
    let changes = match failure {
        Some(err) => TaChanges::error(err.to_string()),
        None => TaChanges::outcome(Outcome::Done),
    };
    ledger.update(ctx.process(), &changes).await?;
    Ok(())
}

/// Run `op` as a logged process.
///
/// A failure of `op` is recorded on the process row and logged; it does not
/// propagate. Returns `None` in that case. Only failures to write the process
/// row itself are returned as errors.
pub async fn run_as_process<T, F, Fut>(
    ledger: &Ledger,
    ctx: &ProcessCtx,
    name: &str,
    op: F,
) -> Result<Option<T>, LedgerError>
where
    F: FnOnce(ProcessCtx) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let inner = start_process(ledger, ctx, name).await?;
    match op(inner.clone()).await {
        Ok(value) => {
            finish_process(ledger, &inner, None).await?;
            Ok(Some(value))
        }
        Err(err) => {
            error!(
                process = inner.process(),
                name,
                route = ctx.route(),
                code = err.error_code(),
                error = %err,
                "Process failed"
            );
            finish_process(ledger, &inner, Some(&err)).await?;
            Ok(None)
        }
    }
}

/// Record a failure that has no ledger row of its own, e.g. a channel that
/// cannot be reached.
pub async fn record_process_error(
    ledger: &Ledger,
    ctx: &ProcessCtx,
    name: &str,
    channel: &str,
    text: &str,
) -> Result<i64, LedgerError> {
    let fields = TaChanges {
        outcome: Some(Outcome::Error),
        from_channel: Some(channel.to_string()),
        error_text: Some(text.to_string()),
        ..marker(ctx, name)
    };
    ledger.create_root(ctx, Stage::Process, fields).await
}
