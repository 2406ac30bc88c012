// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run commands.
//!
//! Every command follows the same shape: open a root process row for the
//! run, prepare (re-inject rows to resend, clean up after a crash, ...),
//! dispatch the routes, close the root and evaluate what happened to every
//! file received in the run.

use tracing::{info, warn};

use crate::error::EngineError;
use crate::ledger::Ledger;
use crate::persistence::{Outcome, ReportRecord, Stage, TaChanges, TaFilter, TaRecord};
use crate::process::{ProcessCtx, finish_process, start_process};
use crate::router::run_routes;
use crate::runtime::Engine;
use crate::tracer::evaluate_run;

/// Counter holding the last ledger id seen by automatic retry.
pub const RETRY_COUNTER: &str = "automaticretrycommunication";

/// A top-level run command.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Command {
    New,
    CrashRecovery,
    Resend,
    Rereceive,
    AutomaticRetryCommunication,
}

/// Result of a run command.
#[derive(Debug, Clone, PartialEq)]
pub enum RunVerdict {
    /// Nothing qualified; no routes ran and no report was written.
    NothingToDo,
    Evaluated(ReportRecord),
}

impl RunVerdict {
    pub fn report(&self) -> Option<&ReportRecord> {
        match self {
            RunVerdict::NothingToDo => None,
            RunVerdict::Evaluated(report) => Some(report),
        }
    }

    /// Whether the run left errors, stuck or open files or process errors.
    pub fn has_errors(&self) -> bool {
        self.report().is_some_and(|r| r.status)
    }
}

/// Execute `command` for `routes`, or for the command's default routes when
/// `routes` is empty.
pub async fn execute(
    engine: &Engine,
    command: Command,
    routes: &[String],
) -> Result<RunVerdict, EngineError> {
    let ledger = engine.ledger();
    let run = start_process(ledger, &ProcessCtx::root(), command.as_ref()).await?;
    let root = run.process();
    info!(%command, run = root, "Run started");

    let scope = match prepare(engine, &run, command).await {
        Ok(Some(scope)) => scope,
        Ok(None) => {
            info!(%command, "Nothing to do");
            ledger.delete(root).await?;
            return Ok(RunVerdict::NothingToDo);
        }
        Err(err) => {
            finish_process(ledger, &run, Some(&err)).await?;
            return Err(err);
        }
    };

    let routes = if routes.is_empty() {
        engine
            .catalog()
            .route_names(command == Command::New)
            .await?
    } else {
        routes.to_vec()
    };
    let dispatched = run_routes(engine, &run, command, &routes, scope).await;
    finish_process(ledger, &run, dispatched.as_ref().err()).await?;
    dispatched?;

    let report = evaluate_run(engine, command, scope).await?;
    Ok(RunVerdict::Evaluated(report))
}

/// Returns the id above which rows belong to this run, or `None` when the
/// command has nothing to do.
async fn prepare(
    engine: &Engine,
    run: &ProcessCtx,
    command: Command,
) -> Result<Option<i64>, EngineError> {
    let root = run.process();
    let ledger = engine.ledger();
    let scope = match command {
        Command::New => Some(root),
        Command::CrashRecovery => recover_crashed_run(engine, root).await?,
        Command::Resend => (resend(ledger, run).await? > 0).then_some(root),
        Command::Rereceive => (rereceive(engine, run).await? > 0).then_some(root),
        Command::AutomaticRetryCommunication => {
            (retry_communication(engine, run).await? > 0).then_some(root)
        }
    };
    Ok(scope)
}

/// Clean up after the run that held the crash marker.
///
/// The highest top-level process below `root` is the crashed run and its id
/// becomes the scope, whether or not the run got as far as closing its root.
/// Its report and file reports are dropped so the run is evaluated again.
/// Process rows of the crashed run left open at any depth are closed as
/// done; process rows that recorded an error keep it. Returns `None` when no
/// earlier run exists.
async fn recover_crashed_run(engine: &Engine, root: i64) -> Result<Option<i64>, EngineError> {
    let ledger = engine.ledger();
    let store = ledger.store();
    let runs = ledger
        .select(&TaFilter {
            process: Some(0),
            ..TaFilter::stage(Stage::Process).below(root)
        })
        .await?;
    let Some(crashed) = runs.iter().max_by_key(|r| r.id) else {
        warn!("No earlier run found to recover");
        return Ok(None);
    };
    let scope = crashed.id;
    info!(crashed = scope, command = %crashed.filename, "Recovering crashed run");

    let closed = ledger
        .update_where(
            &TaFilter {
                id_from: Some(scope),
                id_below: Some(root),
                ..TaFilter::stage(Stage::Process).with_outcome(Outcome::Open)
            },
            &TaChanges::outcome(Outcome::Done),
        )
        .await?;
    store.delete_report(scope).await?;
    store.delete_file_reports_above(scope).await?;

    let pipeline = |outcomes: &[Outcome]| TaFilter {
        not_stage: Some(Stage::Process),
        outcomes: outcomes.to_vec(),
        id_above: Some(scope),
        ..Default::default()
    };

    // Merge targets hanging below rows that never got consumed.
    let mut removed = 0;
    for row in ledger.select(&pipeline(&[Outcome::Ok])).await? {
        if row.child != 0 {
            removed += ledger.delete_descendants(row.child).await?;
            removed += ledger.delete(row.child).await?;
        }
    }
    let terminal = TaFilter {
        has_child: Some(false),
        ..pipeline(&[Outcome::Ok, Outcome::Error])
    };
    for row in ledger.select(&terminal).await? {
        removed += ledger.delete_descendants(row.id).await?;
    }

    let interrupted = ledger
        .update_where(
            &TaFilter {
                not_stage: Some(Stage::Process),
                outcomes: vec![Outcome::Open],
                id_above: Some(scope),
                id_below: Some(root),
                ..Default::default()
            },
            &TaChanges::error("interrupted by a crash"),
        )
        .await?;
    info!(crashed = scope, closed, removed, interrupted, "Crashed run cleaned up");
    Ok(Some(scope))
}

/// Where a resend starts: the stored-outgoing row the send was made from,
/// or the row before it when that one only wrapped the content.
async fn outgoing_source(ledger: &Ledger, sent: &TaRecord) -> Result<Option<TaRecord>, EngineError> {
    if sent.parent == 0 {
        warn!(row = sent.id, "Sent row has no stored predecessor");
        return Ok(None);
    }
    let source = ledger.get(sent.parent).await?;
    if source.wrapped && source.parent != 0 {
        return Ok(Some(ledger.get(source.parent).await?));
    }
    Ok(Some(source))
}

/// Start a fresh received → stored-outgoing chain from `source`.
async fn reinject_outgoing(
    ledger: &Ledger,
    run: &ProcessCtx,
    source: &TaRecord,
    resends: i64,
) -> Result<i64, EngineError> {
    let arrival = ledger
        .reinject(run, source.id, Stage::ExternIn, None, TaChanges::outcome(Outcome::Done))
        .await?;
    let stored = ledger
        .copy_forward(
            run,
            arrival,
            Stage::FileOut,
            TaChanges {
                outcome: Some(Outcome::Ok),
                number_of_resends: Some(resends),
                ..Default::default()
            },
        )
        .await?;
    Ok(stored)
}

/// Re-inject sent files an operator flagged for retransmission.
///
/// The original sent row keeps its first `resend` mark; flagging it again
/// starts another independent chain.
async fn resend(ledger: &Ledger, run: &ProcessCtx) -> Result<usize, EngineError> {
    let flagged = ledger
        .select(&TaFilter {
            retransmit: Some(true),
            ..TaFilter::stage(Stage::ExternOut)
        })
        .await?;
    let mut resent = 0;
    for sent in &flagged {
        let changes = TaChanges {
            retransmit: Some(false),
            outcome: (sent.outcome != Outcome::Resend).then_some(Outcome::Resend),
            ..Default::default()
        };
        ledger.update(sent.id, &changes).await?;
        if let Some(source) = outgoing_source(ledger, sent).await? {
            let stored = reinject_outgoing(ledger, run, &source, sent.number_of_resends).await?;
            info!(sent = sent.id, stored, "Resending");
            resent += 1;
        }
    }
    Ok(resent)
}

/// Re-inject received files an operator flagged in the file reports.
async fn rereceive(engine: &Engine, run: &ProcessCtx) -> Result<usize, EngineError> {
    let ledger = engine.ledger();
    let store = ledger.store();
    let mut injected = 0;
    for id in store.file_reports_to_rereceive().await? {
        store.set_file_report_retransmit(id, false).await?;
        let Some(arrival) = store.get_row(id).await? else {
            warn!(row = id, "Received file no longer in the ledger");
            continue;
        };
        let stored = ledger
            .select(&TaFilter {
                parent: Some(arrival.id),
                ..TaFilter::stage(Stage::FileIn)
            })
            .await?;
        let Some(stored) = stored.first() else {
            warn!(row = id, "Received file has no stored content");
            continue;
        };
        let root = ledger
            .reinject(run, arrival.id, Stage::ExternIn, None, TaChanges::outcome(Outcome::Done))
            .await?;
        ledger
            .reinject(run, stored.id, Stage::FileIn, Some(root), TaChanges::outcome(Outcome::Ok))
            .await?;
        info!(original = id, root, "Rereceiving");
        injected += 1;
    }
    Ok(injected)
}

/// Re-inject sends that failed since the previous retry run.
///
/// The first retry run ever only records where it stands.
async fn retry_communication(engine: &Engine, run: &ProcessCtx) -> Result<usize, EngineError> {
    let ledger = engine.ledger();
    let root = run.process();
    let Some(previous) = ledger.store().swap_counter(RETRY_COUNTER, root).await? else {
        info!(run = root, "First automatic retry run, nothing resent");
        return Ok(0);
    };
    let failed = ledger
        .select(
            &TaFilter::stage(Stage::ExternOut)
                .with_outcome(Outcome::Error)
                .above(previous)
                .below(root),
        )
        .await?;
    let mut retried = 0;
    for sent in &failed {
        let changes = TaChanges {
            retransmit: Some(false),
            outcome: Some(Outcome::Resend),
            ..Default::default()
        };
        ledger.update(sent.id, &changes).await?;
        if let Some(source) = outgoing_source(ledger, sent).await? {
            reinject_outgoing(ledger, run, &source, sent.number_of_resends).await?;
            retried += 1;
        }
    }
    info!(since = previous, retried, "Automatic retry of failed sends");
    Ok(retried)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_command_names() {
        assert_eq!(Command::CrashRecovery.to_string(), "crashrecovery");
        assert_eq!(
            Command::from_str("automaticretrycommunication").unwrap(),
            Command::AutomaticRetryCommunication
        );
        assert_eq!(Command::New.as_ref(), "new");
    }

    #[test]
    fn test_verdict_errors() {
        assert!(!RunVerdict::NothingToDo.has_errors());
    }
}
