// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash recovery against a synthetically crashed ledger.

mod common;

use chrono::Utc;
use common::{TestContext, pass_through};
use edirelay_core::commands::{Command, RunVerdict, execute};
use edirelay_core::persistence::{FileReportRecord, LedgerStore, ReportRecord, TaChanges};
use edirelay_core::process::{ProcessCtx, finish_process, start_process};
use edirelay_core::storage::ContentStore;
use edirelay_core::{Outcome, Stage};

/// Record a received file the way an inbound channel does.
async fn receive(ctx: &TestContext, run: &ProcessCtx, name: &str, payload: &[u8]) -> (i64, i64) {
    let ledger = ctx.engine.ledger();
    let arrival = ledger
        .create_root(
            run,
            Stage::ExternIn,
            TaChanges {
                filename: Some(name.to_string()),
                from_channel: Some("in".to_string()),
                route: Some("orders".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let stored = ledger
        .copy_forward(run, arrival, Stage::FileIn, TaChanges::default())
        .await
        .unwrap();
    let blob = ContentStore::name_for(stored);
    ctx.engine.content().write(&blob, payload).await.unwrap();
    ledger
        .update(
            stored,
            &TaChanges {
                outcome: Some(Outcome::Ok),
                filename: Some(blob),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    ledger
        .update(arrival, &TaChanges::outcome(Outcome::Done))
        .await
        .unwrap();
    (arrival, stored)
}

fn stale_report(id: i64) -> ReportRecord {
    ReportRecord {
        id,
        last_open: 0,
        last_error: 0,
        last_ok: 0,
        last_done: 9,
        sent: 9,
        process_errors: 0,
        last_received: 9,
        status: false,
        command: "new".to_string(),
        filesize: 0,
        acceptance: false,
        command_line: String::new(),
        ts: Utc::now(),
    }
}

#[tokio::test]
async fn test_crash_recovery_cleans_up_and_resumes() {
    let ctx = TestContext::new().await;
    ctx.load(
        vec![ctx.inbound("in"), ctx.outbound("out", "counting")],
        vec![pass_through("orders", "in", "out")],
    )
    .await;
    let ledger = ctx.engine.ledger();

    // The crashed run: one file waiting for the route, one file halfway
    // through a merge whose contributor was never marked consumed.
    let crashed = start_process(ledger, &ProcessCtx::root(), "new").await.unwrap();
    let run = crashed.with_route("orders");
    let (waiting, _) = receive(&ctx, &run, "/in/a.edi", b"A").await;
    let (_, stored) = receive(&ctx, &run, "/in/b.edi", b"B").await;
    ledger
        .update(stored, &TaChanges::outcome(Outcome::Done))
        .await
        .unwrap();
    let translated = ledger
        .copy_forward(&run, stored, Stage::Translated, TaChanges::outcome(Outcome::Ok))
        .await
        .unwrap();
    let merged = ledger
        .merge(&run, &[translated], Stage::Merged, TaChanges::outcome(Outcome::Done))
        .await
        .unwrap();
    let outgoing = ledger
        .copy_forward(&run, merged, Stage::FileOut, TaChanges::outcome(Outcome::Ok))
        .await
        .unwrap();
    sqlx::query("UPDATE ta SET outcome = 2 WHERE id = ?")
        .bind(translated)
        .execute(ctx.store.pool())
        .await
        .unwrap();

    ctx.store
        .insert_report(&stale_report(crashed.process()))
        .await
        .unwrap();
    ctx.store
        .insert_file_report(&FileReportRecord {
            id: waiting,
            report_id: crashed.process(),
            ..Default::default()
        })
        .await
        .unwrap();

    let verdict = execute(&ctx.engine, Command::CrashRecovery, &[])
        .await
        .unwrap();
    let report = verdict.report().unwrap().clone();
    assert_eq!(report.id, crashed.process());
    assert_eq!(report.command, "crashrecovery");
    assert_eq!(report.last_received, 2);
    assert_eq!(report.last_done, 1);
    assert_eq!(report.last_ok, 1);
    assert_eq!(report.sent, 1);

    assert_eq!(
        ledger.get(crashed.process()).await.unwrap().outcome,
        Outcome::Done
    );
    assert!(ctx.store.get_row(merged).await.unwrap().is_none());
    assert!(ctx.store.get_row(outgoing).await.unwrap().is_none());
    assert_eq!(ledger.get(translated).await.unwrap().child, 0);
    assert_eq!(ctx.store.file_reports(report.id).await.unwrap().len(), 2);
    assert_eq!(ctx.session_count(), 1);
}

#[tokio::test]
async fn test_crash_recovery_without_crashed_run() {
    let ctx = TestContext::new().await;
    ctx.load(
        vec![ctx.inbound("in"), ctx.outbound("out", "counting")],
        vec![pass_through("orders", "in", "out")],
    )
    .await;
    execute(&ctx.engine, Command::New, &[]).await.unwrap();

    let verdict = execute(&ctx.engine, Command::CrashRecovery, &[])
        .await
        .unwrap();
    assert_eq!(verdict, RunVerdict::NothingToDo);
}

#[tokio::test]
async fn test_interrupted_rows_become_errors() {
    let ctx = TestContext::new().await;
    ctx.load(
        vec![ctx.inbound("in"), ctx.outbound("out", "counting")],
        vec![pass_through("orders", "in", "out")],
    )
    .await;
    let ledger = ctx.engine.ledger();
    let crashed = start_process(ledger, &ProcessCtx::root(), "new").await.unwrap();
    let run = crashed.with_route("orders");
    let arrival = ledger
        .create_root(&run, Stage::ExternIn, TaChanges::default())
        .await
        .unwrap();

    let verdict = execute(&ctx.engine, Command::CrashRecovery, &[])
        .await
        .unwrap();
    let row = ledger.get(arrival).await.unwrap();
    assert_eq!(row.outcome, Outcome::Error);
    assert_eq!(row.error_text, "interrupted by a crash");
    assert_eq!(verdict.report().unwrap().last_error, 1);
}

#[tokio::test]
async fn test_crash_after_closing_root_is_still_reported() {
    let ctx = TestContext::new().await;
    ctx.load(
        vec![ctx.inbound("in"), ctx.outbound("out", "counting")],
        vec![pass_through("orders", "in", "out")],
    )
    .await;
    let ledger = ctx.engine.ledger();

    // The crashed run closed its root and died while writing its report.
    let crashed = start_process(ledger, &ProcessCtx::root(), "new").await.unwrap();
    let (arrival, _) = receive(&ctx, &crashed.with_route("orders"), "/in/a.edi", b"A").await;
    finish_process(ledger, &crashed, None).await.unwrap();
    ctx.store
        .insert_file_report(&FileReportRecord {
            id: arrival,
            report_id: crashed.process(),
            ..Default::default()
        })
        .await
        .unwrap();

    let verdict = execute(&ctx.engine, Command::CrashRecovery, &[])
        .await
        .unwrap();
    let report = verdict.report().unwrap().clone();
    assert_eq!(report.id, crashed.process());
    assert_eq!(report.last_received, 1);
    assert_eq!(report.last_done, 1);
    assert!(!report.status);

    let files = ctx.store.file_reports(report.id).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].outcome, Outcome::Done.code());
    assert!(ctx.store.get_report(report.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_nested_processes_of_crashed_run_are_closed() {
    let ctx = TestContext::new().await;
    ctx.load(
        vec![ctx.inbound("in"), ctx.outbound("out", "counting")],
        vec![pass_through("orders", "in", "out")],
    )
    .await;
    let ledger = ctx.engine.ledger();

    let crashed = start_process(ledger, &ProcessCtx::root(), "new").await.unwrap();
    let route = start_process(ledger, &crashed.with_route("orders"), "route")
        .await
        .unwrap();
    let part = start_process(ledger, &route, "part 1").await.unwrap();
    let failed = start_process(ledger, &route, "communication out").await.unwrap();
    ledger
        .update(failed.process(), &TaChanges::error("connection refused"))
        .await
        .unwrap();
    receive(&ctx, &part, "/in/a.edi", b"A").await;

    let verdict = execute(&ctx.engine, Command::CrashRecovery, &[])
        .await
        .unwrap();
    let report = verdict.report().unwrap();
    assert_eq!(report.last_done, 1);
    assert_eq!(report.process_errors, 1);

    assert_eq!(ledger.get(crashed.process()).await.unwrap().outcome, Outcome::Done);
    assert_eq!(ledger.get(route.process()).await.unwrap().outcome, Outcome::Done);
    assert_eq!(ledger.get(part.process()).await.unwrap().outcome, Outcome::Done);
    assert_eq!(ledger.get(failed.process()).await.unwrap().outcome, Outcome::Error);
}

#[tokio::test]
async fn test_clean_nested_crash_is_not_an_error() {
    let ctx = TestContext::new().await;
    ctx.load(
        vec![ctx.inbound("in"), ctx.outbound("out", "counting")],
        vec![pass_through("orders", "in", "out")],
    )
    .await;
    let ledger = ctx.engine.ledger();

    let crashed = start_process(ledger, &ProcessCtx::root(), "new").await.unwrap();
    let route = start_process(ledger, &crashed.with_route("orders"), "route")
        .await
        .unwrap();
    receive(&ctx, &route, "/in/a.edi", b"A").await;

    let verdict = execute(&ctx.engine, Command::CrashRecovery, &[])
        .await
        .unwrap();
    let report = verdict.report().unwrap();
    assert_eq!(report.process_errors, 0);
    assert!(!report.status);
    assert!(!verdict.has_errors());
    assert_eq!(ledger.get(route.process()).await.unwrap().outcome, Outcome::Done);
}
