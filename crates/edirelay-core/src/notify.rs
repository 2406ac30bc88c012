// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error notifications.

use std::fmt::Write;

use async_trait::async_trait;
use chrono::Utc;
use tracing::error;

use crate::persistence::{FileReportRecord, ReportRecord, TaRecord};

/// Delivers error reports to an operator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        error!(subject, "{body}");
        Ok(())
    }
}

/// Subject and body of a run report.
///
/// `files` are the reports of files that did not end `done`; `processes` are
/// the failed process rows of the run.
pub fn render_report(
    report: &ReportRecord,
    files: &[FileReportRecord],
    processes: &[TaRecord],
) -> (String, String) {
    let mut subject = format!("[edirelay error report] {}", report.ts.format("%Y-%m-%d %H:%M"));
    let mut body = String::new();
    let _ = writeln!(
        body,
        "Report; type: {}, time: {}, duration: {}s",
        report.command,
        report.ts.format("%Y-%m-%d %H:%M:%S"),
        (Utc::now() - report.ts).num_seconds()
    );
    let _ = writeln!(body, "    {} files received/processed in run.", report.last_received);
    if report.last_done > 0 {
        let _ = writeln!(body, "    {} files without errors,", report.last_done);
    }
    if report.last_error > 0 {
        let _ = write!(subject, "; {} file errors", report.last_error);
        let _ = writeln!(body, "    {} files with errors,", report.last_error);
    }
    if report.last_ok > 0 {
        let _ = write!(subject, "; {} files stuck", report.last_ok);
        let _ = writeln!(body, "    {} files got stuck,", report.last_ok);
    }
    if report.last_open > 0 {
        let _ = write!(subject, "; {} system errors", report.last_open);
        let _ = writeln!(body, "    {} system errors,", report.last_open);
    }
    if report.process_errors > 0 {
        let _ = write!(subject, "; {} process errors", report.process_errors);
        let _ = writeln!(body, "    {} errors in processes.", report.process_errors);
    }
    let _ = writeln!(body, "    {} files sent in run.", report.sent);

    for process in processes {
        let _ = writeln!(
            body,
            "\nProcess error:\nroute: {}\nfrom_channel: {}\nto_channel: {}\nerror: {}",
            process.route, process.from_channel, process.to_channel, process.error_text
        );
    }
    for file in files {
        let _ = writeln!(
            body,
            "\nFile error:\nroute: {}\nfrom_partner: {}\nfrom_channel: {}\nto_partner: {}\nto_channel: {}\nin_filename: {}\nerror: {}",
            file.route,
            file.from_partner,
            file.from_channel,
            file.to_partner,
            file.to_channel,
            file.in_filename,
            file.error_text
        );
    }
    (subject, body)
}
