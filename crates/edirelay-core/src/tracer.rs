// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status evaluation.
//!
//! After a run every file received in it is traced: the rows derived from its
//! received-external root form a tree (split links down, merge links across),
//! which collapses into one outcome per file. The per-file results become file
//! reports and are summed into the run report.

use tracing::{error, info};

use crate::commands::Command;
use crate::error::{EngineError, TraceError};
use crate::ledger::Ledger;
use crate::notify::render_report;
use crate::persistence::{
    FileReportRecord, Outcome, ReportRecord, Stage, TaFilter, TaRecord,
};
use crate::runtime::Engine;

/// Shown in a file report field when rows of the file disagree.
pub const SEVERAL_VALUES: &str = "(several values)";

/// Rows of one received file.
///
/// Nodes are stored in discovery order, so every node comes after the node it
/// was reached from. A merge target reached from several contributors appears
/// once per contributor.
#[derive(Debug, Clone)]
pub struct FileTrace {
    nodes: Vec<TraceNode>,
}

#[derive(Debug, Clone)]
struct TraceNode {
    row: TaRecord,
    children: Vec<usize>,
}

/// Outcome a row counts as during evaluation.
fn effective(outcome: Outcome) -> Outcome {
    match outcome {
        Outcome::Resend => Outcome::Done,
        Outcome::NoRetry => Outcome::Error,
        other => other,
    }
}

impl FileTrace {
    pub async fn build(ledger: &Ledger, root: TaRecord) -> Result<Self, TraceError> {
        let mut nodes = vec![TraceNode {
            row: root,
            children: Vec::new(),
        }];
        let mut next = 0;
        while next < nodes.len() {
            for row in ledger.successors(nodes[next].row.id).await? {
                nodes.push(TraceNode {
                    row,
                    children: Vec::new(),
                });
                let child = nodes.len() - 1;
                nodes[next].children.push(child);
            }
            next += 1;
        }
        Ok(Self { nodes })
    }

    pub fn root(&self) -> &TaRecord {
        &self.nodes[0].row
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Collapse the tree into open, error, ok (stuck) or done.
    ///
    /// A done row takes the worst of its children: error over stuck over done.
    /// Stuck and failed rows must be leaves and open rows must not exist at all.
    pub fn evaluate(&self) -> Result<Outcome, TraceError> {
        let mut verdicts = vec![Outcome::Open; self.nodes.len()];
        for (index, node) in self.nodes.iter().enumerate().rev() {
            let outcome = effective(node.row.outcome);
            verdicts[index] = match outcome {
                Outcome::Done => {
                    let mut verdict = Outcome::Done;
                    for &child in &node.children {
                        match verdicts[child] {
                            Outcome::Error => {
                                verdict = Outcome::Error;
                                break;
                            }
                            Outcome::Ok => verdict = Outcome::Ok,
                            _ => {}
                        }
                    }
                    verdict
                }
                Outcome::Ok | Outcome::Error if !node.children.is_empty() => {
                    return Err(TraceError::TerminalWithChildren {
                        id: node.row.id,
                        outcome,
                        children: node.children.len(),
                    });
                }
                Outcome::Ok | Outcome::Error => outcome,
                _ => return Err(TraceError::OpenRow(node.row.id)),
            };
        }
        Ok(verdicts[0])
    }

    /// Gather the descriptive part of the file report.
    ///
    /// The first value seen for a field wins; a differing later value replaces
    /// it with [`SEVERAL_VALUES`] when `asterisk` is set.
    pub fn file_report(&self, report_id: i64, outcome: Outcome, asterisk: bool) -> FileReportRecord {
        let root = self.root();
        let mut collector = Collector {
            asterisk,
            report: FileReportRecord {
                id: root.id,
                report_id,
                outcome: outcome.code(),
                route: root.route.clone(),
                from_channel: root.from_channel.clone(),
                in_filename: root.filename.clone(),
                ts: Some(root.ts),
                ..Default::default()
            },
            parsed_size: 0,
            stored_size: 0,
            has_out_ta: false,
        };

        let mut stack = vec![0];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            collector.visit(&node.row);
            stack.extend(node.children.iter().rev());
        }
        let mut report = collector.report;
        report.filesize = if collector.parsed_size > 0 {
            collector.parsed_size
        } else {
            collector.stored_size
        };
        report
    }
}

struct Collector {
    asterisk: bool,
    report: FileReportRecord,
    parsed_size: i64,
    stored_size: i64,
    has_out_ta: bool,
}

impl Collector {
    fn merge(asterisk: bool, field: &mut String, value: &str) {
        if field.is_empty() {
            *field = value.to_string();
        } else if asterisk && field != value {
            *field = SEVERAL_VALUES.to_string();
        }
    }

    fn merge_non_empty(asterisk: bool, field: &mut String, value: &str) {
        if !value.is_empty() {
            Self::merge(asterisk, field, value);
        }
    }

    fn visit(&mut self, row: &TaRecord) {
        let asterisk = self.asterisk;
        let report = &mut self.report;
        match row.stage {
            Stage::FileIn => {
                if self.stored_size == 0 {
                    self.stored_size = row.filesize;
                }
                if report.in_contenttype.is_empty() {
                    report.from_mail = row.from_mail.clone();
                    report.to_mail = row.to_mail.clone();
                    report.in_contenttype = row.contenttype.clone();
                }
            }
            Stage::Parsed => {
                self.parsed_size += row.filesize;
                Self::merge(asterisk, &mut report.in_editype, &row.editype);
            }
            Stage::SplitUp => {
                report.nrmessages += 1;
                Self::merge(asterisk, &mut report.in_messagetype, &row.messagetype);
            }
            Stage::Translated => {
                Self::merge(asterisk, &mut report.divtext, &row.divtext);
            }
            Stage::ExternOut => {
                if report.nrmessages == 0 {
                    report.nrmessages = row.nrmessages;
                }
                if row.number_of_resends > 0 {
                    if !self.has_out_ta {
                        report.out_ta = row.id;
                        self.has_out_ta = true;
                    } else if asterisk && report.out_ta != row.id {
                        report.out_ta = 0;
                    }
                }
                Self::merge(asterisk, &mut report.out_editype, &row.editype);
                Self::merge(asterisk, &mut report.out_messagetype, &row.messagetype);
                Self::merge_non_empty(asterisk, &mut report.from_mail, &row.from_mail);
                Self::merge_non_empty(asterisk, &mut report.to_mail, &row.to_mail);
                Self::merge_non_empty(asterisk, &mut report.out_contenttype, &row.contenttype);
                Self::merge(asterisk, &mut report.out_filename, &row.filename);
                Self::merge(asterisk, &mut report.to_channel, &row.to_channel);
            }
            _ => {}
        }
        Self::merge_non_empty(asterisk, &mut report.from_partner, &row.from_partner);
        Self::merge_non_empty(asterisk, &mut report.to_partner, &row.to_partner);
        if !row.error_text.is_empty() {
            report.error_text.push_str(&row.error_text);
            report.error_text.push('\n');
        }
    }
}

/// Per-outcome file counts of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub open: i64,
    pub error: i64,
    pub ok: i64,
    pub done: i64,
}

impl OutcomeCounts {
    fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Error => self.error += 1,
            Outcome::Ok => self.ok += 1,
            Outcome::Done => self.done += 1,
            _ => self.open += 1,
        }
    }

    pub fn total(&self) -> i64 {
        self.open + self.error + self.ok + self.done
    }
}

/// Trace every file received above `root`, write file reports and the run
/// report, and notify when the run needs attention.
///
/// A tree that violates the ledger invariants counts as open and always
/// triggers a notification.
pub async fn evaluate_run(
    engine: &Engine,
    command: Command,
    root: i64,
) -> Result<ReportRecord, EngineError> {
    let ledger = engine.ledger();
    let store = ledger.store();
    let config = engine.config();

    let mut counts = OutcomeCounts::default();
    let mut filesize = 0;
    let mut structural = 0;
    for file in ledger.select(&TaFilter::stage(Stage::ExternIn).above(root)).await? {
        let file_id = file.id;
        let trace = FileTrace::build(ledger, file).await?;
        let outcome = match trace.evaluate() {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(file = file_id, error = %err, "Ledger tree of received file is inconsistent");
                structural += 1;
                Outcome::Open
            }
        };
        counts.add(outcome);
        let report = trace.file_report(root, outcome, config.multiple_values_asterisk);
        filesize += report.filesize;
        store.insert_file_report(&report).await?;
    }

    let sent = ledger
        .count(&TaFilter::stage(Stage::ExternOut).with_outcome(Outcome::Done).above(root))
        .await?;
    let process_filter = TaFilter {
        id_from: Some(root),
        ..TaFilter::stage(Stage::Process).with_outcome(Outcome::Error)
    };
    let process_errors = ledger.count(&process_filter).await?;
    let root_row = ledger.get(root).await?;
    let last_received = counts.total();

    let report = ReportRecord {
        id: root,
        last_open: counts.open,
        last_error: counts.error,
        last_ok: counts.ok,
        last_done: counts.done,
        sent,
        process_errors,
        last_received,
        status: counts.ok + counts.open + counts.error + process_errors > 0,
        command: command.to_string(),
        filesize,
        acceptance: config.acceptance_test,
        command_line: engine.command_line().to_string(),
        ts: root_row.ts,
    };
    store.insert_report(&report).await?;
    info!(
        run = root,
        %command,
        received = last_received,
        done = counts.done,
        errors = counts.error,
        stuck = counts.ok,
        open = counts.open,
        process_errors,
        sent,
        "Run evaluated"
    );

    let problems = counts.error + counts.ok + counts.open > 0
        || (process_errors > 0 && config.report_on_process_error);
    if structural > 0 || (problems && config.send_report_if_error) {
        let files: Vec<_> = store
            .file_reports(root)
            .await?
            .into_iter()
            .filter(|f| f.outcome != Outcome::Done.code())
            .collect();
        let processes = ledger.select(&process_filter).await?;
        let (subject, body) = render_report(&report, &files, &processes);
        if let Err(err) = engine.notifier().notify(&subject, &body).await {
            error!(run = root, error = %err, "Sending error report failed");
        }
    }

    if command == Command::New && last_received == 0 && process_errors == 0 {
        let filter = TaFilter {
            id_from: Some(root),
            ..Default::default()
        };
        store.delete_rows(&filter).await?;
    }
    Ok(report)
}
