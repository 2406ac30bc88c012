// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for edirelay-core.
//!
//! This module defines the ledger record types, the filter/change vocabulary
//! used to address rows, and the storage traits. [`SqliteLedgerStore`]
//! implements both traits over one SQLite pool.

pub mod sqlite;

pub use self::sqlite::SqliteLedgerStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogFile, Channel, ConfirmRule, RoutePart};
use crate::error::LedgerError;

/// A stored code did not match any known enum value.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} code {code}")]
pub struct UnknownCode {
    kind: &'static str,
    code: i64,
}

impl UnknownCode {
    pub fn new(kind: &'static str, code: i64) -> Self {
        Self { kind, code }
    }
}

/// Where in the pipeline a ledger row sits.
///
/// Pipeline stages are ordered by their code; a row's successors never sit at
/// an earlier pipeline stage. `Process` marks administrative rows and
/// `Discard` can be entered from anywhere.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Process = 1,
    Discard = 3,
    ExternIn = 200,
    FileIn = 220,
    Parsed = 310,
    SplitUp = 320,
    Translated = 330,
    Merged = 400,
    FileOut = 500,
    ExternOut = 520,
}

impl Stage {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn is_pipeline(self) -> bool {
        !matches!(self, Stage::Process | Stage::Discard)
    }

    /// Whether a successor of a row at this stage may sit at `next`.
    pub fn can_advance_to(self, next: Stage) -> bool {
        next == Stage::Discard
            || (self.is_pipeline() && next.is_pipeline() && next.code() >= self.code())
    }
}

impl TryFrom<i64> for Stage {
    type Error = UnknownCode;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => Stage::Process,
            3 => Stage::Discard,
            200 => Stage::ExternIn,
            220 => Stage::FileIn,
            310 => Stage::Parsed,
            320 => Stage::SplitUp,
            330 => Stage::Translated,
            400 => Stage::Merged,
            500 => Stage::FileOut,
            520 => Stage::ExternOut,
            _ => return Err(UnknownCode { kind: "stage", code }),
        })
    }
}

/// Classification of a ledger row.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Step started but not finished.
    Open = 0,
    Error = 1,
    /// Ready for the next step; stuck if still here when the run ends.
    Ok = 2,
    Done = 3,
    /// Superseded by a re-injected copy.
    Resend = 4,
    NoRetry = 5,
}

impl Outcome {
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Outcomes that forbid successors.
    pub fn is_leaf_only(self) -> bool {
        matches!(self, Outcome::Error | Outcome::Ok)
    }
}

impl TryFrom<i64> for Outcome {
    type Error = UnknownCode;

    fn try_from(code: i64) -> Result<Self, UnknownCode> {
        Ok(match code {
            0 => Outcome::Open,
            1 => Outcome::Error,
            2 => Outcome::Ok,
            3 => Outcome::Done,
            4 => Outcome::Resend,
            5 => Outcome::NoRetry,
            _ => {
                return Err(UnknownCode {
                    kind: "outcome",
                    code,
                });
            }
        })
    }
}

/// How a row is attached to the row(s) it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum LinkKind {
    /// No predecessor: external arrival, process marker or re-injection.
    Root = 0,
    /// Found by scanning `parent = predecessor.id`.
    SplitChild = 1,
    /// Found by following `child` from each contributing row.
    MergeTarget = 2,
}

impl LinkKind {
    pub fn code(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for LinkKind {
    type Error = UnknownCode;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => LinkKind::Root,
            1 => LinkKind::SplitChild,
            2 => LinkKind::MergeTarget,
            _ => return Err(UnknownCode { kind: "link", code }),
        })
    }
}

/// Ledger row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaRecord {
    pub id: i64,
    #[sqlx(try_from = "i64")]
    pub stage: Stage,
    #[sqlx(try_from = "i64")]
    pub outcome: Outcome,
    /// Producing row for split children, 0 otherwise.
    pub parent: i64,
    /// Merge target this row contributed to, 0 otherwise.
    pub child: i64,
    #[sqlx(try_from = "i64")]
    pub link: LinkKind,
    /// Enclosing process row, 0 for run roots.
    pub process: i64,
    /// Row this one was re-injected from (resend, rereceive, retry).
    pub reinjected_from: i64,
    pub route: String,
    pub from_channel: String,
    pub to_channel: String,
    pub from_partner: String,
    pub to_partner: String,
    pub editype: String,
    pub messagetype: String,
    pub alt: String,
    pub testindicator: String,
    pub reference: String,
    pub from_mail: String,
    pub to_mail: String,
    pub charset: String,
    pub contenttype: String,
    /// External name for received/sent rows, content blob name for stored rows.
    pub filename: String,
    pub envelope: String,
    pub divtext: String,
    pub error_text: String,
    pub retransmit: bool,
    pub confirm_asked: bool,
    pub confirmed: bool,
    pub confirm_type: String,
    pub confirm_ta: i64,
    /// Row is an intermediate "wrapped into outer format" step.
    pub wrapped: bool,
    pub nrmessages: i64,
    pub filesize: i64,
    pub number_of_resends: i64,
    pub ts: DateTime<Utc>,
}

/// A single typed column value, used to build statements.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Int(i64),
    Text(String),
    Bool(bool),
}

/// Mutable attributes of a ledger row.
///
/// This is the allow-list for in-place updates and for overrides applied when
/// a row is copied forward. Stage, parent and child linkage are deliberately
/// absent: they are fixed when a row is created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaChanges {
    pub outcome: Option<Outcome>,
    pub route: Option<String>,
    pub from_channel: Option<String>,
    pub to_channel: Option<String>,
    pub from_partner: Option<String>,
    pub to_partner: Option<String>,
    pub editype: Option<String>,
    pub messagetype: Option<String>,
    pub alt: Option<String>,
    pub testindicator: Option<String>,
    pub reference: Option<String>,
    pub from_mail: Option<String>,
    pub to_mail: Option<String>,
    pub charset: Option<String>,
    pub contenttype: Option<String>,
    pub filename: Option<String>,
    pub envelope: Option<String>,
    pub divtext: Option<String>,
    pub error_text: Option<String>,
    pub retransmit: Option<bool>,
    pub confirm_asked: Option<bool>,
    pub confirmed: Option<bool>,
    pub confirm_type: Option<String>,
    pub confirm_ta: Option<i64>,
    pub wrapped: Option<bool>,
    pub nrmessages: Option<i64>,
    pub filesize: Option<i64>,
    pub number_of_resends: Option<i64>,
}

impl TaChanges {
    pub fn outcome(outcome: Outcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..Default::default()
        }
    }

    /// Outcome `Error` with the given error text.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            outcome: Some(Outcome::Error),
            error_text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Drop string changes that are empty, so blank configuration values never
    /// overwrite what is already on a row.
    pub fn without_blanks(mut self) -> Self {
        for field in [
            &mut self.route,
            &mut self.from_channel,
            &mut self.to_channel,
            &mut self.from_partner,
            &mut self.to_partner,
            &mut self.editype,
            &mut self.messagetype,
            &mut self.alt,
            &mut self.testindicator,
            &mut self.reference,
            &mut self.from_mail,
            &mut self.to_mail,
            &mut self.charset,
            &mut self.contenttype,
            &mut self.filename,
            &mut self.envelope,
            &mut self.divtext,
            &mut self.error_text,
            &mut self.confirm_type,
        ] {
            if field.as_deref() == Some("") {
                *field = None;
            }
        }
        self
    }

    /// Column assignments in a stable order.
    pub fn assignments(&self) -> Vec<(&'static str, ColumnValue)> {
        let mut out = Vec::new();
        if let Some(outcome) = self.outcome {
            out.push(("outcome", ColumnValue::Int(outcome.code())));
        }
        let texts = [
            ("route", &self.route),
            ("from_channel", &self.from_channel),
            ("to_channel", &self.to_channel),
            ("from_partner", &self.from_partner),
            ("to_partner", &self.to_partner),
            ("editype", &self.editype),
            ("messagetype", &self.messagetype),
            ("alt", &self.alt),
            ("testindicator", &self.testindicator),
            ("reference", &self.reference),
            ("from_mail", &self.from_mail),
            ("to_mail", &self.to_mail),
            ("charset", &self.charset),
            ("contenttype", &self.contenttype),
            ("filename", &self.filename),
            ("envelope", &self.envelope),
            ("divtext", &self.divtext),
            ("error_text", &self.error_text),
            ("confirm_type", &self.confirm_type),
        ];
        for (column, value) in texts {
            if let Some(value) = value {
                out.push((column, ColumnValue::Text(value.clone())));
            }
        }
        let flags = [
            ("retransmit", self.retransmit),
            ("confirm_asked", self.confirm_asked),
            ("confirmed", self.confirmed),
            ("wrapped", self.wrapped),
        ];
        for (column, value) in flags {
            if let Some(value) = value {
                out.push((column, ColumnValue::Bool(value)));
            }
        }
        let ints = [
            ("confirm_ta", self.confirm_ta),
            ("nrmessages", self.nrmessages),
            ("filesize", self.filesize),
            ("number_of_resends", self.number_of_resends),
        ];
        for (column, value) in ints {
            if let Some(value) = value {
                out.push((column, ColumnValue::Int(value)));
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.assignments().is_empty()
    }
}

/// Row selection used by bulk queries, updates and deletes.
///
/// Unset fields do not constrain the selection. Results are always ordered by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaFilter {
    /// `id > value`
    pub id_above: Option<i64>,
    /// `id >= value`
    pub id_from: Option<i64>,
    /// `id < value`
    pub id_below: Option<i64>,
    pub stage: Option<Stage>,
    pub not_stage: Option<Stage>,
    pub outcomes: Vec<Outcome>,
    pub parent: Option<i64>,
    pub process: Option<i64>,
    pub has_child: Option<bool>,
    pub route: Option<String>,
    pub from_channel: Option<String>,
    pub to_channel: Option<String>,
    pub editype: Option<String>,
    pub messagetype: Option<String>,
    pub testindicator: Option<String>,
    /// Matches the partner itself or any member of the partner group of that name.
    pub from_partner_or_group: Option<String>,
    /// Matches the partner itself or any member of the partner group of that name.
    pub to_partner_or_group: Option<String>,
    pub retransmit: Option<bool>,
    pub ts_before: Option<DateTime<Utc>>,
}

impl TaFilter {
    pub fn stage(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcomes.push(outcome);
        self
    }

    pub fn above(mut self, id: i64) -> Self {
        self.id_above = Some(id);
        self
    }

    pub fn below(mut self, id: i64) -> Self {
        self.id_below = Some(id);
        self
    }

    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn from_channel(mut self, channel: impl Into<String>) -> Self {
        self.from_channel = Some(channel.into());
        self
    }

    pub fn to_channel(mut self, channel: impl Into<String>) -> Self {
        self.to_channel = Some(channel.into());
        self
    }
}

/// Structural attributes of a row being inserted.
#[derive(Debug, Clone)]
pub struct NewRow {
    pub stage: Stage,
    pub parent: i64,
    pub link: LinkKind,
    pub process: i64,
    pub reinjected_from: i64,
    pub fields: TaChanges,
}

impl NewRow {
    /// A row without predecessor.
    pub fn root(stage: Stage, process: i64, fields: TaChanges) -> Self {
        Self {
            stage,
            parent: 0,
            link: LinkKind::Root,
            process,
            reinjected_from: 0,
            fields,
        }
    }
}

/// Instructions for copying a row.
#[derive(Debug, Clone)]
pub struct CopySpec {
    pub row: NewRow,
    /// Outcome to set on the source in the same transaction.
    pub consume_source: Option<Outcome>,
}

/// Run report row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ReportRecord {
    /// Root process row of the run.
    pub id: i64,
    pub last_open: i64,
    pub last_error: i64,
    pub last_ok: i64,
    pub last_done: i64,
    pub sent: i64,
    pub process_errors: i64,
    pub last_received: i64,
    /// True when the run contains errors, stuck or open files or process errors.
    pub status: bool,
    pub command: String,
    pub filesize: i64,
    pub acceptance: bool,
    pub command_line: String,
    pub ts: DateTime<Utc>,
}

/// Summary of one received file.
#[derive(Debug, Clone, Default, PartialEq, sqlx::FromRow)]
pub struct FileReportRecord {
    /// Received-external root row of the file.
    pub id: i64,
    pub report_id: i64,
    pub outcome: i64,
    pub retransmit: bool,
    pub route: String,
    pub from_channel: String,
    pub to_channel: String,
    pub from_partner: String,
    pub to_partner: String,
    pub from_mail: String,
    pub to_mail: String,
    pub in_editype: String,
    pub in_messagetype: String,
    pub out_editype: String,
    pub out_messagetype: String,
    pub in_contenttype: String,
    pub out_contenttype: String,
    pub nrmessages: i64,
    pub in_filename: String,
    pub out_filename: String,
    pub out_ta: i64,
    pub error_text: String,
    pub divtext: String,
    pub filesize: i64,
    #[sqlx(default)]
    pub ts: Option<DateTime<Utc>>,
}

/// Counts removed by a retention purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub rows: u64,
    pub reports: u64,
    pub file_reports: u64,
}

/// Row-level storage for the ledger, counters, reports and the crash marker.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    // ========== Ledger rows ==========

    async fn insert_row(&self, row: &NewRow) -> Result<i64, LedgerError>;

    /// Copy the allow-listed fields of `source` into a new row, apply the
    /// overrides and optionally set the source outcome, all in one transaction.
    async fn copy_row(&self, source: i64, spec: &CopySpec) -> Result<i64, LedgerError>;

    /// Insert a merge target and point every contributor at it, marking the
    /// contributors done.
    async fn merge_rows(&self, contributors: &[i64], row: &NewRow) -> Result<i64, LedgerError>;

    async fn get_row(&self, id: i64) -> Result<Option<TaRecord>, LedgerError>;

    async fn update_row(&self, id: i64, changes: &TaChanges) -> Result<u64, LedgerError>;

    async fn update_rows(&self, filter: &TaFilter, changes: &TaChanges)
    -> Result<u64, LedgerError>;

    async fn select_rows(&self, filter: &TaFilter) -> Result<Vec<TaRecord>, LedgerError>;

    async fn count_rows(&self, filter: &TaFilter) -> Result<i64, LedgerError>;

    /// Split children (`parent = id`) and the merge target (`id = child`), ordered by id.
    async fn successors(&self, id: i64) -> Result<Vec<TaRecord>, LedgerError>;

    async fn delete_row(&self, id: i64) -> Result<u64, LedgerError>;

    async fn delete_rows(&self, filter: &TaFilter) -> Result<u64, LedgerError>;

    /// Reset `child` on every row pointing at `target`.
    async fn clear_child_links(&self, target: i64) -> Result<u64, LedgerError>;

    async fn max_id(&self) -> Result<i64, LedgerError>;

    // ========== Counters ==========

    async fn counter(&self, domain: &str) -> Result<Option<i64>, LedgerError>;

    async fn set_counter(&self, domain: &str, value: i64) -> Result<(), LedgerError>;

    /// Store `value` and return the previous value, if any.
    async fn swap_counter(&self, domain: &str, value: i64) -> Result<Option<i64>, LedgerError>;

    /// Increment (starting from 0) and return the new value.
    async fn increment_counter(&self, domain: &str) -> Result<i64, LedgerError>;

    // ========== Reports ==========

    async fn insert_report(&self, report: &ReportRecord) -> Result<(), LedgerError>;

    async fn get_report(&self, id: i64) -> Result<Option<ReportRecord>, LedgerError>;

    async fn delete_report(&self, id: i64) -> Result<u64, LedgerError>;

    async fn insert_file_report(&self, report: &FileReportRecord) -> Result<(), LedgerError>;

    async fn file_reports(&self, report_id: i64) -> Result<Vec<FileReportRecord>, LedgerError>;

    async fn delete_file_reports_above(&self, id: i64) -> Result<u64, LedgerError>;

    /// Operator action: flag a received file for rereceive.
    async fn set_file_report_retransmit(&self, id: i64, flag: bool) -> Result<u64, LedgerError>;

    async fn file_reports_to_rereceive(&self) -> Result<Vec<i64>, LedgerError>;

    // ========== Crash marker ==========

    /// Insert the crash marker. Returns false when it is already present.
    async fn acquire_run_marker(&self) -> Result<bool, LedgerError>;

    async fn release_run_marker(&self) -> Result<(), LedgerError>;

    /// Whether the underlying database passes its own consistency check.
    async fn integrity_check(&self) -> Result<bool, LedgerError>;

    // ========== Retention ==========

    /// Delete rows, reports and file reports of runs that started before `cutoff`,
    /// keeping the most recent of those runs.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeStats, LedgerError>;

    /// Delete reports of `new` runs that received nothing, older than `cutoff`.
    async fn purge_empty_reports(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError>;
}

/// Read access to the routing catalog.
#[async_trait::async_trait]
pub trait CatalogStore: Send + Sync {
    /// Active parts of a route, ordered by sequence number.
    async fn route_parts(&self, route: &str) -> Result<Vec<RoutePart>, LedgerError>;

    /// Names of active routes, optionally only those in the default run.
    async fn route_names(&self, default_run_only: bool) -> Result<Vec<String>, LedgerError>;

    async fn channel(&self, id: &str) -> Result<Option<Channel>, LedgerError>;

    /// Distinct non-empty archive directories of all channels.
    async fn archive_paths(&self) -> Result<Vec<String>, LedgerError>;

    /// Active confirmation rules, positive rules first, each group in id order.
    async fn confirm_rules(&self) -> Result<Vec<ConfirmRule>, LedgerError>;

    /// Insert or replace every entry of a catalog file.
    async fn upsert_catalog(&self, catalog: &CatalogFile) -> Result<(), LedgerError>;
}
