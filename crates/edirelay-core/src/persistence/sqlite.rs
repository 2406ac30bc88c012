// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::catalog::{CatalogFile, Channel, ConfirmRule, RoutePart};
use crate::error::LedgerError;
use crate::migrations;

use super::{
    CatalogStore, ColumnValue, CopySpec, FileReportRecord, LedgerStore, NewRow, Outcome,
    PurgeStats, ReportRecord, TaChanges, TaFilter, TaRecord,
};

/// Columns carried over when a row is copied forward.
const COPIED_COLUMNS: &str = "route, from_channel, to_channel, from_partner, to_partner, \
     editype, messagetype, alt, testindicator, reference, from_mail, to_mail, charset, \
     contenttype, filename, envelope, nrmessages";

/// SQLite-backed ledger and catalog store.
#[derive(Clone)]
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    /// Create a new store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite URL, creating the database if needed, and run migrations.
    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file when missing.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }
        Self::connect(&format!("sqlite:{}", path.to_string_lossy())).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &TaFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(id) = filter.id_above {
        qb.push(" AND id > ").push_bind(id);
    }
    if let Some(id) = filter.id_from {
        qb.push(" AND id >= ").push_bind(id);
    }
    if let Some(id) = filter.id_below {
        qb.push(" AND id < ").push_bind(id);
    }
    if let Some(stage) = filter.stage {
        qb.push(" AND stage = ").push_bind(stage.code());
    }
    if let Some(stage) = filter.not_stage {
        qb.push(" AND stage != ").push_bind(stage.code());
    }
    if !filter.outcomes.is_empty() {
        qb.push(" AND outcome IN (");
        let mut list = qb.separated(", ");
        for outcome in &filter.outcomes {
            list.push_bind(outcome.code());
        }
        list.push_unseparated(")");
    }
    if let Some(parent) = filter.parent {
        qb.push(" AND parent = ").push_bind(parent);
    }
    if let Some(process) = filter.process {
        qb.push(" AND process = ").push_bind(process);
    }
    match filter.has_child {
        Some(true) => {
            qb.push(" AND child != 0");
        }
        Some(false) => {
            qb.push(" AND child = 0");
        }
        None => {}
    }
    let texts = [
        ("route", &filter.route),
        ("from_channel", &filter.from_channel),
        ("to_channel", &filter.to_channel),
        ("editype", &filter.editype),
        ("messagetype", &filter.messagetype),
        ("testindicator", &filter.testindicator),
    ];
    for (column, value) in texts {
        if let Some(value) = value {
            qb.push(format!(" AND {column} = ")).push_bind(value.clone());
        }
    }
    let partners = [
        ("from_partner", &filter.from_partner_or_group),
        ("to_partner", &filter.to_partner_or_group),
    ];
    for (column, value) in partners {
        if let Some(value) = value {
            qb.push(format!(" AND ({column} = "))
                .push_bind(value.clone())
                .push(format!(
                    " OR {column} IN (SELECT partner FROM partner_groups WHERE group_id = "
                ))
                .push_bind(value.clone())
                .push("))");
        }
    }
    if let Some(flag) = filter.retransmit {
        qb.push(" AND retransmit = ").push_bind(flag);
    }
    if let Some(ts) = filter.ts_before {
        qb.push(" AND ts < ").push_bind(ts);
    }
}

fn push_assignments(qb: &mut QueryBuilder<'_, Sqlite>, changes: &TaChanges) {
    let mut set = qb.separated(", ");
    for (column, value) in changes.assignments() {
        set.push(column);
        set.push_unseparated(" = ");
        match value {
            ColumnValue::Int(v) => {
                set.push_bind_unseparated(v);
            }
            ColumnValue::Text(v) => {
                set.push_bind_unseparated(v);
            }
            ColumnValue::Bool(v) => {
                set.push_bind_unseparated(v);
            }
        }
    }
}

async fn apply_changes(
    conn: &mut SqliteConnection,
    id: i64,
    changes: &TaChanges,
) -> Result<u64, LedgerError> {
    if changes.is_empty() {
        return Ok(0);
    }
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE ta SET ");
    push_assignments(&mut qb, changes);
    qb.push(" WHERE id = ").push_bind(id);
    let result = qb.build().execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

async fn insert_in(conn: &mut SqliteConnection, row: &NewRow) -> Result<i64, LedgerError> {
    let id = sqlx::query(
        r#"
        INSERT INTO ta (stage, outcome, parent, link, process, reinjected_from, ts)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row.stage.code())
    .bind(Outcome::Open.code())
    .bind(row.parent)
    .bind(row.link.code())
    .bind(row.process)
    .bind(row.reinjected_from)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    apply_changes(conn, id, &row.fields).await?;
    Ok(id)
}

#[async_trait::async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn insert_row(&self, row: &NewRow) -> Result<i64, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let id = insert_in(&mut tx, row).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn copy_row(&self, source: i64, spec: &CopySpec) -> Result<i64, LedgerError> {
        let sql = format!(
            "INSERT INTO ta (stage, outcome, parent, link, process, reinjected_from, ts, {COPIED_COLUMNS}) \
             SELECT ?, ?, ?, ?, ?, ?, ?, {COPIED_COLUMNS} FROM ta WHERE id = ?"
        );
        let row = &spec.row;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&sql)
            .bind(row.stage.code())
            .bind(Outcome::Open.code())
            .bind(row.parent)
            .bind(row.link.code())
            .bind(row.process)
            .bind(row.reinjected_from)
            .bind(Utc::now())
            .bind(source)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::RowNotFound(source));
        }
        let id = result.last_insert_rowid();
        apply_changes(&mut tx, id, &row.fields).await?;
        if let Some(outcome) = spec.consume_source {
            apply_changes(&mut tx, source, &TaChanges::outcome(outcome)).await?;
        }
        tx.commit().await?;
        Ok(id)
    }

    async fn merge_rows(&self, contributors: &[i64], row: &NewRow) -> Result<i64, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let id = insert_in(&mut tx, row).await?;
        for contributor in contributors {
            let result = sqlx::query("UPDATE ta SET child = ?, outcome = ? WHERE id = ?")
                .bind(id)
                .bind(Outcome::Done.code())
                .bind(contributor)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                return Err(LedgerError::RowNotFound(*contributor));
            }
        }
        tx.commit().await?;
        Ok(id)
    }

    async fn get_row(&self, id: i64) -> Result<Option<TaRecord>, LedgerError> {
        let record = sqlx::query_as::<_, TaRecord>("SELECT * FROM ta WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn update_row(&self, id: i64, changes: &TaChanges) -> Result<u64, LedgerError> {
        if changes.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.acquire().await?;
        apply_changes(&mut conn, id, changes).await
    }

    async fn update_rows(
        &self,
        filter: &TaFilter,
        changes: &TaChanges,
    ) -> Result<u64, LedgerError> {
        if changes.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE ta SET ");
        push_assignments(&mut qb, changes);
        push_filter(&mut qb, filter);
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn select_rows(&self, filter: &TaFilter) -> Result<Vec<TaRecord>, LedgerError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM ta");
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY id");
        let rows = qb.build_query_as::<TaRecord>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn count_rows(&self, filter: &TaFilter) -> Result<i64, LedgerError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM ta");
        push_filter(&mut qb, filter);
        let count = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn successors(&self, id: i64) -> Result<Vec<TaRecord>, LedgerError> {
        let rows = sqlx::query_as::<_, TaRecord>(
            r#"
            SELECT * FROM ta
            WHERE id > ?
              AND ((parent = ? AND link = 1)
                   OR (link = 2 AND id = (SELECT child FROM ta WHERE id = ?)))
            ORDER BY id
            "#,
        )
        .bind(id)
        .bind(id)
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_row(&self, id: i64) -> Result<u64, LedgerError> {
        let result = sqlx::query("DELETE FROM ta WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_rows(&self, filter: &TaFilter) -> Result<u64, LedgerError> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM ta");
        push_filter(&mut qb, filter);
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn clear_child_links(&self, target: i64) -> Result<u64, LedgerError> {
        let result = sqlx::query("UPDATE ta SET child = 0 WHERE child = ?")
            .bind(target)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn max_id(&self) -> Result<i64, LedgerError> {
        let id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM ta")
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn counter(&self, domain: &str) -> Result<Option<i64>, LedgerError> {
        let value: Option<i64> = sqlx::query_scalar("SELECT value FROM counters WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_counter(&self, domain: &str, value: i64) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO counters (domain, value) VALUES (?, ?)
            ON CONFLICT(domain) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(domain)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn swap_counter(&self, domain: &str, value: i64) -> Result<Option<i64>, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let previous: Option<i64> =
            sqlx::query_scalar("SELECT value FROM counters WHERE domain = ?")
                .bind(domain)
                .fetch_optional(&mut *tx)
                .await?;
        sqlx::query(
            r#"
            INSERT INTO counters (domain, value) VALUES (?, ?)
            ON CONFLICT(domain) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(domain)
        .bind(value)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(previous)
    }

    async fn increment_counter(&self, domain: &str) -> Result<i64, LedgerError> {
        let value: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO counters (domain, value) VALUES (?, 1)
            ON CONFLICT(domain) DO UPDATE SET value = value + 1
            RETURNING value
            "#,
        )
        .bind(domain)
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }

    async fn insert_report(&self, report: &ReportRecord) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO reports (id, last_open, last_error, last_ok, last_done, sent,
                process_errors, last_received, status, command, filesize, acceptance,
                command_line, ts)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(report.id)
        .bind(report.last_open)
        .bind(report.last_error)
        .bind(report.last_ok)
        .bind(report.last_done)
        .bind(report.sent)
        .bind(report.process_errors)
        .bind(report.last_received)
        .bind(report.status)
        .bind(&report.command)
        .bind(report.filesize)
        .bind(report.acceptance)
        .bind(&report.command_line)
        .bind(report.ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_report(&self, id: i64) -> Result<Option<ReportRecord>, LedgerError> {
        let report = sqlx::query_as::<_, ReportRecord>("SELECT * FROM reports WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(report)
    }

    async fn delete_report(&self, id: i64) -> Result<u64, LedgerError> {
        let result = sqlx::query("DELETE FROM reports WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_file_report(&self, report: &FileReportRecord) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO file_reports (id, report_id, outcome, retransmit, route,
                from_channel, to_channel, from_partner, to_partner, from_mail, to_mail,
                in_editype, in_messagetype, out_editype, out_messagetype, in_contenttype,
                out_contenttype, nrmessages, in_filename, out_filename, out_ta, error_text,
                divtext, filesize, ts)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(report.id)
        .bind(report.report_id)
        .bind(report.outcome)
        .bind(report.retransmit)
        .bind(&report.route)
        .bind(&report.from_channel)
        .bind(&report.to_channel)
        .bind(&report.from_partner)
        .bind(&report.to_partner)
        .bind(&report.from_mail)
        .bind(&report.to_mail)
        .bind(&report.in_editype)
        .bind(&report.in_messagetype)
        .bind(&report.out_editype)
        .bind(&report.out_messagetype)
        .bind(&report.in_contenttype)
        .bind(&report.out_contenttype)
        .bind(report.nrmessages)
        .bind(&report.in_filename)
        .bind(&report.out_filename)
        .bind(report.out_ta)
        .bind(&report.error_text)
        .bind(&report.divtext)
        .bind(report.filesize)
        .bind(report.ts.unwrap_or_else(Utc::now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn file_reports(&self, report_id: i64) -> Result<Vec<FileReportRecord>, LedgerError> {
        let reports = sqlx::query_as::<_, FileReportRecord>(
            "SELECT * FROM file_reports WHERE report_id = ? ORDER BY id",
        )
        .bind(report_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(reports)
    }

    async fn delete_file_reports_above(&self, id: i64) -> Result<u64, LedgerError> {
        let result = sqlx::query("DELETE FROM file_reports WHERE id > ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn set_file_report_retransmit(&self, id: i64, flag: bool) -> Result<u64, LedgerError> {
        let result = sqlx::query("UPDATE file_reports SET retransmit = ? WHERE id = ?")
            .bind(flag)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn file_reports_to_rereceive(&self) -> Result<Vec<i64>, LedgerError> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM file_reports WHERE retransmit = 1 ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    async fn acquire_run_marker(&self) -> Result<bool, LedgerError> {
        let result = sqlx::query("INSERT INTO engine_mutex (id, acquired_at) VALUES (1, ?)")
            .bind(Utc::now())
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn release_run_marker(&self) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM engine_mutex WHERE id = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn integrity_check(&self) -> Result<bool, LedgerError> {
        let verdict: String = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_one(&self.pool)
            .await?;
        Ok(verdict == "ok")
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeStats, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let keep: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM reports WHERE ts < ?")
            .bind(cutoff)
            .fetch_one(&mut *tx)
            .await?;
        let Some(keep) = keep else {
            return Ok(PurgeStats::default());
        };

        let rows = sqlx::query("DELETE FROM ta WHERE id < ?")
            .bind(keep)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let file_reports = sqlx::query("DELETE FROM file_reports WHERE report_id < ?")
            .bind(keep)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let reports = sqlx::query("DELETE FROM reports WHERE id < ?")
            .bind(keep)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(PurgeStats {
            rows,
            reports,
            file_reports,
        })
    }

    async fn purge_empty_reports(&self, cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            r#"
            DELETE FROM reports
            WHERE command = 'new' AND last_received = 0 AND process_errors = 0 AND ts < ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl CatalogStore for SqliteLedgerStore {
    async fn route_parts(&self, route: &str) -> Result<Vec<RoutePart>, LedgerError> {
        let parts = sqlx::query_as::<_, RoutePart>(
            "SELECT * FROM routes WHERE route = ? AND active = 1 ORDER BY seq",
        )
        .bind(route)
        .fetch_all(&self.pool)
        .await?;
        Ok(parts)
    }

    async fn route_names(&self, default_run_only: bool) -> Result<Vec<String>, LedgerError> {
        let sql = if default_run_only {
            "SELECT DISTINCT route FROM routes WHERE active = 1 AND in_default_run = 1 ORDER BY route"
        } else {
            "SELECT DISTINCT route FROM routes WHERE active = 1 ORDER BY route"
        };
        let names: Vec<String> = sqlx::query_scalar(sql).fetch_all(&self.pool).await?;
        Ok(names)
    }

    async fn channel(&self, id: &str) -> Result<Option<Channel>, LedgerError> {
        let channel = sqlx::query_as::<_, Channel>("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(channel)
    }

    async fn archive_paths(&self) -> Result<Vec<String>, LedgerError> {
        let paths: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT archive_path FROM channels WHERE archive_path != '' ORDER BY archive_path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(paths)
    }

    async fn confirm_rules(&self) -> Result<Vec<ConfirmRule>, LedgerError> {
        let rules = sqlx::query_as::<_, ConfirmRule>(
            "SELECT * FROM confirm_rules WHERE active = 1 ORDER BY negative ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    async fn upsert_catalog(&self, catalog: &CatalogFile) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        for channel in &catalog.channels {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO channels (id, direction, kind, host, port, username,
                    secret, path, filename, lockname, remove, archive_path,
                    max_connection_tries, max_seconds, max_failures)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&channel.id)
            .bind(channel.direction.to_string())
            .bind(&channel.kind)
            .bind(&channel.host)
            .bind(channel.port)
            .bind(&channel.username)
            .bind(&channel.secret)
            .bind(&channel.path)
            .bind(&channel.filename)
            .bind(&channel.lockname)
            .bind(channel.remove)
            .bind(&channel.archive_path)
            .bind(channel.max_connection_tries)
            .bind(channel.max_seconds)
            .bind(channel.max_failures)
            .execute(&mut *tx)
            .await?;
        }

        for part in &catalog.routes {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO routes (route, seq, active, in_default_run, from_channel,
                    from_editype, from_messagetype, alt, from_partner, to_partner, translate,
                    to_channel, to_editype, to_messagetype, from_partner_tochannel,
                    to_partner_tochannel, testindicator, defer, zip_incoming, zip_outgoing)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&part.route)
            .bind(part.seq)
            .bind(part.active)
            .bind(part.in_default_run)
            .bind(&part.from_channel)
            .bind(&part.from_editype)
            .bind(&part.from_messagetype)
            .bind(&part.alt)
            .bind(&part.from_partner)
            .bind(&part.to_partner)
            .bind(part.translate as i64)
            .bind(&part.to_channel)
            .bind(&part.to_editype)
            .bind(&part.to_messagetype)
            .bind(&part.from_partner_tochannel)
            .bind(&part.to_partner_tochannel)
            .bind(&part.testindicator)
            .bind(part.defer)
            .bind(part.zip_incoming as i64)
            .bind(part.zip_outgoing)
            .execute(&mut *tx)
            .await?;
        }

        // The file is authoritative for confirmation rules: their order matters.
        if !catalog.confirm_rules.is_empty() {
            sqlx::query("DELETE FROM confirm_rules")
                .execute(&mut *tx)
                .await?;
        }
        for rule in &catalog.confirm_rules {
            sqlx::query(
                r#"
                INSERT INTO confirm_rules (active, confirm_type, rule_type, selector, negative)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(rule.active)
            .bind(&rule.confirm_type)
            .bind(rule.rule_type.to_string())
            .bind(&rule.selector)
            .bind(rule.negative)
            .execute(&mut *tx)
            .await?;
        }

        for group in &catalog.partner_groups {
            sqlx::query("DELETE FROM partner_groups WHERE group_id = ?")
                .bind(&group.id)
                .execute(&mut *tx)
                .await?;
            for partner in &group.partners {
                sqlx::query("INSERT INTO partner_groups (group_id, partner) VALUES (?, ?)")
                    .bind(&group.id)
                    .bind(partner)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{LinkKind, Stage};

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        migrations::SQLITE
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        pool
    }

    fn named(stage: Stage, filename: &str) -> NewRow {
        NewRow::root(
            stage,
            0,
            TaChanges {
                filename: Some(filename.to_string()),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_insert_and_get_row() {
        let store = SqliteLedgerStore::new(test_pool().await);

        let id = store.insert_row(&named(Stage::ExternIn, "a.edi")).await.unwrap();
        let row = store.get_row(id).await.unwrap().unwrap();

        assert_eq!(row.stage, Stage::ExternIn);
        assert_eq!(row.outcome, Outcome::Open);
        assert_eq!(row.link, LinkKind::Root);
        assert_eq!(row.filename, "a.edi");
        assert!(store.get_row(id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_copy_row_copies_allow_listed_fields() {
        let store = SqliteLedgerStore::new(test_pool().await);
        let mut source = named(Stage::FileIn, "1");
        source.fields.editype = Some("edifact".to_string());
        source.fields.error_text = Some("old failure".to_string());
        let source_id = store.insert_row(&source).await.unwrap();

        let spec = CopySpec {
            row: NewRow {
                stage: Stage::Translated,
                parent: source_id,
                link: LinkKind::SplitChild,
                process: 7,
                reinjected_from: 0,
                fields: TaChanges {
                    messagetype: Some("ORDERS".to_string()),
                    ..Default::default()
                },
            },
            consume_source: Some(Outcome::Done),
        };
        let id = store.copy_row(source_id, &spec).await.unwrap();

        let copy = store.get_row(id).await.unwrap().unwrap();
        assert_eq!(copy.parent, source_id);
        assert_eq!(copy.process, 7);
        assert_eq!(copy.editype, "edifact");
        assert_eq!(copy.messagetype, "ORDERS");
        assert_eq!(copy.error_text, "");
        let source = store.get_row(source_id).await.unwrap().unwrap();
        assert_eq!(source.outcome, Outcome::Done);
    }

    #[tokio::test]
    async fn test_copy_missing_row_fails() {
        let store = SqliteLedgerStore::new(test_pool().await);
        let spec = CopySpec {
            row: named(Stage::FileIn, ""),
            consume_source: None,
        };
        let err = store.copy_row(42, &spec).await.unwrap_err();
        assert!(matches!(err, LedgerError::RowNotFound(42)));
        assert_eq!(store.max_id().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_rows_with_filter() {
        let store = SqliteLedgerStore::new(test_pool().await);
        for channel in ["in1", "in1", "in2"] {
            let mut row = named(Stage::FileIn, "x");
            row.fields.from_channel = Some(channel.to_string());
            row.fields.outcome = Some(Outcome::Ok);
            store.insert_row(&row).await.unwrap();
        }

        let filter = TaFilter::stage(Stage::FileIn)
            .with_outcome(Outcome::Ok)
            .from_channel("in1");
        let changes = TaChanges {
            editype: Some("x12".to_string()),
            ..Default::default()
        };
        assert_eq!(store.update_rows(&filter, &changes).await.unwrap(), 2);
        assert_eq!(
            store.update_rows(&filter, &TaChanges::default()).await.unwrap(),
            0
        );

        let tagged = store
            .count_rows(&TaFilter {
                editype: Some("x12".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tagged, 2);
    }

    #[tokio::test]
    async fn test_partner_group_filter() {
        let store = SqliteLedgerStore::new(test_pool().await);
        store
            .upsert_catalog(&CatalogFile {
                partner_groups: vec![crate::catalog::PartnerGroup {
                    id: "retail".to_string(),
                    partners: vec!["shop1".to_string(), "shop2".to_string()],
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        for partner in ["shop1", "shop2", "retail", "other"] {
            let mut row = named(Stage::Merged, "x");
            row.fields.to_partner = Some(partner.to_string());
            store.insert_row(&row).await.unwrap();
        }

        let rows = store
            .select_rows(&TaFilter {
                to_partner_or_group: Some("retail".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let partners: Vec<_> = rows.iter().map(|r| r.to_partner.as_str()).collect();
        assert_eq!(partners, vec!["shop1", "shop2", "retail"]);
    }

    #[tokio::test]
    async fn test_merge_and_successors() {
        let store = SqliteLedgerStore::new(test_pool().await);
        let a = store.insert_row(&named(Stage::Translated, "a")).await.unwrap();
        let b = store.insert_row(&named(Stage::Translated, "b")).await.unwrap();
        let merged = store
            .merge_rows(
                &[a, b],
                &NewRow {
                    link: LinkKind::MergeTarget,
                    ..named(Stage::Merged, "m")
                },
            )
            .await
            .unwrap();

        for contributor in [a, b] {
            let succ = store.successors(contributor).await.unwrap();
            assert_eq!(succ.len(), 1);
            assert_eq!(succ[0].id, merged);
            let row = store.get_row(contributor).await.unwrap().unwrap();
            assert_eq!(row.outcome, Outcome::Done);
        }

        assert_eq!(store.clear_child_links(merged).await.unwrap(), 2);
        assert!(store.successors(a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_counters() {
        let store = SqliteLedgerStore::new(test_pool().await);
        assert_eq!(store.counter("mark").await.unwrap(), None);
        assert_eq!(store.swap_counter("mark", 10).await.unwrap(), None);
        assert_eq!(store.swap_counter("mark", 25).await.unwrap(), Some(10));
        assert_eq!(store.counter("mark").await.unwrap(), Some(25));

        assert_eq!(store.increment_counter("fail").await.unwrap(), 1);
        assert_eq!(store.increment_counter("fail").await.unwrap(), 2);
        store.set_counter("fail", 0).await.unwrap();
        assert_eq!(store.counter("fail").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_run_marker() {
        let store = SqliteLedgerStore::new(test_pool().await);
        assert!(store.acquire_run_marker().await.unwrap());
        assert!(!store.acquire_run_marker().await.unwrap());
        store.release_run_marker().await.unwrap();
        assert!(store.acquire_run_marker().await.unwrap());
        assert!(store.integrity_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_keeps_latest_old_run() {
        let store = SqliteLedgerStore::new(test_pool().await);
        let old = Utc::now() - chrono::Duration::days(40);
        let mut report_ids = Vec::new();
        for _ in 0..3 {
            let id = store.insert_row(&named(Stage::Process, "new")).await.unwrap();
            report_ids.push(id);
            store
                .insert_report(&ReportRecord {
                    id,
                    last_open: 0,
                    last_error: 0,
                    last_ok: 0,
                    last_done: 1,
                    sent: 0,
                    process_errors: 0,
                    last_received: 1,
                    status: false,
                    command: "new".to_string(),
                    filesize: 0,
                    acceptance: false,
                    command_line: String::new(),
                    ts: old,
                })
                .await
                .unwrap();
        }

        let stats = store
            .purge_before(Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(stats.reports, 2);
        assert_eq!(stats.rows, 2);
        assert!(store.get_report(report_ids[2]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_catalog_round_trip() {
        let store = SqliteLedgerStore::new(test_pool().await);
        let json = r#"{
            "channels": [{"id": "c_in", "direction": "in", "kind": "file"}],
            "routes": [
                {"route": "b", "seq": 2, "from_channel": "c_in", "active": true, "in_default_run": true},
                {"route": "b", "seq": 1, "from_channel": "c_in", "active": true, "in_default_run": true},
                {"route": "a", "seq": 1, "translate": "pass_through", "active": true, "in_default_run": false},
                {"route": "z", "seq": 1, "active": false, "in_default_run": true}
            ],
            "confirm_rules": [
                {"confirm_type": "ask-x12-997", "rule_type": "frompartner", "selector": "P", "negative": true},
                {"confirm_type": "ask-x12-997", "rule_type": "all"}
            ]
        }"#;
        let catalog: CatalogFile = serde_json::from_str(json).unwrap();
        store.upsert_catalog(&catalog).await.unwrap();

        let parts = store.route_parts("b").await.unwrap();
        assert_eq!(parts.iter().map(|p| p.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.route_names(true).await.unwrap(), vec!["b"]);
        assert_eq!(store.route_names(false).await.unwrap(), vec!["a", "b"]);
        assert!(store.channel("c_in").await.unwrap().is_some());

        let rules = store.confirm_rules().await.unwrap();
        assert!(!rules[0].negative);
        assert!(rules[1].negative);
    }
}
