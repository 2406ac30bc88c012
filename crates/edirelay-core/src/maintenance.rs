// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retention cleanup.
//!
//! Removes ledger rows and reports older than the retention period, archive
//! directories older than the archive retention, content blobs nobody can
//! reach any more and the reports of `new` runs that received nothing.

use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::config::CleanupPolicy;
use crate::error::EngineError;
use crate::persistence::PurgeStats;
use crate::runtime::Engine;

/// Counter holding the day (`YYYYMMDD`) of the last automatic cleanup.
pub const CLEANUP_COUNTER: &str = "cleanup_day";

/// What one cleanup removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub purged: PurgeStats,
    pub empty_reports: u64,
    pub archive_entries: u64,
    pub content_dirs: u64,
}

fn day_number(now: DateTime<Utc>) -> i64 {
    now.format("%Y%m%d")
        .to_string()
        .parse()
        .unwrap_or_default()
}

/// Whether the automatic cleanup is due after a run.
pub async fn cleanup_due(engine: &Engine, now: DateTime<Utc>) -> Result<bool, EngineError> {
    let config = engine.config();
    if config.acceptance_test {
        return Ok(false);
    }
    Ok(match config.when_cleanup {
        CleanupPolicy::Always => true,
        CleanupPolicy::Never => false,
        CleanupPolicy::Daily => {
            let today = day_number(now);
            let last = engine.ledger().store().counter(CLEANUP_COUNTER).await?;
            last != Some(today)
        }
    })
}

/// Run the retention cleanup.
pub async fn cleanup(engine: &Engine, now: DateTime<Utc>) -> Result<CleanupStats, EngineError> {
    let config = engine.config();
    let store = engine.ledger().store();
    store.set_counter(CLEANUP_COUNTER, day_number(now)).await?;

    let cutoff = now - Duration::days(i64::from(config.max_days));
    let mut stats = CleanupStats {
        purged: store.purge_before(cutoff).await?,
        empty_reports: store
            .purge_empty_reports(now - Duration::hours(i64::from(config.hours_run_without_result)))
            .await?,
        ..Default::default()
    };

    let archive_cutoff = (now - Duration::days(i64::from(config.max_days_archive))).date_naive();
    for path in engine.catalog().archive_paths().await? {
        stats.archive_entries += clean_archive(Path::new(&path), archive_cutoff).await?;
    }
    stats.content_dirs = clean_content(engine.content().root(), cutoff.into()).await?;

    info!(
        rows = stats.purged.rows,
        reports = stats.purged.reports,
        file_reports = stats.purged.file_reports,
        empty_reports = stats.empty_reports,
        archive_entries = stats.archive_entries,
        content_dirs = stats.content_dirs,
        "Cleanup finished"
    );
    Ok(stats)
}

/// Date of an archive entry named `YYYYMMDD` or `YYYYMMDD.zip`.
fn archive_date(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_suffix(".zip").unwrap_or(name);
    NaiveDate::parse_from_str(stem, "%Y%m%d").ok()
}

/// Remove dated archive entries before `cutoff`. Other entries are left alone.
async fn clean_archive(root: &Path, cutoff: NaiveDate) -> Result<u64, EngineError> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(date) = name.to_str().and_then(archive_date) else {
            continue;
        };
        if date >= cutoff {
            continue;
        }
        let path = entry.path();
        let result = if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => {
                debug!(path = %path.display(), "Removed archive entry");
                removed += 1;
            }
            Err(err) => warn!(path = %path.display(), error = %err, "Cannot remove archive entry"),
        }
    }
    Ok(removed)
}

/// Remove content directories not written to since `cutoff`.
async fn clean_content(root: &Path, cutoff: SystemTime) -> Result<u64, EngineError> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_dir() || metadata.modified()? >= cutoff {
            continue;
        }
        tokio::fs::remove_dir_all(entry.path()).await?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_archive_date() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
        assert_eq!(archive_date("20250307"), Some(day));
        assert_eq!(archive_date("20250307.zip"), Some(day));
        assert_eq!(archive_date("notes"), None);
    }

    #[test]
    fn test_day_number() {
        let now = Utc.with_ymd_and_hms(2025, 3, 7, 23, 59, 0).unwrap();
        assert_eq!(day_number(now), 20250307);
    }

    #[tokio::test]
    async fn test_clean_archive_removes_old_days_only() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("20240101")).await.unwrap();
        tokio::fs::write(dir.path().join("20240102.zip"), b"PK").await.unwrap();
        tokio::fs::create_dir(dir.path().join("20250301")).await.unwrap();
        tokio::fs::create_dir(dir.path().join("keep")).await.unwrap();

        let cutoff = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        assert_eq!(clean_archive(dir.path(), cutoff).await.unwrap(), 2);
        assert!(dir.path().join("20250301").exists());
        assert!(dir.path().join("keep").exists());
        assert!(!dir.path().join("20240101").exists());
    }

    #[tokio::test]
    async fn test_missing_directories_are_empty() {
        let cutoff = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        assert_eq!(clean_archive(Path::new("/nonexistent/archive"), cutoff).await.unwrap(), 0);
        assert_eq!(
            clean_content(Path::new("/nonexistent/data"), SystemTime::now()).await.unwrap(),
            0
        );
    }
}
