// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// When retention cleanup runs without `--cleanup` on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum CleanupPolicy {
    /// First run of each day.
    Daily,
    /// After every run.
    Always,
    /// Only when requested explicitly.
    Never,
}

/// Edirelay engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Root directory of the content-blob store
    pub data_dir: PathBuf,
    /// Port bound on 127.0.0.1 while the engine runs
    pub port: u16,
    /// Connect attempts for channels that do not set their own
    pub max_connection_tries: u32,
    /// Time box for one inbound channel invocation
    pub max_seconds_per_channel: Option<Duration>,
    /// Show "(several values)" when a file report field differs across rows
    pub multiple_values_asterisk: bool,
    /// Notify when a run contains errors
    pub send_report_if_error: bool,
    /// Process errors alone are reason to notify
    pub report_on_process_error: bool,
    /// Archive transferred files under their external name
    pub archive_external_name: bool,
    /// Archive into one zip file per day instead of a directory
    pub archive_zip: bool,
    /// Only the `mailbag` edi type is split after receipt
    pub compatibility_split: bool,
    /// Runs are acceptance tests: no archiving, no retention cleanup
    pub acceptance_test: bool,
    /// Retention for ledger rows and reports, in days
    pub max_days: u32,
    /// Retention for archive directories, in days
    pub max_days_archive: u32,
    pub when_cleanup: CleanupPolicy,
    /// Reports of `new` runs that received nothing are kept this long
    pub hours_run_without_result: u32,
}

impl Config {
    /// Configuration with defaults for everything but the database.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            data_dir: PathBuf::from(".data"),
            port: 28081,
            max_connection_tries: 3,
            max_seconds_per_channel: None,
            multiple_values_asterisk: true,
            send_report_if_error: false,
            report_on_process_error: true,
            archive_external_name: false,
            archive_zip: false,
            compatibility_split: false,
            acceptance_test: false,
            max_days: 30,
            max_days_archive: 180,
            when_cleanup: CleanupPolicy::Daily,
            hours_run_without_result: 1,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `EDIRELAY_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `EDIRELAY_DATA_DIR`: content-blob store (default: .data)
    /// - `EDIRELAY_PORT`: liveness port (default: 28081)
    /// - `EDIRELAY_MAX_CONNECTION_TRIES`: connect attempts (default: 3)
    /// - `EDIRELAY_MAX_SECONDS_PER_CHANNEL`: inbound time box (default: unlimited)
    /// - `EDIRELAY_MULTIPLE_VALUES_ASTERISK` (default: true)
    /// - `EDIRELAY_SEND_REPORT_IF_ERROR` (default: false)
    /// - `EDIRELAY_REPORT_ON_PROCESS_ERROR` (default: true)
    /// - `EDIRELAY_ARCHIVE_EXTERNAL_NAME` (default: false)
    /// - `EDIRELAY_ARCHIVE_ZIP` (default: false)
    /// - `EDIRELAY_COMPATIBILITY_SPLIT` (default: false)
    /// - `EDIRELAY_ACCEPTANCE_TEST` (default: false)
    /// - `EDIRELAY_MAX_DAYS` (default: 30)
    /// - `EDIRELAY_MAX_DAYS_ARCHIVE` (default: 180)
    /// - `EDIRELAY_WHEN_CLEANUP`: daily, always or never (default: daily)
    /// - `EDIRELAY_HOURS_RUN_WITHOUT_RESULT` (default: 1)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("EDIRELAY_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("EDIRELAY_DATABASE_URL"))?;
        let mut config = Self::new(database_url);

        if let Ok(dir) = std::env::var("EDIRELAY_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.port = parse_var("EDIRELAY_PORT", config.port, "must be a valid port number")?;
        config.max_connection_tries = parse_var(
            "EDIRELAY_MAX_CONNECTION_TRIES",
            config.max_connection_tries,
            "must be a positive integer",
        )?;
        if config.max_connection_tries == 0 {
            return Err(ConfigError::Invalid(
                "EDIRELAY_MAX_CONNECTION_TRIES",
                "must be a positive integer",
            ));
        }
        let seconds: u64 = parse_var(
            "EDIRELAY_MAX_SECONDS_PER_CHANNEL",
            0,
            "must be a number of seconds",
        )?;
        config.max_seconds_per_channel = (seconds > 0).then(|| Duration::from_secs(seconds));

        config.multiple_values_asterisk =
            parse_flag("EDIRELAY_MULTIPLE_VALUES_ASTERISK", config.multiple_values_asterisk)?;
        config.send_report_if_error =
            parse_flag("EDIRELAY_SEND_REPORT_IF_ERROR", config.send_report_if_error)?;
        config.report_on_process_error =
            parse_flag("EDIRELAY_REPORT_ON_PROCESS_ERROR", config.report_on_process_error)?;
        config.archive_external_name =
            parse_flag("EDIRELAY_ARCHIVE_EXTERNAL_NAME", config.archive_external_name)?;
        config.archive_zip = parse_flag("EDIRELAY_ARCHIVE_ZIP", config.archive_zip)?;
        config.compatibility_split =
            parse_flag("EDIRELAY_COMPATIBILITY_SPLIT", config.compatibility_split)?;
        config.acceptance_test = parse_flag("EDIRELAY_ACCEPTANCE_TEST", config.acceptance_test)?;

        config.max_days = parse_var("EDIRELAY_MAX_DAYS", config.max_days, "must be a number of days")?;
        config.max_days_archive = parse_var(
            "EDIRELAY_MAX_DAYS_ARCHIVE",
            config.max_days_archive,
            "must be a number of days",
        )?;
        config.when_cleanup = parse_var(
            "EDIRELAY_WHEN_CLEANUP",
            config.when_cleanup,
            "must be daily, always or never",
        )?;
        config.hours_run_without_result = parse_var(
            "EDIRELAY_HOURS_RUN_WITHOUT_RESULT",
            config.hours_run_without_result,
            "must be a number of hours",
        )?;

        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    name: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, expected)),
        Err(_) => Ok(default),
    }
}

fn parse_flag(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(name, "must be true or false")),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
