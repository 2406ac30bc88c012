// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for edirelay-core.
//!
//! Each layer has its own error enum; [`EngineError`] aggregates them for the
//! run commands and maps every failure to a stable machine code.

use crate::persistence::{Outcome, Stage};

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failures of the transaction ledger and its backing store.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("ledger row {0} not found")]
    RowNotFound(i64),

    /// A row that is stuck or failed must stay a leaf.
    #[error("row {id} has outcome '{outcome}' and cannot get a successor")]
    ChildOfTerminalRow { id: i64, outcome: Outcome },

    #[error("row {id} cannot move from stage '{from}' to stage '{to}'")]
    StageRegression { id: i64, from: Stage, to: Stage },

    #[error("merge needs at least one contributing row")]
    EmptyMerge,
}

/// Failures of a communication session or its bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum CommunicationError {
    #[error("channel '{channel}': connect failed after {attempts} attempt(s): {reason}")]
    Connect {
        channel: String,
        attempts: u32,
        reason: String,
    },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("no driver registered for channel type '{0}'")]
    UnknownChannelType(String),

    #[error("channel '{0}' is not configured")]
    UnknownChannel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Failures of translation, enveloping and preprocessing steps.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("mapping failed: {0}")]
    Mapping(String),

    /// The whole originating file must be discarded, not just one message.
    #[error("whole file rejected: {0}")]
    KillWholeFile(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Structural violations found while evaluating a file's row tree.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("row {id} has outcome '{outcome}' but has {children} successor(s)")]
    TerminalWithChildren {
        id: i64,
        outcome: Outcome,
        children: usize,
    },

    #[error("row {0} is still open")]
    OpenRow(i64),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Aggregated error for run commands and the route dispatcher.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Route, channel or mapping configuration is missing or inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A route hook failed.
    #[error("route hook '{hook}' failed: {reason}")]
    Hook { hook: String, reason: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Communication(#[from] CommunicationError),

    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Hook { .. } => "HOOK_ERROR",
            Self::Ledger(LedgerError::Database(_) | LedgerError::Migrate(_)) => "DATABASE_ERROR",
            Self::Ledger(_) => "LEDGER_ERROR",
            Self::Communication(_) => "COMMUNICATION_ERROR",
            Self::Translate(TranslateError::KillWholeFile(_)) => "FILE_REJECTED",
            Self::Translate(_) => "TRANSLATION_ERROR",
            Self::Trace(_) => "TRACE_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Whether this error indicates ledger corruption rather than a business failure.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Trace(TraceError::TerminalWithChildren { .. } | TraceError::OpenRow(_))
        )
    }
}
