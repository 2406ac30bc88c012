// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edirelay core: the transaction ledger and everything that moves EDI files
//! through it.
//!
//! A run receives files over inbound channels, records every processing step
//! as a ledger row, hands the content to translation and enveloping, sends the
//! result over outbound channels and finally evaluates each received file's
//! row tree into a report.
//!
//! # Modules
//!
//! - [`ledger`]: row lifecycle (create, copy forward, promote, merge, delete)
//! - [`persistence`]: storage traits and the SQLite implementation
//! - [`router`]: route dispatcher
//! - [`commands`]: run commands (`new`, `resend`, `rereceive`, ...)
//! - [`tracer`]: row-tree evaluation and run reports
//! - [`communication`]: channel session contract and built-in drivers
//! - [`translation`]: translation, enveloping and splitting contracts

pub mod catalog;
pub mod commands;
pub mod communication;
pub mod config;
pub mod confirm;
pub mod error;
pub mod hooks;
pub mod ledger;
pub mod maintenance;
pub mod migrations;
pub mod notify;
pub mod persistence;
pub mod process;
pub mod router;
pub mod runtime;
pub mod storage;
pub mod tracer;
pub mod translation;

pub use commands::{Command, RunVerdict};
pub use config::Config;
pub use error::{EngineError, Result};
pub use ledger::Ledger;
pub use persistence::{Outcome, SqliteLedgerStore, Stage};
pub use runtime::Engine;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use sqlx::SqlitePool;
    use sqlx::sqlite::SqlitePoolOptions;

    use crate::ledger::Ledger;
    use crate::migrations;
    use crate::persistence::SqliteLedgerStore;

    pub async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrations::SQLITE.run(&pool).await.unwrap();
        pool
    }

    pub async fn test_ledger() -> Ledger {
        Ledger::new(Arc::new(SqliteLedgerStore::new(test_pool().await)))
    }
}
