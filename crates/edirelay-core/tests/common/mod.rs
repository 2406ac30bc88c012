// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for edirelay-core integration tests.
//!
//! Provides TestContext with an in-memory ledger, a temporary data directory
//! and a catalog wired to directory channels.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;

use edirelay_core::catalog::{CatalogFile, Channel, Direction, RoutePart, TranslateMode};
use edirelay_core::communication::{ChannelRegistry, CommunicationSession, SessionIo};
use edirelay_core::error::CommunicationError;
use edirelay_core::persistence::{CatalogStore, TaFilter, TaRecord};
use edirelay_core::runtime::EngineBuilder;
use edirelay_core::{Config, Engine, SqliteLedgerStore, Stage, migrations};

/// Outbound driver that counts sessions and marks every row sent.
pub struct CountingSession {
    sessions: Arc<AtomicUsize>,
}

#[async_trait]
impl CommunicationSession for CountingSession {
    async fn connect(&mut self) -> Result<(), CommunicationError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&mut self, io: &mut SessionIo<'_>) -> Result<(), CommunicationError> {
        for row in io.pending_outgoing().await? {
            let sent = io.begin_send(&row).await?;
            io.record_sent(sent, &row, &format!("counted-{}", row.id)).await?;
        }
        Ok(())
    }
}

/// Driver whose connect always fails.
pub struct RefusingSession;

#[async_trait]
impl CommunicationSession for RefusingSession {
    async fn connect(&mut self) -> Result<(), CommunicationError> {
        Err(CommunicationError::Transfer("connection refused".to_string()))
    }
}

/// Test context with a fresh ledger, data directory and channel directories.
pub struct TestContext {
    pub dir: TempDir,
    pub store: Arc<SqliteLedgerStore>,
    pub engine: Engine,
    pub sessions: Arc<AtomicUsize>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        Self::build(adjust, |builder| builder).await
    }

    pub async fn build(
        adjust: impl FnOnce(&mut Config),
        customize: impl FnOnce(EngineBuilder) -> EngineBuilder,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        let store = Arc::new(SqliteLedgerStore::new(pool));

        let mut config = Config::new("sqlite::memory:");
        config.data_dir = dir.path().join("data");
        config.max_connection_tries = 1;
        adjust(&mut config);

        let sessions = Arc::new(AtomicUsize::new(0));
        let mut channels = ChannelRegistry::with_builtin();
        let counter = sessions.clone();
        channels.register("counting", move |_| {
            Box::new(CountingSession {
                sessions: counter.clone(),
            })
        });
        channels.register("refusing", |_| Box::new(RefusingSession));

        let builder = Engine::builder(config)
            .store(store.clone())
            .channels(channels);
        let engine = customize(builder).build().unwrap();
        Self {
            dir,
            store,
            engine,
            sessions,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Inbound `file` channel reading `<tmp>/<id>`.
    pub fn inbound(&self, id: &str) -> Channel {
        std::fs::create_dir_all(self.path(id)).unwrap();
        Channel {
            id: id.to_string(),
            direction: Direction::In,
            kind: "file".to_string(),
            path: self.path(id).to_string_lossy().into_owned(),
            filename: "*.edi".to_string(),
            remove: true,
            ..Default::default()
        }
    }

    /// Outbound channel of the given driver writing to `<tmp>/<id>`.
    pub fn outbound(&self, id: &str, kind: &str) -> Channel {
        Channel {
            id: id.to_string(),
            direction: Direction::Out,
            kind: kind.to_string(),
            path: self.path(id).to_string_lossy().into_owned(),
            filename: "{infile}".to_string(),
            ..Default::default()
        }
    }

    pub async fn load(&self, channels: Vec<Channel>, routes: Vec<RoutePart>) {
        let catalog = CatalogFile {
            channels,
            routes,
            ..Default::default()
        };
        self.store.upsert_catalog(&catalog).await.unwrap();
    }

    pub fn drop_file(&self, channel: &str, name: &str, content: &str) {
        std::fs::write(self.path(channel).join(name), content).unwrap();
    }

    pub async fn rows(&self, filter: TaFilter) -> Vec<TaRecord> {
        self.engine.ledger().select(&filter).await.unwrap()
    }

    pub async fn rows_at(&self, stage: Stage) -> Vec<TaRecord> {
        self.rows(TaFilter::stage(stage)).await
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

/// Pass-through route part from `from` to `to`.
pub fn pass_through(route: &str, from: &str, to: &str) -> RoutePart {
    RoutePart {
        from_channel: from.to_string(),
        to_channel: to.to_string(),
        translate: TranslateMode::PassThrough,
        ..RoutePart::new(route, 1)
    }
}

pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
