// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine.
//!
//! [`Engine`] bundles the ledger, the catalog, the content store and the
//! pluggable parts (channel drivers, route scripts, translation) that a run
//! needs. The `edirelay` binary builds one per invocation; tests and embedding
//! applications use [`EngineBuilder`] directly.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use edirelay_core::{Command, Config, Engine, SqliteLedgerStore};
//!
//! let config = Config::from_env()?;
//! let store = Arc::new(SqliteLedgerStore::connect(&config.database_url).await?);
//! let engine = Engine::builder(config).store(store).build()?;
//! let verdict = edirelay_core::commands::execute(&engine, Command::New, &[]).await?;
//! ```

use std::fmt;
use std::sync::Arc;

use crate::communication::ChannelRegistry;
use crate::config::Config;
use crate::error::EngineError;
use crate::hooks::{EngineScript, HookRegistry};
use crate::ledger::Ledger;
use crate::notify::{LogNotifier, Notifier};
use crate::persistence::{CatalogStore, LedgerStore, SqliteLedgerStore};
use crate::storage::ContentStore;
use crate::translation::{Enveloper, NoSplitter, NoTranslator, OneToOneEnveloper, Splitter, Translator};

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    config: Config,
    ledger: Option<Arc<dyn LedgerStore>>,
    catalog: Option<Arc<dyn CatalogStore>>,
    channels: ChannelRegistry,
    hooks: HookRegistry,
    engine_script: Option<Arc<dyn EngineScript>>,
    translator: Arc<dyn Translator>,
    enveloper: Arc<dyn Enveloper>,
    splitter: Arc<dyn Splitter>,
    notifier: Arc<dyn Notifier>,
    command_line: String,
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("ledger", &self.ledger.as_ref().map(|_| "..."))
            .field("catalog", &self.catalog.as_ref().map(|_| "..."))
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ledger: None,
            catalog: None,
            channels: ChannelRegistry::with_builtin(),
            hooks: HookRegistry::new(),
            engine_script: None,
            translator: Arc::new(NoTranslator),
            enveloper: Arc::new(OneToOneEnveloper),
            splitter: Arc::new(NoSplitter),
            notifier: Arc::new(LogNotifier),
            command_line: String::new(),
        }
    }

    /// Use one SQLite store for both the ledger and the catalog.
    pub fn store(mut self, store: Arc<SqliteLedgerStore>) -> Self {
        self.ledger = Some(store.clone());
        self.catalog = Some(store);
        self
    }

    pub fn ledger_store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.ledger = Some(store);
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn CatalogStore>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Replace the channel drivers. Default: `file` and `trash`.
    pub fn channels(mut self, channels: ChannelRegistry) -> Self {
        self.channels = channels;
        self
    }

    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// Script called around the run commands of an invocation.
    pub fn engine_script(mut self, script: Arc<dyn EngineScript>) -> Self {
        self.engine_script = Some(script);
        self
    }

    pub fn translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn enveloper(mut self, enveloper: Arc<dyn Enveloper>) -> Self {
        self.enveloper = enveloper;
        self
    }

    pub fn splitter(mut self, splitter: Arc<dyn Splitter>) -> Self {
        self.splitter = splitter;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Command line recorded in run reports.
    pub fn command_line(mut self, command_line: impl Into<String>) -> Self {
        self.command_line = command_line.into();
        self
    }

    /// Returns an error if the ledger or catalog store is missing.
    pub fn build(self) -> Result<Engine, EngineError> {
        let ledger = self
            .ledger
            .ok_or_else(|| EngineError::Configuration("ledger store is required".to_string()))?;
        let catalog = self
            .catalog
            .ok_or_else(|| EngineError::Configuration("catalog store is required".to_string()))?;
        Ok(Engine {
            content: ContentStore::new(self.config.data_dir.clone()),
            ledger: Ledger::new(ledger),
            catalog,
            channels: self.channels,
            hooks: self.hooks,
            engine_script: self.engine_script,
            translator: self.translator,
            enveloper: self.enveloper,
            splitter: self.splitter,
            notifier: self.notifier,
            command_line: self.command_line,
            config: self.config,
        })
    }
}

/// Shared state of one engine invocation.
pub struct Engine {
    config: Config,
    ledger: Ledger,
    catalog: Arc<dyn CatalogStore>,
    content: ContentStore,
    channels: ChannelRegistry,
    hooks: HookRegistry,
    engine_script: Option<Arc<dyn EngineScript>>,
    translator: Arc<dyn Translator>,
    enveloper: Arc<dyn Enveloper>,
    splitter: Arc<dyn Splitter>,
    notifier: Arc<dyn Notifier>,
    command_line: String,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("content", &self.content)
            .field("hooks", &self.hooks)
            .field("command_line", &self.command_line)
            .finish()
    }
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn catalog(&self) -> &dyn CatalogStore {
        self.catalog.as_ref()
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn engine_script(&self) -> Option<&Arc<dyn EngineScript>> {
        self.engine_script.as_ref()
    }

    pub fn translator(&self) -> &dyn Translator {
        self.translator.as_ref()
    }

    pub fn enveloper(&self) -> &dyn Enveloper {
        self.enveloper.as_ref()
    }

    pub fn splitter(&self) -> &dyn Splitter {
        self.splitter.as_ref()
    }

    pub fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;

    #[test]
    fn test_build_requires_store() {
        let err = Engine::builder(Config::new("sqlite::memory:"))
            .build()
            .unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[tokio::test]
    async fn test_build_with_sqlite_store() {
        let store = Arc::new(SqliteLedgerStore::new(test_pool().await));
        let engine = Engine::builder(Config::new("sqlite::memory:"))
            .store(store)
            .command_line("edirelay --new")
            .build()
            .unwrap();
        assert!(engine.channels().contains("file"));
        assert_eq!(engine.command_line(), "edirelay --new");
        assert!(engine.catalog().route_names(false).await.unwrap().is_empty());
    }
}
