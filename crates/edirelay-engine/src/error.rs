// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup and driver errors.

use edirelay_core::catalog::CatalogError;
use edirelay_core::config::ConfigError;
use edirelay_core::error::LedgerError;
use edirelay_core::EngineError;

/// Errors that end an engine invocation.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("another engine instance is running (port {port} is in use)")]
    AlreadyRunning { port: u16 },

    #[error("cannot bind liveness port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger database error: {0}")]
    Database(#[from] LedgerError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("the ledger database failed its integrity check")]
    DamagedStore,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl DriverError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::AlreadyRunning { .. } => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(DriverError::AlreadyRunning { port: 28081 }.exit_code(), 3);
        assert_eq!(DriverError::DamagedStore.exit_code(), 1);
        assert_eq!(
            DriverError::Config(ConfigError::Missing("EDIRELAY_DATABASE_URL")).exit_code(),
            1
        );
    }
}
