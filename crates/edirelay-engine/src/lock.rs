// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-instance guards.
//!
//! Two independent mechanisms keep a second engine from running against the
//! same configuration: a TCP port bound on 127.0.0.1 for as long as the
//! process lives, and a marker row in the ledger database that is removed at
//! a clean exit. A marker found at startup means the previous run crashed.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use edirelay_core::persistence::LedgerStore;

use crate::error::DriverError;

/// Holds the liveness port until dropped.
#[derive(Debug)]
pub struct LivenessLock {
    listener: TcpListener,
}

impl LivenessLock {
    pub async fn acquire(port: u16) -> Result<Self, DriverError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match TcpListener::bind(addr).await {
            Ok(listener) => Ok(Self { listener }),
            Err(err) if err.kind() == ErrorKind::AddrInUse => {
                warn!(port, "Liveness port busy, another engine is running");
                Err(DriverError::AlreadyRunning { port })
            }
            Err(source) => Err(DriverError::Bind { port, source }),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

/// State of the crash marker at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    /// Marker inserted; the previous run ended cleanly.
    Clean,
    /// Marker was still present: the previous run crashed.
    Crashed,
}

/// The crash marker row, removed with [`RunMarker::release`].
pub struct RunMarker {
    store: Arc<dyn LedgerStore>,
}

impl RunMarker {
    /// Insert the marker. A marker left behind triggers an integrity check of
    /// the database; a damaged database is fatal.
    pub async fn acquire(store: Arc<dyn LedgerStore>) -> Result<(Self, MarkerState), DriverError> {
        if store.acquire_run_marker().await? {
            return Ok((Self { store }, MarkerState::Clean));
        }
        if !store.integrity_check().await? {
            error!("Ledger database is damaged, manual action is needed");
            return Err(DriverError::DamagedStore);
        }
        warn!("Previous engine run ended unexpectedly, crash recovery will run first");
        Ok((Self { store }, MarkerState::Crashed))
    }

    pub async fn release(self) -> Result<(), DriverError> {
        self.store.release_run_marker().await?;
        info!("Run marker released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edirelay_core::SqliteLedgerStore;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> Arc<dyn LedgerStore> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        edirelay_core::migrations::run_sqlite(&pool).await.unwrap();
        Arc::new(SqliteLedgerStore::new(pool))
    }

    #[tokio::test]
    async fn test_second_lock_on_same_port_fails() {
        let first = LivenessLock::acquire(0).await.unwrap();
        let port = first.local_addr().unwrap().port();
        let second = LivenessLock::acquire(port).await;
        assert!(matches!(second, Err(DriverError::AlreadyRunning { port: p }) if p == port));
        drop(first);
        assert!(LivenessLock::acquire(port).await.is_ok());
    }

    #[tokio::test]
    async fn test_marker_left_behind_means_crash() {
        let store = store().await;
        let (marker, state) = RunMarker::acquire(store.clone()).await.unwrap();
        assert_eq!(state, MarkerState::Clean);
        drop(marker);

        let (marker, state) = RunMarker::acquire(store.clone()).await.unwrap();
        assert_eq!(state, MarkerState::Crashed);
        marker.release().await.unwrap();

        let (_, state) = RunMarker::acquire(store).await.unwrap();
        assert_eq!(state, MarkerState::Clean);
    }
}
