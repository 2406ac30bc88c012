// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content store for EDI payloads.
//!
//! Payloads of stored rows live on disk, named after the ledger id of the row
//! that first stored them: `<data dir>/<id / 1000>/<id>`.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Blob name for a ledger id.
    pub fn name_for(id: i64) -> String {
        id.to_string()
    }

    /// Absolute path of a blob. Names that are not ledger ids go into the root.
    pub fn path(&self, name: &str) -> PathBuf {
        match name.parse::<i64>() {
            Ok(id) => self.root.join((id / 1000).to_string()).join(name),
            Err(_) => self.root.join(name),
        }
    }

    pub async fn write(&self, name: &str, content: &[u8]) -> io::Result<u64> {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(content.len() as u64)
    }

    pub async fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.path(name)).await
    }

    pub async fn size(&self, name: &str) -> io::Result<u64> {
        Ok(tokio::fs::metadata(self.path(name)).await?.len())
    }

    /// Remove a blob; a missing blob is not an error.
    pub async fn remove(&self, name: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path(name)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
