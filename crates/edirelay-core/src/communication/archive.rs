// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Archiving of transferred payloads.
//!
//! Files go to `<archive path>/<YYYYMMDD>/<name>`, or into
//! `<archive path>/<YYYYMMDD>.zip` when zip archiving is on.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::Transferred;
use crate::catalog::Channel;
use crate::config::Config;
use crate::error::CommunicationError;
use crate::storage::ContentStore;

/// Channel types whose external names are file names.
const FILE_LIKE: &[&str] = &["file"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOptions {
    pub root: PathBuf,
    pub external_name: bool,
    pub zip: bool,
}

impl ArchiveOptions {
    pub fn from_config(config: &Config, channel: &Channel) -> Self {
        // External names are only meaningful when the channel names its files.
        let external_name = config.archive_external_name
            && !channel.filename.is_empty()
            && FILE_LIKE.contains(&channel.kind.as_str());
        Self {
            root: PathBuf::from(&channel.archive_path),
            external_name,
            zip: config.archive_zip,
        }
    }
}

/// Archive name for one transferred item.
fn entry_name(item: &Transferred, external_name: bool) -> String {
    if external_name {
        let base = Path::new(&item.external_name)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        if let Some(base) = base.filter(|b| !b.is_empty()) {
            return base;
        }
    }
    item.blob.clone()
}

/// `name.ext` becomes `name_HHMMSS.ext`.
fn with_time_suffix(name: &str, now: NaiveDateTime) -> String {
    let suffix = now.format("_%H%M%S");
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}{suffix}.{ext}"),
        _ => format!("{name}{suffix}"),
    }
}

/// Copy transferred payloads into the archive. Returns the number archived.
pub async fn archive(
    content: &ContentStore,
    channel: &Channel,
    items: &[Transferred],
    options: &ArchiveOptions,
) -> Result<usize, CommunicationError> {
    let entries: Vec<(PathBuf, String)> = items
        .iter()
        .map(|item| (content.path(&item.blob), entry_name(item, options.external_name)))
        .collect();
    let options = options.clone();
    let now = Local::now().naive_local();
    let archived = tokio::task::spawn_blocking(move || write_archive(&options, &entries, now))
        .await
        .map_err(|e| CommunicationError::Io(std::io::Error::other(e)))??;
    debug!(channel = %channel.id, archived, "Archived transferred files");
    Ok(archived)
}

fn write_archive(
    options: &ArchiveOptions,
    entries: &[(PathBuf, String)],
    now: NaiveDateTime,
) -> Result<usize, CommunicationError> {
    let day = now.format("%Y%m%d").to_string();
    if options.zip {
        fs::create_dir_all(&options.root)?;
        let path = options.root.join(format!("{day}.zip"));
        let mut zip = if path.exists() {
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            ZipWriter::new_append(file)?
        } else {
            ZipWriter::new(File::create(&path)?)
        };
        let file_options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (source, name) in entries {
            zip.start_file(name.as_str(), file_options)?;
            zip.write_all(&fs::read(source)?)?;
        }
        zip.finish()?;
    } else {
        let dir = options.root.join(&day);
        fs::create_dir_all(&dir)?;
        for (source, name) in entries {
            let mut target = dir.join(name);
            if target.exists() {
                target = dir.join(with_time_suffix(name, now));
            }
            fs::copy(source, target)?;
        }
    }
    Ok(entries.len())
}
