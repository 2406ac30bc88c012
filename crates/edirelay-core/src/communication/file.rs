// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in `file` and `trash` drivers.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::format::{Item, StrftimeItems};
use chrono::{Local, NaiveDateTime};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{CommunicationSession, SessionIo};
use crate::catalog::Channel;
use crate::error::CommunicationError;
use crate::persistence::TaRecord;

const OVERWRITE: &str = "{overwrite}";

/// Expand an outgoing filename template for `row`.
///
/// Placeholders: `{id}` (also written `*`), `{editype}`, `{messagetype}`,
/// `{topartner}`, `{frompartner}`, `{reference}`, `{alt}`,
/// `{datetime}` / `{datetime:<strftime>}` and `{infile}` / `{infile:name}` /
/// `{infile:ext}` for the name the content was received under.
pub fn format_filename(
    template: &str,
    row: &TaRecord,
    infile: &str,
    now: NaiveDateTime,
) -> Result<String, CommunicationError> {
    let template = template.replace('*', "{id}");
    let invalid = |reason: String| {
        CommunicationError::Transfer(format!("filename template '{template}': {reason}"))
    };

    let mut out = String::with_capacity(template.len());
    let mut rest = template.as_str();
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| invalid("unclosed placeholder".to_string()))?;
        let placeholder = &after[..end];
        let (key, spec) = match placeholder.split_once(':') {
            Some((key, spec)) => (key, Some(spec)),
            None => (placeholder, None),
        };
        let infile_base = Path::new(infile)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let value = match (key, spec) {
            ("id", None) => row.id.to_string(),
            ("editype", None) => row.editype.clone(),
            ("messagetype", None) => row.messagetype.clone(),
            ("topartner", None) => row.to_partner.clone(),
            ("frompartner", None) => row.from_partner.clone(),
            ("reference", None) => row.reference.clone(),
            ("alt", None) => row.alt.clone(),
            ("datetime", spec) => {
                let items: Vec<Item<'_>> =
                    StrftimeItems::new(spec.unwrap_or("%Y%m%d%H%M%S")).collect();
                if items.iter().any(|item| matches!(item, Item::Error)) {
                    return Err(invalid(format!("bad datetime format '{placeholder}'")));
                }
                now.format_with_items(items.into_iter()).to_string()
            }
            ("infile", None) => infile_base,
            ("infile", Some("name")) => match infile_base.rsplit_once('.') {
                Some((name, _)) => name.to_string(),
                None => infile_base,
            },
            ("infile", Some("ext")) => infile_base
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_string())
                .unwrap_or_default(),
            _ => return Err(invalid(format!("unknown placeholder '{{{placeholder}}}'"))),
        };
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Directory-based channel.
///
/// Inbound: every file matching `path/filename` (a glob) is received, in name
/// order. Outbound: each row is written to `path/<expanded filename>`,
/// appending unless the template contains `{overwrite}`.
pub struct FileSession {
    channel: Channel,
    lock: Option<PathBuf>,
}

impl FileSession {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            lock: None,
        }
    }

    fn template(&self) -> (String, bool) {
        let template = match self.channel.filename.as_str() {
            "" => "*",
            name => name,
        };
        let overwrite = template.contains(OVERWRITE);
        (template.replace(OVERWRITE, ""), overwrite)
    }

    /// Remove a received file from the directory when the channel says so.
    async fn take(&self, path: &Path) -> std::io::Result<()> {
        if self.channel.remove {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn write_one(
        &self,
        io: &SessionIo<'_>,
        row: &TaRecord,
        template: &str,
        overwrite: bool,
    ) -> Result<String, CommunicationError> {
        let infile = if template.contains("{infile") {
            io.incoming_name(row).await?
        } else {
            String::new()
        };
        let name = format_filename(template, row, &infile, Local::now().naive_local())?;
        let target = Path::new(&self.channel.path).join(name);
        let payload = io.read_payload(row).await?;

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true);
        if overwrite {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let mut file = options.open(&target).await?;
        file.write_all(&payload).await?;
        file.flush().await?;
        Ok(target.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl CommunicationSession for FileSession {
    /// Takes the directory lock when the channel names one. An existing lock
    /// file means another party is using the directory.
    async fn connect(&mut self) -> Result<(), CommunicationError> {
        if self.channel.lockname.is_empty() {
            return Ok(());
        }
        let lock = Path::new(&self.channel.path).join(&self.channel.lockname);
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock)
            .await?;
        self.lock = Some(lock);
        Ok(())
    }

    async fn receive(&mut self, io: &mut SessionIo<'_>) -> Result<(), CommunicationError> {
        let mask = match self.channel.filename.as_str() {
            "" => "*",
            mask => mask,
        };
        let pattern = Path::new(&self.channel.path).join(mask);
        let mut files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        if let Some(lock) = &self.lock {
            files.retain(|path| path != lock);
        }

        for path in files {
            let name = path.to_string_lossy().into_owned();
            match tokio::fs::read(&path).await {
                Ok(payload) => match io.record_received(&name, &payload).await {
                    Ok(stored) => match self.take(&path).await {
                        Ok(()) => debug!(file = %name, stored, "Received file"),
                        Err(err) => {
                            warn!(file = %name, error = %err, "Cannot remove received file, receiving it later");
                            io.withdraw_received(stored).await?;
                            io.record_receive_failure(&name, &format!("cannot remove file: {err}"))
                                .await?;
                        }
                    },
                    Err(err) => io.record_receive_failure(&name, &err.to_string()).await?,
                },
                Err(err) => io.record_receive_failure(&name, &err.to_string()).await?,
            }
            if io.time_is_up() {
                warn!(channel = %self.channel.id, "Time limit reached, remaining files left for the next run");
                break;
            }
        }
        Ok(())
    }

    async fn send(&mut self, io: &mut SessionIo<'_>) -> Result<(), CommunicationError> {
        tokio::fs::create_dir_all(&self.channel.path).await?;
        let (template, overwrite) = self.template();
        for row in io.pending_outgoing().await? {
            let sent = io.begin_send(&row).await?;
            match self.write_one(io, &row, &template, overwrite).await {
                Ok(target) => io.record_sent(sent, &row, &target).await?,
                Err(err) => {
                    warn!(row = row.id, error = %err, "Sending file failed");
                    io.record_send_failure(sent, &err.to_string()).await?
                }
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), CommunicationError> {
        if let Some(lock) = self.lock.take() {
            tokio::fs::remove_file(lock).await?;
        }
        Ok(())
    }
}

/// Outbound channel that discards everything it is given.
pub struct TrashSession;

#[async_trait]
impl CommunicationSession for TrashSession {
    async fn send(&mut self, io: &mut SessionIo<'_>) -> Result<(), CommunicationError> {
        for row in io.pending_outgoing().await? {
            io.record_discarded(&row).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Direction;
    use crate::persistence::{Outcome, Stage, TaChanges, TaFilter};
    use crate::process::ProcessCtx;
    use crate::storage::ContentStore;
    use crate::test_support::test_ledger;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 23)
            .unwrap()
            .and_hms_opt(1, 23, 45)
            .unwrap()
    }

    async fn outgoing_row() -> TaRecord {
        let ledger = test_ledger().await;
        let id = ledger
            .create_root(
                &ProcessCtx::root(),
                Stage::FileOut,
                TaChanges {
                    editype: Some("edifact".to_string()),
                    messagetype: Some("INVOIC".to_string()),
                    to_partner: Some("buyer".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        ledger.get(id).await.unwrap()
    }

    #[tokio::test]
    async fn test_format_filename() {
        let row = outgoing_row().await;
        let name = format_filename(
            "{topartner}/{messagetype}_*_{datetime:%Y%m%d}.{infile:ext}",
            &row,
            "/in/orders.edi",
            now(),
        )
        .unwrap();
        assert_eq!(name, format!("buyer/INVOIC_{}_20250123.edi", row.id));
        assert_eq!(
            format_filename("{infile:name}.txt", &row, "/in/orders.edi", now()).unwrap(),
            "orders.txt"
        );
        assert_eq!(
            format_filename("{datetime}", &row, "", now()).unwrap(),
            "20250123012345"
        );
    }

    #[tokio::test]
    async fn test_format_filename_rejects_unknown_placeholder() {
        let row = outgoing_row().await;
        assert!(format_filename("{botskey}.edi", &row, "", now()).is_err());
        assert!(format_filename("{id", &row, "", now()).is_err());
    }

    #[tokio::test]
    async fn test_receive_and_send_through_directories() {
        let ledger = test_ledger().await;
        let data = tempfile::tempdir().unwrap();
        let inbox = tempfile::tempdir().unwrap();
        let outbox = tempfile::tempdir().unwrap();
        let content = ContentStore::new(data.path());
        let ctx = ProcessCtx::root().with_route("orders");
        std::fs::write(inbox.path().join("a.edi"), b"A").unwrap();
        std::fs::write(inbox.path().join("b.edi"), b"B").unwrap();
        std::fs::write(inbox.path().join("skip.txt"), b"C").unwrap();

        let inbound = Channel {
            id: "file_in".to_string(),
            direction: Direction::In,
            kind: "file".to_string(),
            path: inbox.path().to_string_lossy().into_owned(),
            filename: "*.edi".to_string(),
            remove: true,
            ..Default::default()
        };
        let mut io = SessionIo::new(&ledger, &content, &ctx, &inbound, 0);
        let mut session = FileSession::new(inbound.clone());
        session.connect().await.unwrap();
        session.receive(&mut io).await.unwrap();
        session.disconnect().await.unwrap();

        assert_eq!(io.transferred().len(), 2);
        assert!(!inbox.path().join("a.edi").exists());
        assert!(inbox.path().join("skip.txt").exists());

        // Hand the received rows straight to the outbound channel.
        let stored = ledger
            .select(&TaFilter::stage(Stage::FileIn).with_outcome(Outcome::Ok))
            .await
            .unwrap();
        for row in &stored {
            ledger
                .advance(
                    &ctx,
                    row.id,
                    Stage::FileOut,
                    TaChanges {
                        outcome: Some(Outcome::Ok),
                        to_channel: Some("file_out".to_string()),
                        filename: Some(row.filename.clone()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let outbound = Channel {
            id: "file_out".to_string(),
            direction: Direction::Out,
            kind: "file".to_string(),
            path: outbox.path().to_string_lossy().into_owned(),
            filename: "{infile:name}.out".to_string(),
            ..Default::default()
        };
        let mut io = SessionIo::new(&ledger, &content, &ctx, &outbound, 0);
        FileSession::new(outbound.clone()).send(&mut io).await.unwrap();

        assert_eq!(std::fs::read(outbox.path().join("a.out")).unwrap(), b"A");
        assert_eq!(std::fs::read(outbox.path().join("b.out")).unwrap(), b"B");
        let sent = ledger
            .select(&TaFilter::stage(Stage::ExternOut).with_outcome(Outcome::Done))
            .await
            .unwrap();
        assert_eq!(sent.len(), 2);
    }

    #[tokio::test]
    async fn test_lock_file_blocks_second_session() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Channel {
            kind: "file".to_string(),
            path: dir.path().to_string_lossy().into_owned(),
            lockname: "busy.lock".to_string(),
            ..Default::default()
        };
        let mut first = FileSession::new(channel.clone());
        first.connect().await.unwrap();
        assert!(FileSession::new(channel.clone()).connect().await.is_err());
        first.disconnect().await.unwrap();
        assert!(!dir.path().join("busy.lock").exists());
    }
}
