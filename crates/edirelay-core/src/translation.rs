// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Translation, enveloping and splitting.
//!
//! The actual EDI grammars and mappings live outside the core behind the
//! [`Translator`], [`Enveloper`] and [`Splitter`] traits. The functions in this
//! module select the rows a route part works on, hand the payloads to those
//! implementations and record every result as ledger rows.

use std::io::{Cursor, Read, Write};

use async_trait::async_trait;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::catalog::{RoutePart, ZipMode};
use crate::error::TranslateError;
use crate::ledger::Ledger;
use crate::persistence::{Outcome, Stage, TaChanges, TaFilter, TaRecord};
use crate::process::ProcessCtx;
use crate::storage::ContentStore;

/// Everything a stage needs to read and record rows of one route part.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub ledger: &'a Ledger,
    pub content: &'a ContentStore,
    pub ctx: &'a ProcessCtx,
    pub part: &'a RoutePart,
    /// Rows at or below this id belong to earlier runs.
    pub scope: i64,
}

impl StageContext<'_> {
    async fn payload(&self, row: &TaRecord) -> Result<Vec<u8>, TranslateError> {
        Ok(self.content.read(&row.filename).await?)
    }

    /// Derive a row from `source` and store `payload` as its content.
    async fn store_child(
        &self,
        source: i64,
        stage: Stage,
        fields: TaChanges,
        payload: &[u8],
    ) -> Result<i64, TranslateError> {
        let id = self
            .ledger
            .copy_forward(self.ctx, source, stage, fields)
            .await?;
        self.finish_stored(id, payload).await?;
        Ok(id)
    }

    async fn finish_stored(&self, id: i64, payload: &[u8]) -> Result<(), TranslateError> {
        let blob = ContentStore::name_for(id);
        let changes = match self.content.write(&blob, payload).await {
            Ok(size) => TaChanges {
                outcome: Some(Outcome::Ok),
                filename: Some(blob),
                filesize: Some(size as i64),
                ..Default::default()
            },
            Err(err) => TaChanges::error(format!("storing content failed: {err}")),
        };
        self.ledger.update(id, &changes).await?;
        Ok(())
    }

    fn incoming(&self, stage: Stage) -> TaFilter {
        TaFilter::stage(stage)
            .with_outcome(Outcome::Ok)
            .above(self.scope)
            .route(self.part.route.clone())
    }
}

/// A translated message.
#[derive(Debug, Clone, Default)]
pub struct TranslatedMessage {
    /// Attributes of the translated row (edi type, message type, partners, ...).
    pub fields: TaChanges,
    pub payload: Vec<u8>,
}

/// A message that failed to translate. Its siblings are unaffected.
#[derive(Debug, Clone, Default)]
pub struct MessageFailure {
    pub fields: TaChanges,
    pub reason: String,
}

/// Output of splitting a compound file.
#[derive(Debug, Clone, Default)]
pub struct SplitItem {
    pub fields: TaChanges,
    pub payload: Vec<u8>,
}

/// One merged/enveloped output file.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Translated rows combined into this envelope.
    pub contributors: Vec<i64>,
    pub fields: TaChanges,
    pub payload: Vec<u8>,
}

/// Maps one stored file to translated messages.
#[async_trait]
pub trait Translator: Send + Sync {
    /// An `Err` rejects the file as a whole; per-message failures go into the
    /// returned list.
    async fn translate(
        &self,
        stage: &StageContext<'_>,
        row: &TaRecord,
        payload: &[u8],
    ) -> Result<Vec<Result<TranslatedMessage, MessageFailure>>, TranslateError>;
}

/// Combines translated messages into outgoing files.
#[async_trait]
pub trait Enveloper: Send + Sync {
    async fn envelope(
        &self,
        stage: &StageContext<'_>,
        rows: &[TaRecord],
    ) -> Result<Vec<Envelope>, TranslateError>;
}

/// Splits a compound wire file (mailbag, several interchanges) into parts.
#[async_trait]
pub trait Splitter: Send + Sync {
    /// An empty result leaves the file as it is.
    async fn split(
        &self,
        stage: &StageContext<'_>,
        row: &TaRecord,
        payload: &[u8],
    ) -> Result<Vec<SplitItem>, TranslateError>;
}

/// Used when no translator is configured: every file fails with a
/// configuration message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTranslator;

#[async_trait]
impl Translator for NoTranslator {
    async fn translate(
        &self,
        stage: &StageContext<'_>,
        row: &TaRecord,
        _payload: &[u8],
    ) -> Result<Vec<Result<TranslatedMessage, MessageFailure>>, TranslateError> {
        Err(TranslateError::Mapping(format!(
            "no translation for editype '{}' messagetype '{}' in route '{}'",
            row.editype, row.messagetype, stage.part.route
        )))
    }
}

/// Files are never split.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSplitter;

#[async_trait]
impl Splitter for NoSplitter {
    async fn split(
        &self,
        _stage: &StageContext<'_>,
        _row: &TaRecord,
        _payload: &[u8],
    ) -> Result<Vec<SplitItem>, TranslateError> {
        Ok(Vec::new())
    }
}

/// Every translated message becomes an outgoing file of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct OneToOneEnveloper;

#[async_trait]
impl Enveloper for OneToOneEnveloper {
    async fn envelope(
        &self,
        stage: &StageContext<'_>,
        rows: &[TaRecord],
    ) -> Result<Vec<Envelope>, TranslateError> {
        let mut envelopes = Vec::with_capacity(rows.len());
        for row in rows {
            envelopes.push(Envelope {
                contributors: vec![row.id],
                fields: TaChanges {
                    nrmessages: Some(1),
                    ..carried_fields(row)
                },
                payload: stage.payload(row).await?,
            });
        }
        Ok(envelopes)
    }
}

/// Descriptive attributes a merged row inherits from a contributor.
pub fn carried_fields(row: &TaRecord) -> TaChanges {
    TaChanges {
        route: Some(row.route.clone()),
        from_partner: Some(row.from_partner.clone()),
        to_partner: Some(row.to_partner.clone()),
        editype: Some(row.editype.clone()),
        messagetype: Some(row.messagetype.clone()),
        alt: Some(row.alt.clone()),
        testindicator: Some(row.testindicator.clone()),
        reference: Some(row.reference.clone()),
        charset: Some(row.charset.clone()),
        contenttype: Some(row.contenttype.clone()),
        ..Default::default()
    }
}

/// Reject a whole file: everything derived from it goes, the row itself
/// becomes an error.
async fn kill_whole_file(
    stage: &StageContext<'_>,
    row: &TaRecord,
    reason: &str,
) -> Result<(), TranslateError> {
    let removed = stage.ledger.delete_descendants(row.id).await?;
    warn!(row = row.id, removed, reason, "Whole file rejected");
    stage
        .ledger
        .update(row.id, &TaChanges::error(reason))
        .await?;
    Ok(())
}

/// Split received files of the route part. Returns the number of files split.
pub async fn split_incoming(
    stage: &StageContext<'_>,
    splitter: &dyn Splitter,
) -> Result<u64, TranslateError> {
    let filter = stage
        .incoming(Stage::FileIn)
        .from_channel(stage.part.from_channel.clone());
    let mut split = 0;
    for row in stage.ledger.select(&filter).await? {
        let payload = stage.payload(&row).await?;
        match splitter.split(stage, &row, &payload).await {
            Ok(items) if items.is_empty() => {}
            Ok(items) => {
                stage
                    .ledger
                    .update(row.id, &TaChanges::outcome(Outcome::Done))
                    .await?;
                for item in items {
                    stage
                        .store_child(row.id, Stage::FileIn, item.fields, &item.payload)
                        .await?;
                }
                split += 1;
            }
            Err(TranslateError::KillWholeFile(reason)) => {
                kill_whole_file(stage, &row, &reason).await?
            }
            Err(err) => {
                stage
                    .ledger
                    .update(row.id, &TaChanges::error(err.to_string()))
                    .await?;
            }
        }
    }
    Ok(split)
}

/// Translate stored files of the route part into translated rows. Returns the
/// number of files handled.
pub async fn translate_incoming(
    stage: &StageContext<'_>,
    translator: &dyn Translator,
) -> Result<u64, TranslateError> {
    let mut handled = 0;
    for row in stage.ledger.select(&stage.incoming(Stage::FileIn)).await? {
        handled += 1;
        let payload = stage.payload(&row).await?;
        let messages = match translator.translate(stage, &row, &payload).await {
            Ok(messages) => messages,
            Err(TranslateError::KillWholeFile(reason)) => {
                kill_whole_file(stage, &row, &reason).await?;
                continue;
            }
            Err(err) => {
                debug!(row = row.id, error = %err, "Translation failed");
                stage
                    .ledger
                    .update(row.id, &TaChanges::error(err.to_string()))
                    .await?;
                continue;
            }
        };

        stage
            .ledger
            .update(row.id, &TaChanges::outcome(Outcome::Done))
            .await?;
        for message in messages {
            match message {
                Ok(message) => {
                    stage
                        .store_child(row.id, Stage::Translated, message.fields, &message.payload)
                        .await?;
                }
                Err(failure) => {
                    let fields = TaChanges {
                        outcome: Some(Outcome::Error),
                        error_text: Some(failure.reason),
                        ..failure.fields
                    };
                    stage
                        .ledger
                        .copy_forward(stage.ctx, row.id, Stage::SplitUp, fields)
                        .await?;
                }
            }
        }
    }
    Ok(handled)
}

/// Merge translated rows of the route part into merged rows. Returns the
/// number of merged rows created.
pub async fn merge_translated(
    stage: &StageContext<'_>,
    enveloper: &dyn Enveloper,
) -> Result<u64, TranslateError> {
    let rows = stage.ledger.select(&stage.incoming(Stage::Translated)).await?;
    if rows.is_empty() {
        return Ok(0);
    }
    let envelopes = match enveloper.envelope(stage, &rows).await {
        Ok(envelopes) => envelopes,
        Err(err) => {
            let text = err.to_string();
            for row in &rows {
                stage
                    .ledger
                    .update(row.id, &TaChanges::error(text.clone()))
                    .await?;
            }
            return Ok(0);
        }
    };

    let mut merged = 0;
    for envelope in envelopes {
        let fields = TaChanges {
            route: Some(stage.part.route.clone()),
            ..envelope.fields
        };
        let id = stage
            .ledger
            .merge(stage.ctx, &envelope.contributors, Stage::Merged, fields)
            .await?;
        stage.finish_stored(id, &envelope.payload).await?;
        merged += 1;
    }
    Ok(merged)
}

/// Unzips received zip files into one stored row per archive entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipPreprocessor;

impl ZipPreprocessor {
    /// Returns the number of archives unpacked. With [`ZipMode::Always`] a
    /// file that is not a zip archive becomes an error; with
    /// [`ZipMode::IfZipped`] it passes unchanged.
    pub async fn unzip(&self, stage: &StageContext<'_>, mode: ZipMode) -> Result<u64, TranslateError> {
        if mode == ZipMode::None {
            return Ok(0);
        }
        let filter = stage
            .incoming(Stage::FileIn)
            .from_channel(stage.part.from_channel.clone());
        let mut unpacked = 0;
        for row in stage.ledger.select(&filter).await? {
            let payload = stage.payload(&row).await?;
            let entries = match read_zip(&payload) {
                Ok(entries) => entries,
                Err(_) if mode == ZipMode::IfZipped => continue,
                Err(err) => {
                    stage
                        .ledger
                        .update(row.id, &TaChanges::error(format!("not a zip archive: {err}")))
                        .await?;
                    continue;
                }
            };
            stage
                .ledger
                .update(row.id, &TaChanges::outcome(Outcome::Done))
                .await?;
            for (_name, content) in entries {
                stage
                    .store_child(row.id, Stage::FileIn, TaChanges::default(), &content)
                    .await?;
            }
            unpacked += 1;
        }
        Ok(unpacked)
    }

    /// Wrap each outgoing file of the part's channel into its own zip archive.
    ///
    /// The archive row is marked wrapped, so a resend starts again from the
    /// plain file and zips it anew.
    pub async fn zip(&self, stage: &StageContext<'_>) -> Result<u64, TranslateError> {
        let filter = TaFilter::stage(Stage::FileOut)
            .with_outcome(Outcome::Ok)
            .above(stage.scope)
            .to_channel(stage.part.to_channel.clone());
        let mut zipped = 0;
        for row in stage.ledger.select(&filter).await? {
            if row.wrapped {
                continue;
            }
            let payload = stage.payload(&row).await?;
            let archive = write_zip(&row.filename, &payload)?;
            let id = stage
                .ledger
                .advance(
                    stage.ctx,
                    row.id,
                    Stage::FileOut,
                    TaChanges {
                        contenttype: Some("application/zip".to_string()),
                        wrapped: Some(true),
                        ..Default::default()
                    },
                )
                .await?;
            stage.finish_stored(id, &archive).await?;
            zipped += 1;
        }
        Ok(zipped)
    }
}

fn read_zip(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>, TranslateError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let mut content = Vec::new();
        file.read_to_end(&mut content)?;
        entries.push((file.name().to_string(), content));
    }
    Ok(entries)
}

fn write_zip(name: &str, content: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut zip = ZipWriter::new(&mut buffer);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file(name, options)?;
        zip.write_all(content)?;
        zip.finish()?;
    }
    Ok(buffer.into_inner())
}
