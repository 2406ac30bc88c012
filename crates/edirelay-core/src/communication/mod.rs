// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Communication sessions.
//!
//! A driver implements [`CommunicationSession`] for one protocol and is
//! registered under its channel type in a [`ChannelRegistry`]. Drivers never
//! touch the ledger directly: every transferred item goes through
//! [`SessionIo`], which performs the matching row transition.
//!
//! [`run_channel`] owns the session lifecycle: connect with retries, transfer,
//! best-effort disconnect, then archive what was transferred.

pub mod archive;
pub mod file;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::catalog::{Channel, Direction};
use crate::commands::Command;
use crate::error::{CommunicationError, EngineError};
use crate::ledger::Ledger;
use crate::persistence::{Outcome, Stage, TaChanges, TaFilter, TaRecord};
use crate::process::{ProcessCtx, record_process_error};
use crate::runtime::Engine;
use crate::storage::ContentStore;

pub use self::file::{FileSession, TrashSession};

/// One protocol session for one channel.
///
/// A session is created fresh for every connect attempt and used for at most
/// one transfer.
#[async_trait]
pub trait CommunicationSession: Send {
    async fn connect(&mut self) -> Result<(), CommunicationError> {
        Ok(())
    }

    /// Fetch everything available and record each item with
    /// [`SessionIo::record_received`].
    async fn receive(&mut self, _io: &mut SessionIo<'_>) -> Result<(), CommunicationError> {
        Ok(())
    }

    /// Deliver [`SessionIo::pending_outgoing`] rows, recording each one as sent
    /// or failed.
    async fn send(&mut self, _io: &mut SessionIo<'_>) -> Result<(), CommunicationError> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), CommunicationError> {
        Ok(())
    }
}

/// Builds a session for a configured channel.
pub type SessionFactory = Arc<dyn Fn(&Channel) -> Box<dyn CommunicationSession> + Send + Sync>;

/// Channel type name to driver.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    factories: HashMap<String, SessionFactory>,
}

impl ChannelRegistry {
    /// Registry without any driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `file` and `trash` drivers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("file", |channel| Box::new(FileSession::new(channel.clone())));
        registry.register("trash", |_| Box::new(TrashSession));
        registry
    }

    /// Register (or replace) the driver for a channel type.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&Channel) -> Box<dyn CommunicationSession> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn create(
        &self,
        channel: &Channel,
    ) -> Result<Box<dyn CommunicationSession>, CommunicationError> {
        let factory = self
            .factories
            .get(&channel.kind)
            .ok_or_else(|| CommunicationError::UnknownChannelType(channel.kind.clone()))?;
        Ok(factory(channel))
    }
}

/// An item moved by a session, kept for archiving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transferred {
    /// Ledger row that records the transfer.
    pub ta: i64,
    /// Content blob holding the payload.
    pub blob: String,
    /// Name on the remote side.
    pub external_name: String,
}

/// Ledger access for drivers, scoped to one channel invocation.
pub struct SessionIo<'a> {
    ledger: &'a Ledger,
    content: &'a ContentStore,
    ctx: &'a ProcessCtx,
    channel: &'a Channel,
    scope: i64,
    started: Instant,
    max_duration: Option<Duration>,
    transferred: Vec<Transferred>,
}

impl<'a> SessionIo<'a> {
    pub fn new(
        ledger: &'a Ledger,
        content: &'a ContentStore,
        ctx: &'a ProcessCtx,
        channel: &'a Channel,
        scope: i64,
    ) -> Self {
        Self {
            ledger,
            content,
            ctx,
            channel,
            scope,
            started: Instant::now(),
            max_duration: None,
            transferred: Vec::new(),
        }
    }

    /// Limit the time spent receiving; checked between items.
    pub fn with_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.max_duration = limit;
        self
    }

    pub fn channel(&self) -> &Channel {
        self.channel
    }

    pub fn content(&self) -> &ContentStore {
        self.content
    }

    pub fn transferred(&self) -> &[Transferred] {
        &self.transferred
    }

    pub fn time_is_up(&self) -> bool {
        self.max_duration
            .is_some_and(|limit| self.started.elapsed() >= limit)
    }

    /// Store one received item.
    ///
    /// Creates the received-external root and its stored-internal child; the
    /// child is left `Ok` for the route to pick up. If the payload cannot be
    /// stored both rows are removed again. Returns the stored-internal row.
    pub async fn record_received(
        &mut self,
        external_name: &str,
        payload: &[u8],
    ) -> Result<i64, CommunicationError> {
        let fields = TaChanges {
            filename: Some(external_name.to_string()),
            from_channel: Some(self.channel.id.clone()),
            route: Some(self.ctx.route().to_string()),
            ..Default::default()
        };
        let external = self
            .ledger
            .create_root(self.ctx, Stage::ExternIn, fields)
            .await?;
        let stored = self
            .ledger
            .copy_forward(self.ctx, external, Stage::FileIn, TaChanges::default())
            .await?;

        let blob = ContentStore::name_for(stored);
        let size = match self.content.write(&blob, payload).await {
            Ok(size) => size,
            Err(err) => {
                self.ledger.delete(stored).await?;
                self.ledger.delete(external).await?;
                return Err(err.into());
            }
        };
        let changes = TaChanges {
            outcome: Some(Outcome::Ok),
            filename: Some(blob.clone()),
            filesize: Some(size as i64),
            ..Default::default()
        };
        self.ledger.update(stored, &changes).await?;
        self.ledger
            .update(external, &TaChanges::outcome(Outcome::Done))
            .await?;

        self.transferred.push(Transferred {
            ta: stored,
            blob,
            external_name: external_name.to_string(),
        });
        Ok(stored)
    }

    /// Take back an item stored by [`record_received`](Self::record_received)
    /// that stays at the remote side, so the next run receives it once more
    /// instead of twice. Both rows and the content blob are removed.
    pub async fn withdraw_received(&mut self, stored: i64) -> Result<(), CommunicationError> {
        let row = self.ledger.get(stored).await?;
        self.ledger.delete(stored).await?;
        if row.parent != 0 {
            self.ledger.delete(row.parent).await?;
        }
        self.content.remove(&row.filename).await?;
        self.transferred.retain(|t| t.ta != stored);
        Ok(())
    }

    /// Record an item that could not be received. The item has no rows, so
    /// the failure becomes a process error of the channel.
    pub async fn record_receive_failure(
        &self,
        external_name: &str,
        reason: &str,
    ) -> Result<(), CommunicationError> {
        let name = format!("{}-receive", self.channel.kind);
        let text = format!("{external_name}: {reason}");
        record_process_error(self.ledger, self.ctx, &name, &self.channel.id, &text).await?;
        Ok(())
    }

    /// Stored-outgoing rows waiting for this channel, oldest first.
    pub async fn pending_outgoing(&self) -> Result<Vec<TaRecord>, CommunicationError> {
        let filter = TaFilter::stage(Stage::FileOut)
            .with_outcome(Outcome::Ok)
            .above(self.scope)
            .to_channel(self.channel.id.clone());
        Ok(self.ledger.select(&filter).await?)
    }

    pub async fn read_payload(&self, row: &TaRecord) -> Result<Vec<u8>, CommunicationError> {
        Ok(self.content.read(&row.filename).await?)
    }

    /// Start sending `row`: the row is consumed and an open sent-external row
    /// is returned, to be closed with [`record_sent`](Self::record_sent) or
    /// [`record_send_failure`](Self::record_send_failure).
    pub async fn begin_send(&mut self, row: &TaRecord) -> Result<i64, CommunicationError> {
        let changes = TaChanges {
            number_of_resends: Some(row.number_of_resends + 1),
            ..Default::default()
        };
        Ok(self
            .ledger
            .advance(self.ctx, row.id, Stage::ExternOut, changes)
            .await?)
    }

    pub async fn record_sent(
        &mut self,
        sent: i64,
        source: &TaRecord,
        external_name: &str,
    ) -> Result<(), CommunicationError> {
        let changes = TaChanges {
            outcome: Some(Outcome::Done),
            filename: Some(external_name.to_string()),
            ..Default::default()
        };
        self.ledger.update(sent, &changes).await?;
        self.transferred.push(Transferred {
            ta: sent,
            blob: source.filename.clone(),
            external_name: external_name.to_string(),
        });
        Ok(())
    }

    /// Drop an outgoing row without transferring it.
    pub async fn record_discarded(&mut self, row: &TaRecord) -> Result<(), CommunicationError> {
        self.ledger
            .update(row.id, &TaChanges::outcome(Outcome::Done))
            .await?;
        Ok(())
    }

    /// External name of the received file `row` derives from, if any.
    pub async fn incoming_name(&self, row: &TaRecord) -> Result<String, CommunicationError> {
        Ok(self
            .ledger
            .origin(row.id, Stage::ExternIn)
            .await?
            .map(|origin| origin.filename)
            .unwrap_or_default())
    }

    pub async fn record_send_failure(
        &mut self,
        sent: i64,
        reason: &str,
    ) -> Result<(), CommunicationError> {
        self.ledger.update(sent, &TaChanges::error(reason)).await?;
        Ok(())
    }
}

fn connect_tries(channel: &Channel, default: u32) -> u32 {
    let tries = u32::try_from(channel.max_connection_tries)
        .ok()
        .filter(|tries| *tries > 0)
        .unwrap_or(default);
    tries.max(1)
}

/// Connect a fresh session, discarding it and starting over after each
/// failed attempt.
async fn connect(
    registry: &ChannelRegistry,
    channel: &Channel,
    tries: u32,
) -> Result<Box<dyn CommunicationSession>, CommunicationError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut session = registry.create(channel)?;
        match session.connect().await {
            Ok(()) => return Ok(session),
            Err(err) => {
                warn!(channel = %channel.id, attempt, tries, error = %err, "Connection attempt failed");
                if attempt >= tries {
                    return Err(CommunicationError::Connect {
                        channel: channel.id.clone(),
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}

async fn disconnect(channel: &Channel, mut session: Box<dyn CommunicationSession>) {
    if let Err(err) = session.disconnect().await {
        warn!(channel = %channel.id, error = %err, "Disconnect failed");
    }
}

/// Counter of consecutive failed inbound connects for a channel.
pub fn failure_counter(channel: &str) -> String {
    format!("communication_failure_{channel}")
}

/// Run one channel for the current route part.
///
/// Inbound channels only receive for command `new`. A channel with
/// `max_failures` set tolerates that many consecutive failed connects across
/// runs before the failure is raised.
pub async fn run_channel(
    engine: &Engine,
    ctx: &ProcessCtx,
    channel_id: &str,
    command: Command,
    scope: i64,
) -> Result<(), EngineError> {
    let channel = engine
        .catalog()
        .channel(channel_id)
        .await?
        .ok_or_else(|| CommunicationError::UnknownChannel(channel_id.to_string()))?;
    let config = engine.config();
    info!(
        channel = %channel.id,
        direction = %channel.direction,
        kind = %channel.kind,
        "Start communication channel"
    );

    let mut io = SessionIo::new(engine.ledger(), engine.content(), ctx, &channel, scope);
    match channel.direction {
        Direction::Out => {
            let tries = connect_tries(&channel, config.max_connection_tries);
            let mut session = connect(engine.channels(), &channel, tries).await?;
            let sent = session.send(&mut io).await;
            disconnect(&channel, session).await;
            sent?;
        }
        Direction::In if command == Command::New => {
            let limit = match channel.max_seconds {
                secs if secs > 0 => Some(Duration::from_secs(secs as u64)),
                _ => config.max_seconds_per_channel,
            };
            io = io.with_time_limit(limit);

            let store = engine.ledger().store();
            let domain = failure_counter(&channel.id);
            let mut session = match connect(engine.channels(), &channel, config.max_connection_tries.max(1)).await {
                Ok(session) => {
                    if channel.max_failures > 0 {
                        store.set_counter(&domain, 0).await?;
                    }
                    session
                }
                Err(err) if channel.max_failures > 0 => {
                    let failures = store.increment_counter(&domain).await?;
                    error!(
                        channel = %channel.id,
                        failures,
                        max_failures = channel.max_failures,
                        error = %err,
                        "Inbound communication failure"
                    );
                    if failures >= channel.max_failures {
                        store.set_counter(&domain, 0).await?;
                        return Err(err.into());
                    }
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            let received = session.receive(&mut io).await;
            disconnect(&channel, session).await;
            received?;
        }
        Direction::In => {}
    }

    let transferred = io.transferred().len();
    if !config.acceptance_test && !channel.archive_path.is_empty() && transferred > 0 {
        let options = archive::ArchiveOptions::from_config(config, &channel);
        archive::archive(engine.content(), &channel, io.transferred(), &options).await?;
    }
    info!(channel = %channel.id, transferred, "Finished communication channel");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::LedgerStore;
    use crate::test_support::test_ledger;

    struct Flaky {
        fail: bool,
    }

    #[async_trait]
    impl CommunicationSession for Flaky {
        async fn connect(&mut self) -> Result<(), CommunicationError> {
            if self.fail {
                Err(CommunicationError::Transfer("refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn channel(kind: &str) -> Channel {
        Channel {
            id: "partner_out".to_string(),
            direction: Direction::Out,
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_registry_rejects_unknown_type() {
        let registry = ChannelRegistry::with_builtin();
        assert!(registry.contains("file"));
        assert!(registry.contains("trash"));
        let err = registry.create(&channel("as2")).err().unwrap();
        assert!(matches!(err, CommunicationError::UnknownChannelType(kind) if kind == "as2"));
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_tries() {
        let mut registry = ChannelRegistry::new();
        registry.register("flaky", |_| Box::new(Flaky { fail: true }));
        let err = connect(&registry, &channel("flaky"), 3).await.err().unwrap();
        assert!(matches!(err, CommunicationError::Connect { attempts: 3, .. }));
    }

    #[test]
    fn test_connect_tries_falls_back_to_default() {
        let mut ch = channel("file");
        assert_eq!(connect_tries(&ch, 3), 3);
        ch.max_connection_tries = 5;
        assert_eq!(connect_tries(&ch, 3), 5);
        assert_eq!(connect_tries(&channel("file"), 0), 1);
    }

    #[tokio::test]
    async fn test_record_received_creates_pair() {
        let ledger = test_ledger().await;
        let dir = tempfile::tempdir().unwrap();
        let content = ContentStore::new(dir.path());
        let ctx = ProcessCtx::root().with_route("orders");
        let mut ch = channel("file");
        ch.id = "partner_in".to_string();
        let mut io = SessionIo::new(&ledger, &content, &ctx, &ch, 0);

        let stored = io.record_received("/in/order1.edi", b"UNB+UNOA").await.unwrap();

        let row = ledger.get(stored).await.unwrap();
        assert_eq!(row.stage, Stage::FileIn);
        assert_eq!(row.outcome, Outcome::Ok);
        assert_eq!(row.from_channel, "partner_in");
        assert_eq!(row.route, "orders");
        assert_eq!(row.filesize, 8);
        assert_eq!(content.read(&row.filename).await.unwrap(), b"UNB+UNOA");

        let external = ledger.get(row.parent).await.unwrap();
        assert_eq!(external.stage, Stage::ExternIn);
        assert_eq!(external.outcome, Outcome::Done);
        assert_eq!(external.filename, "/in/order1.edi");
        assert_eq!(io.transferred().len(), 1);
    }

    #[tokio::test]
    async fn test_withdraw_received_leaves_nothing() {
        let ledger = test_ledger().await;
        let dir = tempfile::tempdir().unwrap();
        let content = ContentStore::new(dir.path());
        let ctx = ProcessCtx::root().with_route("orders");
        let ch = channel("file");
        let mut io = SessionIo::new(&ledger, &content, &ctx, &ch, 0);

        let kept = io.record_received("/in/order1.edi", b"ONE").await.unwrap();
        let stored = io.record_received("/in/order2.edi", b"TWO").await.unwrap();
        let blob = ledger.get(stored).await.unwrap().filename;
        io.withdraw_received(stored).await.unwrap();

        assert!(ledger.store().get_row(stored).await.unwrap().is_none());
        assert_eq!(ledger.select(&TaFilter::stage(Stage::ExternIn)).await.unwrap().len(), 1);
        assert!(content.read(&blob).await.is_err());
        assert_eq!(io.transferred().len(), 1);
        assert_eq!(io.transferred()[0].ta, kept);
    }

    #[tokio::test]
    async fn test_send_bookkeeping() {
        let ledger = test_ledger().await;
        let dir = tempfile::tempdir().unwrap();
        let content = ContentStore::new(dir.path());
        let ctx = ProcessCtx::root();
        let ch = channel("file");

        let mut ids = Vec::new();
        for _ in 0..2 {
            ids.push(
                ledger
                    .create_root(
                        &ctx,
                        Stage::FileOut,
                        TaChanges {
                            outcome: Some(Outcome::Ok),
                            to_channel: Some(ch.id.clone()),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap(),
            );
        }
        let mut io = SessionIo::new(&ledger, &content, &ctx, &ch, 0);
        let pending = io.pending_outgoing().await.unwrap();
        assert_eq!(pending.len(), 2);

        let ok = io.begin_send(&pending[0]).await.unwrap();
        io.record_sent(ok, &pending[0], "/out/1.edi").await.unwrap();
        let failed = io.begin_send(&pending[1]).await.unwrap();
        io.record_send_failure(failed, "disk full").await.unwrap();

        let ok = ledger.get(ok).await.unwrap();
        assert_eq!((ok.stage, ok.outcome), (Stage::ExternOut, Outcome::Done));
        assert_eq!(ok.number_of_resends, 1);
        let failed = ledger.get(failed).await.unwrap();
        assert_eq!(failed.outcome, Outcome::Error);
        assert_eq!(failed.error_text, "disk full");
        for id in ids {
            assert_eq!(ledger.get(id).await.unwrap().outcome, Outcome::Done);
        }
        assert!(io.pending_outgoing().await.unwrap().is_empty());
        assert_eq!(io.transferred().len(), 1);
    }
}
