// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Route dispatcher.
//!
//! Runs the parts of each requested route in order. A part receives over its
//! inbound channel, tags what arrived, translates and merges, selects merged
//! rows for its outbound channel and sends them. Sends over deferred channels
//! wait until every route of the run is done, so one session serves all of
//! them.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::catalog::{RoutePart, TranslateMode};
use crate::commands::Command;
use crate::communication::run_channel;
use crate::confirm::{ConfirmRules, set_asked_confirm_rules};
use crate::error::EngineError;
use crate::hooks::{HookContext, HookPoint, RouteScript, run_hook};
use crate::persistence::{Outcome, Stage, TaChanges, TaFilter};
use crate::process::{ProcessCtx, run_as_process};
use crate::runtime::Engine;
use crate::translation::{StageContext, ZipPreprocessor, merge_translated, split_incoming, translate_incoming};

/// Edi types whose received files are compound and get split into messages.
const SPLIT_EDITYPES: [&str; 4] = ["mailbag", "edifact", "x12", "tradacoms"];

/// Outbound channel fed by a route part and whether its send is deferred.
type DeferEntry = (String, bool);

/// Route script and hook context of the part that triggers a send.
type OutgoingHooks<'h> = (Option<&'h Arc<dyn RouteScript>>, &'h HookContext<'h>);

struct Dispatcher<'a> {
    engine: &'a Engine,
    command: Command,
    scope: i64,
    rules: ConfirmRules,
}

/// Run `routes` for one run.
///
/// `run` is the context of the run's root process; `scope` is the id above
/// which rows belong to this run. A route that does not exist or has no active
/// parts is logged and skipped. Failures inside a route are recorded as
/// process errors and do not stop the other routes.
pub async fn run_routes(
    engine: &Engine,
    run: &ProcessCtx,
    command: Command,
    routes: &[String],
    scope: i64,
) -> Result<(), EngineError> {
    let dispatcher = Dispatcher {
        engine,
        command,
        scope,
        rules: ConfirmRules::load(engine.catalog()).await?,
    };
    let ledger = engine.ledger();

    let mut deferred: BTreeMap<String, bool> = BTreeMap::new();
    for route in routes {
        let parts = engine.catalog().route_parts(route).await?;
        if parts.is_empty() {
            error!(route = %route, %command, "Route not found or not active");
            continue;
        }
        info!(route = %route, parts = parts.len(), "Start route");
        let ctx = run.with_route(route.clone());
        let entries = run_as_process(ledger, &ctx, "route", |inner| {
            dispatcher.run_route(inner, parts)
        })
        .await?;
        for (channel, defer) in entries.into_iter().flatten() {
            deferred.insert(channel, defer);
        }
    }

    for (channel, _) in deferred.into_iter().filter(|(_, defer)| *defer) {
        debug!(channel = %channel, "Send deferred channel");
        dispatcher.send_outgoing(run, &channel, None).await?;
    }
    Ok(())
}

impl Dispatcher<'_> {
    async fn run_route(
        &self,
        ctx: ProcessCtx,
        parts: Vec<RoutePart>,
    ) -> Result<Vec<DeferEntry>, EngineError> {
        let ledger = self.engine.ledger();
        let mut entries = Vec::new();
        for part in parts {
            let name = format!("part {}", part.seq);
            let entry = run_as_process(ledger, &ctx, &name, |inner| self.run_part(inner, part))
                .await?;
            entries.extend(entry.flatten());
        }
        Ok(entries)
    }

    fn stage<'s>(&'s self, ctx: &'s ProcessCtx, part: &'s RoutePart) -> StageContext<'s> {
        StageContext {
            ledger: self.engine.ledger(),
            content: self.engine.content(),
            ctx,
            part,
            scope: self.scope,
        }
    }

    /// Returns the outbound channel of the part and whether it is deferred.
    async fn run_part(
        &self,
        ctx: ProcessCtx,
        part: RoutePart,
    ) -> Result<Option<DeferEntry>, EngineError> {
        let engine = self.engine;
        let script = engine.hooks().get(&part.route).cloned();
        let hook = HookContext {
            engine,
            ctx: &ctx,
            part: &part,
            command: self.command,
            scope: self.scope,
        };

        if run_hook(script.as_ref(), HookPoint::Main, &hook).await? {
            info!(route = %part.route, seq = part.seq, "Route part handled by route script");
            return Ok(None);
        }
        if part.is_empty() {
            return Err(EngineError::Configuration(format!(
                "route '{}' part {} has no inbound channel, outbound channel or translation",
                part.route, part.seq
            )));
        }
        run_hook(script.as_ref(), HookPoint::Start, &hook).await?;
        let stage = self.stage(&ctx, &part);

        if !part.from_channel.is_empty() {
            run_hook(script.as_ref(), HookPoint::PreInCommunication, &hook).await?;
            self.communicate(&ctx, &part.from_channel).await?;
            self.incoming(&stage).await?;
            run_hook(script.as_ref(), HookPoint::PostIncoming, &hook).await?;
        }

        match part.translate {
            TranslateMode::Translate | TranslateMode::ParseAndPassThrough => {
                run_hook(script.as_ref(), HookPoint::PreTranslation, &hook).await?;
                let files = translate_incoming(&stage, engine.translator()).await?;
                run_hook(script.as_ref(), HookPoint::PostTranslation, &hook).await?;
                run_hook(script.as_ref(), HookPoint::PreMerge, &hook).await?;
                let merged = merge_translated(&stage, engine.enveloper()).await?;
                debug!(route = %part.route, seq = part.seq, files, merged, "Translated");
                run_hook(script.as_ref(), HookPoint::PostMerge, &hook).await?;
            }
            TranslateMode::PassThrough => {
                let filter = TaFilter::stage(Stage::FileIn)
                    .with_outcome(Outcome::Ok)
                    .above(self.scope)
                    .route(part.route.clone());
                let passed = engine
                    .ledger()
                    .promote(&ctx, &filter, Stage::Merged, TaChanges::outcome(Outcome::Ok))
                    .await?;
                debug!(route = %part.route, seq = part.seq, passed, "Passed through");
            }
            TranslateMode::None => {
                merge_translated(&stage, engine.enveloper()).await?;
            }
        }

        let mut entry = None;
        if !part.to_channel.is_empty() {
            self.outgoing(&stage).await?;
            if !part.defer {
                self.send_outgoing(&ctx, &part.to_channel, Some((script.as_ref(), &hook)))
                    .await?;
            }
            entry = Some((part.to_channel.clone(), part.defer));
        }

        run_hook(script.as_ref(), HookPoint::End, &hook).await?;
        Ok(entry)
    }

    /// Run a channel as its own process. Failures are recorded, not raised.
    async fn communicate(&self, ctx: &ProcessCtx, channel: &str) -> Result<bool, EngineError> {
        let name = format!("communication {channel}");
        let done = run_as_process(self.engine.ledger(), ctx, &name, |inner| async move {
            run_channel(self.engine, &inner, channel, self.command, self.scope).await
        })
        .await?;
        Ok(done.is_some())
    }

    /// Tag what the inbound channel stored, then unzip and split it.
    async fn incoming(&self, stage: &StageContext<'_>) -> Result<(), EngineError> {
        let part = stage.part;
        let filter = TaFilter::stage(Stage::FileIn)
            .with_outcome(Outcome::Ok)
            .above(self.scope)
            .route(part.route.clone())
            .from_channel(part.from_channel.clone());
        let received = stage.ledger.count(&filter).await?;
        if received == 0 {
            return Ok(());
        }
        let tag = TaChanges {
            editype: Some(part.from_editype.clone()),
            messagetype: Some(part.from_messagetype.clone()),
            alt: Some(part.alt.clone()),
            from_partner: Some(part.from_partner.clone()),
            to_partner: Some(part.to_partner.clone()),
            ..Default::default()
        }
        .without_blanks();
        stage.ledger.update_where(&filter, &tag).await?;
        info!(route = %part.route, channel = %part.from_channel, received, "Received files");

        ZipPreprocessor.unzip(stage, part.zip_incoming).await?;
        let config = self.engine.config();
        let splittable = if config.compatibility_split {
            part.from_editype == "mailbag"
        } else {
            SPLIT_EDITYPES.contains(&part.from_editype.as_str())
        };
        if splittable {
            split_incoming(stage, self.engine.splitter()).await?;
        }
        Ok(())
    }

    /// Select merged rows for the part's outbound channel.
    async fn outgoing(&self, stage: &StageContext<'_>) -> Result<u64, EngineError> {
        let part = stage.part;
        let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());
        let filter = TaFilter {
            editype: non_empty(&part.to_editype),
            messagetype: non_empty(&part.to_messagetype),
            testindicator: non_empty(&part.testindicator),
            from_partner_or_group: non_empty(&part.from_partner_tochannel),
            to_partner_or_group: non_empty(&part.to_partner_tochannel),
            ..TaFilter::stage(Stage::Merged)
                .with_outcome(Outcome::Ok)
                .above(self.scope)
                .route(part.route.clone())
        };
        let overrides = TaChanges {
            outcome: Some(Outcome::Ok),
            to_channel: Some(part.to_channel.clone()),
            ..Default::default()
        };
        let selected = stage
            .ledger
            .promote(stage.ctx, &filter, Stage::FileOut, overrides)
            .await?;
        if selected > 0 {
            set_asked_confirm_rules(stage.ledger, &self.rules, part, self.scope).await?;
        }
        // Re-injected rows of a resend are pending here without being selected.
        if part.zip_outgoing {
            ZipPreprocessor.zip(stage).await?;
        }
        debug!(route = %part.route, channel = %part.to_channel, selected, "Selected outgoing");
        Ok(selected)
    }

    /// Send everything pending for `channel`. Rows still pending afterwards
    /// become failed sends, so one attempt ends with one outcome per row.
    async fn send_outgoing(
        &self,
        ctx: &ProcessCtx,
        channel: &str,
        hook: Option<OutgoingHooks<'_>>,
    ) -> Result<(), EngineError> {
        let ledger = self.engine.ledger();
        let pending = TaFilter::stage(Stage::FileOut)
            .with_outcome(Outcome::Ok)
            .above(self.scope)
            .to_channel(channel.to_string());
        if ledger.count(&pending).await? == 0 {
            return Ok(());
        }
        if let Some((script, hook)) = hook {
            run_hook(script, HookPoint::PreOutgoing, hook).await?;
        }

        let reached = self.communicate(ctx, channel).await?;
        let text = if reached {
            "file was not sent"
        } else {
            "communication with the channel failed"
        };
        let failed = ledger
            .promote(ctx, &pending, Stage::ExternOut, TaChanges::error(text))
            .await?;
        if failed > 0 {
            warn!(channel = %channel, failed, "Outgoing files not sent");
        }

        if let Some((script, hook)) = hook {
            run_hook(script, HookPoint::PostOutgoing, hook).await?;
        }
        Ok(())
    }
}
