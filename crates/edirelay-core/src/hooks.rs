// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Route scripts and engine scripts: user code called at fixed points of a
//! route part or of an engine invocation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::catalog::RoutePart;
use crate::commands::{Command, RunVerdict};
use crate::error::EngineError;
use crate::process::ProcessCtx;
use crate::runtime::Engine;

/// What a hook gets to see.
pub struct HookContext<'a> {
    pub engine: &'a Engine,
    pub ctx: &'a ProcessCtx,
    pub part: &'a RoutePart,
    pub command: Command,
    pub scope: i64,
}

/// Hook points of a route part, in the order they are called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum HookPoint {
    Main,
    Start,
    PreInCommunication,
    PostIncoming,
    PreTranslation,
    PostTranslation,
    PreMerge,
    PostMerge,
    PreOutgoing,
    PostOutgoing,
    End,
}

/// User code for one route. Every hook defaults to doing nothing.
#[async_trait]
pub trait RouteScript: Send + Sync {
    /// Return `true` to take over the route part: none of the built-in steps run.
    async fn main(&self, _hook: &HookContext<'_>) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn start(&self, _hook: &HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Before the inbound channel of the part is read.
    async fn pre_in_communication(&self, _hook: &HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_incoming(&self, _hook: &HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre_translation(&self, _hook: &HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_translation(&self, _hook: &HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre_merge(&self, _hook: &HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_merge(&self, _hook: &HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre_outgoing(&self, _hook: &HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_outgoing(&self, _hook: &HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn end(&self, _hook: &HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Route name to script.
#[derive(Clone, Default)]
pub struct HookRegistry {
    scripts: HashMap<String, Arc<dyn RouteScript>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("routes", &self.scripts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, route: impl Into<String>, script: Arc<dyn RouteScript>) {
        self.scripts.insert(route.into(), script);
    }

    pub fn get(&self, route: &str) -> Option<&Arc<dyn RouteScript>> {
        self.scripts.get(route)
    }
}

/// User code for a whole engine invocation. Every hook defaults to doing
/// nothing.
///
/// `pre` runs before the first command and `post` after the last one, before
/// the retention cleanup. `pre_command` and `post_command` wrap each command.
/// `routes` is the route list given on the command line; empty means the
/// command's default routes. A failing hook ends the invocation.
#[async_trait]
pub trait EngineScript: Send + Sync {
    async fn pre(&self, _engine: &Engine, _commands: &[Command]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre_command(
        &self,
        _engine: &Engine,
        _command: Command,
        _routes: &[String],
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_command(
        &self,
        _engine: &Engine,
        _command: Command,
        _verdict: &RunVerdict,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post(&self, _engine: &Engine, _commands: &[Command]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Wrap a script failure. `hook` names the hook point, e.g. `post_merge` or
/// `pre_resend`.
pub fn hook_error(hook: impl fmt::Display, err: anyhow::Error) -> EngineError {
    EngineError::Hook {
        hook: hook.to_string(),
        reason: format!("{err:#}"),
    }
}

/// Call `point` on the route's script, if there is one. Returns whether the
/// `main` hook claimed the part; always `false` for other points.
pub async fn run_hook(
    script: Option<&Arc<dyn RouteScript>>,
    point: HookPoint,
    hook: &HookContext<'_>,
) -> Result<bool, EngineError> {
    let Some(script) = script else {
        return Ok(false);
    };
    let result = match point {
        HookPoint::Main => return script.main(hook).await.map_err(|e| hook_error(point, e)),
        HookPoint::Start => script.start(hook).await,
        HookPoint::PreInCommunication => script.pre_in_communication(hook).await,
        HookPoint::PostIncoming => script.post_incoming(hook).await,
        HookPoint::PreTranslation => script.pre_translation(hook).await,
        HookPoint::PostTranslation => script.post_translation(hook).await,
        HookPoint::PreMerge => script.pre_merge(hook).await,
        HookPoint::PostMerge => script.post_merge(hook).await,
        HookPoint::PreOutgoing => script.pre_outgoing(hook).await,
        HookPoint::PostOutgoing => script.post_outgoing(hook).await,
        HookPoint::End => script.end(hook).await,
    };
    result.map(|()| false).map_err(|e| hook_error(point, e))
}
