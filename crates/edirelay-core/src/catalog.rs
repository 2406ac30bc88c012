// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Routing catalog: routes, channels, confirmation rules and partner groups.
//!
//! The catalog normally lives in the relational store and is maintained by the
//! admin UI. Headless installations describe it in a `catalog.json` file that
//! is upserted at engine startup.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::persistence::UnknownCode;

/// What a route part does between receiving and sending.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TranslateMode {
    #[default]
    None = 0,
    Translate = 1,
    PassThrough = 2,
    ParseAndPassThrough = 3,
}

impl TryFrom<i64> for TranslateMode {
    type Error = UnknownCode;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Translate),
            2 => Ok(Self::PassThrough),
            3 => Ok(Self::ParseAndPassThrough),
            _ => Err(UnknownCode::new("translate mode", code)),
        }
    }
}

/// Unzipping of incoming files.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ZipMode {
    #[default]
    None = 0,
    /// Every incoming file must be a zip archive.
    Always = 1,
    /// Zip archives are unpacked, other files pass unchanged.
    IfZipped = 2,
}

impl TryFrom<i64> for ZipMode {
    type Error = UnknownCode;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Always),
            2 => Ok(Self::IfZipped),
            _ => Err(UnknownCode::new("zip mode", code)),
        }
    }
}

/// One ordered part of a route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(default)]
pub struct RoutePart {
    pub route: String,
    pub seq: i64,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Run by `new` when no routes are named explicitly.
    #[serde(default = "default_true")]
    pub in_default_run: bool,
    pub from_channel: String,
    pub from_editype: String,
    pub from_messagetype: String,
    pub alt: String,
    pub from_partner: String,
    pub to_partner: String,
    #[sqlx(try_from = "i64")]
    pub translate: TranslateMode,
    pub to_channel: String,
    pub to_editype: String,
    pub to_messagetype: String,
    /// Outbound filter: partner or partner group the sender must match.
    pub from_partner_tochannel: String,
    /// Outbound filter: partner or partner group the receiver must match.
    pub to_partner_tochannel: String,
    pub testindicator: String,
    /// Outbound send is postponed until every route of the run has finished.
    pub defer: bool,
    #[sqlx(try_from = "i64")]
    pub zip_incoming: ZipMode,
    pub zip_outgoing: bool,
}

impl RoutePart {
    pub fn new(route: impl Into<String>, seq: i64) -> Self {
        Self {
            route: route.into(),
            seq,
            active: true,
            in_default_run: true,
            ..Default::default()
        }
    }

    /// A part with nothing to do unless a route hook claims it.
    pub fn is_empty(&self) -> bool {
        self.from_channel.is_empty()
            && self.to_channel.is_empty()
            && self.translate == TranslateMode::None
    }
}

/// Direction of a channel.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    In,
    Out,
}

impl TryFrom<String> for Direction {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Direction::from_str(&value)
    }
}

/// A configured communication endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(default)]
pub struct Channel {
    pub id: String,
    #[sqlx(try_from = "String")]
    pub direction: Direction,
    /// Driver name, e.g. `file` or `trash`.
    pub kind: String,
    pub host: String,
    pub port: i64,
    pub username: String,
    pub secret: String,
    pub path: String,
    /// Inbound: glob pattern. Outbound: name template.
    pub filename: String,
    /// Inbound: only receive when this lock file is absent.
    pub lockname: String,
    /// Inbound: remove files after receipt.
    pub remove: bool,
    /// Empty when transferred files are not archived.
    pub archive_path: String,
    /// 0 means use the engine default.
    pub max_connection_tries: i64,
    /// 0 means use the engine default.
    pub max_seconds: i64,
    /// Consecutive inbound failures tolerated before a process error is raised.
    pub max_failures: i64,
}

/// What a confirmation rule matches on.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    All,
    /// Only meaningful for `send-*` confirmation kinds.
    ConfirmAsked,
    Route,
    Channel,
    FromPartner,
    ToPartner,
    MessageType,
}

impl TryFrom<String> for RuleType {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RuleType::from_str(&value)
    }
}

/// Declarative confirmation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConfirmRule {
    #[serde(default)]
    pub id: i64,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Confirmation kind, e.g. `ask-x12-997` or `send-email-MDN`.
    pub confirm_type: String,
    #[sqlx(try_from = "String")]
    pub rule_type: RuleType,
    /// Route, channel, partner or message type, depending on the rule type.
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub negative: bool,
}

fn default_true() -> bool {
    true
}

/// Members of one partner group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartnerGroup {
    pub id: String,
    pub partners: Vec<String>,
}

/// Catalog file format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogFile {
    pub channels: Vec<Channel>,
    pub routes: Vec<RoutePart>,
    pub confirm_rules: Vec<ConfirmRule>,
    pub partner_groups: Vec<PartnerGroup>,
}

/// Errors reading a catalog file.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("cannot read catalog file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid catalog file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("route '{route}' part {seq} uses unknown channel '{channel}'")]
    UnknownChannel {
        route: String,
        seq: i64,
        channel: String,
    },
}

impl CatalogFile {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path)?;
        let catalog: CatalogFile = serde_json::from_str(&text)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Every channel a route part refers to must be declared in the same file.
    pub fn validate(&self) -> Result<(), CatalogError> {
        for part in &self.routes {
            for channel in [&part.from_channel, &part.to_channel] {
                if !channel.is_empty() && !self.channels.iter().any(|c| &c.id == channel) {
                    return Err(CatalogError::UnknownChannel {
                        route: part.route.clone(),
                        seq: part.seq,
                        channel: channel.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
