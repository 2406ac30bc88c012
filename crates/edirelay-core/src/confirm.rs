// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Confirmation-rule evaluation.
//!
//! Rules are loaded once per run. Positive rules are evaluated before negative
//! ones and the last matching rule wins, so "confirm all, except partner X" is
//! expressed as one positive `all` rule plus one negative `topartner` rule.

use tracing::debug;

use crate::catalog::{ConfirmRule, RoutePart, RuleType};
use crate::error::LedgerError;
use crate::ledger::Ledger;
use crate::persistence::{CatalogStore, Outcome, Stage, TaChanges, TaFilter};

pub const ASK_X12_997: &str = "ask-x12-997";
pub const ASK_EDIFACT_CONTRL: &str = "ask-edifact-CONTRL";

/// Attributes of the message a confirmation question is asked about.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfirmContext<'a> {
    pub route: Option<&'a str>,
    pub channel: Option<&'a str>,
    pub from_partner: Option<&'a str>,
    pub to_partner: Option<&'a str>,
    pub messagetype: Option<&'a str>,
    pub confirm_asked: bool,
}

/// In-memory confirmation rule table.
#[derive(Debug, Clone, Default)]
pub struct ConfirmRules {
    rules: Vec<ConfirmRule>,
}

impl ConfirmRules {
    /// Inactive rules are dropped; negative rules move behind positive ones,
    /// each group keeping its order.
    pub fn new(rules: Vec<ConfirmRule>) -> Self {
        let mut rules: Vec<_> = rules.into_iter().filter(|r| r.active).collect();
        rules.sort_by_key(|r| r.negative);
        Self { rules }
    }

    pub async fn load(catalog: &dyn CatalogStore) -> Result<Self, LedgerError> {
        Ok(Self::new(catalog.confirm_rules().await?))
    }

    /// Whether any rule exists for this confirmation kind.
    pub fn is_used(&self, kind: &str) -> bool {
        self.rules.iter().any(|r| r.confirm_type == kind)
    }

    pub fn should_confirm(&self, kind: &str, ctx: &ConfirmContext<'_>) -> bool {
        let mut confirm = false;
        for rule in self.rules.iter().filter(|r| r.confirm_type == kind) {
            let selector = Some(rule.selector.as_str());
            let matches = match rule.rule_type {
                RuleType::All => true,
                RuleType::ConfirmAsked => ctx.confirm_asked && kind.starts_with("send-"),
                RuleType::Route => ctx.route == selector,
                RuleType::Channel => ctx.channel == selector,
                RuleType::FromPartner => ctx.from_partner == selector,
                RuleType::ToPartner => ctx.to_partner == selector,
                RuleType::MessageType => ctx.messagetype == selector,
            };
            if matches {
                confirm = !rule.negative;
            }
        }
        confirm
    }
}

/// Confirmation kind to ask for an outgoing message, if its format supports one.
/// Acknowledgments themselves are never acknowledged.
fn ask_kind(editype: &str, messagetype: &str) -> Option<&'static str> {
    match editype {
        "x12" if !(messagetype.starts_with("997") || messagetype.starts_with("999")) => {
            Some(ASK_X12_997)
        }
        "edifact" if !(messagetype.starts_with("CONTRL") || messagetype.starts_with("APERAK")) => {
            Some(ASK_EDIFACT_CONTRL)
        }
        _ => None,
    }
}

/// Mark outgoing x12/EDIFACT rows of a route part that must ask for a
/// functional acknowledgment. Returns the number of rows marked.
///
/// The mark goes on the stored-outgoing row and on the merged row it was
/// derived from, which is where enveloping reads it.
pub async fn set_asked_confirm_rules(
    ledger: &Ledger,
    rules: &ConfirmRules,
    part: &RoutePart,
    scope: i64,
) -> Result<u64, LedgerError> {
    if !rules.is_used(ASK_X12_997) && !rules.is_used(ASK_EDIFACT_CONTRL) {
        return Ok(0);
    }
    let rows = ledger
        .select(
            &TaFilter::stage(Stage::FileOut)
                .with_outcome(Outcome::Ok)
                .above(scope)
                .to_channel(part.to_channel.clone()),
        )
        .await?;

    let mut marked = 0;
    for row in rows {
        let Some(kind) = ask_kind(&row.editype, &row.messagetype) else {
            continue;
        };
        let ctx = ConfirmContext {
            route: Some(part.route.as_str()),
            channel: Some(part.to_channel.as_str()),
            from_partner: Some(row.from_partner.as_str()),
            to_partner: Some(row.to_partner.as_str()),
            messagetype: Some(row.messagetype.as_str()),
            confirm_asked: false,
        };
        if !rules.should_confirm(kind, &ctx) {
            continue;
        }
        let changes = TaChanges {
            confirm_asked: Some(true),
            confirm_type: Some(kind.to_string()),
            ..Default::default()
        };
        ledger.update(row.id, &changes).await?;
        if row.parent != 0 {
            ledger.update(row.parent, &changes).await?;
        }
        debug!(row = row.id, kind, "Acknowledgment requested");
        marked += 1;
    }
    Ok(marked)
}
