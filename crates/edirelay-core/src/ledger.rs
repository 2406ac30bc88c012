// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transaction ledger.
//!
//! Rows are never moved between stages in place. Every step creates a new
//! row derived from its predecessor, so the ledger forms a tree per received
//! file that the tracer can evaluate after the run.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::LedgerError;
use crate::persistence::{
    CopySpec, LedgerStore, LinkKind, NewRow, Outcome, Stage, TaChanges, TaFilter, TaRecord,
};
use crate::process::ProcessCtx;

/// Row-lifecycle operations over a [`LedgerStore`].
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Create a row without predecessor, tagged with the enclosing process.
    pub async fn create_root(
        &self,
        ctx: &ProcessCtx,
        stage: Stage,
        fields: TaChanges,
    ) -> Result<i64, LedgerError> {
        self.store
            .insert_row(&NewRow::root(stage, ctx.process(), fields))
            .await
    }

    pub async fn get(&self, id: i64) -> Result<TaRecord, LedgerError> {
        self.store
            .get_row(id)
            .await?
            .ok_or(LedgerError::RowNotFound(id))
    }

    /// Derive a new row from `source`. The source is left untouched.
    pub async fn copy_forward(
        &self,
        ctx: &ProcessCtx,
        source: i64,
        stage: Stage,
        overrides: TaChanges,
    ) -> Result<i64, LedgerError> {
        let row = self.get(source).await?;
        check_successor(&row, stage, false)?;
        self.store
            .copy_row(source, &split_child(ctx, source, stage, overrides, None))
            .await
    }

    /// Derive a new row from `source` and mark the source done in the same
    /// transaction.
    pub async fn advance(
        &self,
        ctx: &ProcessCtx,
        source: i64,
        stage: Stage,
        overrides: TaChanges,
    ) -> Result<i64, LedgerError> {
        let row = self.get(source).await?;
        check_successor(&row, stage, true)?;
        self.store
            .copy_row(
                source,
                &split_child(ctx, source, stage, overrides, Some(Outcome::Done)),
            )
            .await
    }

    /// Advance every row matching `filter` to `stage`. Returns the number of rows moved.
    pub async fn promote(
        &self,
        ctx: &ProcessCtx,
        filter: &TaFilter,
        stage: Stage,
        overrides: TaChanges,
    ) -> Result<u64, LedgerError> {
        let rows = self.store.select_rows(filter).await?;
        let mut moved = 0;
        for row in rows {
            check_successor(&row, stage, true)?;
            self.store
                .copy_row(
                    row.id,
                    &split_child(ctx, row.id, stage, overrides.clone(), Some(Outcome::Done)),
                )
                .await?;
            moved += 1;
        }
        Ok(moved)
    }

    /// Combine several rows into one merge target.
    pub async fn merge(
        &self,
        ctx: &ProcessCtx,
        contributors: &[i64],
        stage: Stage,
        fields: TaChanges,
    ) -> Result<i64, LedgerError> {
        if contributors.is_empty() {
            return Err(LedgerError::EmptyMerge);
        }
        for id in contributors {
            let row = self.get(*id).await?;
            check_successor(&row, stage, true)?;
        }
        let row = NewRow {
            link: LinkKind::MergeTarget,
            ..NewRow::root(stage, ctx.process(), fields)
        };
        self.store.merge_rows(contributors, &row).await
    }

    /// Start a fresh chain from a historical row.
    ///
    /// The copy records where it came from but does not hang below it: with
    /// `parent` unset it is a new root, otherwise a split child of `parent`.
    pub async fn reinject(
        &self,
        ctx: &ProcessCtx,
        source: i64,
        stage: Stage,
        parent: Option<i64>,
        overrides: TaChanges,
    ) -> Result<i64, LedgerError> {
        let (parent, link) = match parent {
            Some(parent) => (parent, LinkKind::SplitChild),
            None => (0, LinkKind::Root),
        };
        let spec = CopySpec {
            row: NewRow {
                stage,
                parent,
                link,
                process: ctx.process(),
                reinjected_from: source,
                fields: overrides,
            },
            consume_source: None,
        };
        self.store.copy_row(source, &spec).await
    }

    /// In-place update restricted to the mutable attributes. Empty changes are a no-op.
    pub async fn update(&self, id: i64, changes: &TaChanges) -> Result<u64, LedgerError> {
        if changes.is_empty() {
            return Ok(0);
        }
        self.store.update_row(id, changes).await
    }

    pub async fn update_where(
        &self,
        filter: &TaFilter,
        changes: &TaChanges,
    ) -> Result<u64, LedgerError> {
        if changes.is_empty() {
            return Ok(0);
        }
        self.store.update_rows(filter, changes).await
    }

    pub async fn select(&self, filter: &TaFilter) -> Result<Vec<TaRecord>, LedgerError> {
        self.store.select_rows(filter).await
    }

    pub async fn count(&self, filter: &TaFilter) -> Result<i64, LedgerError> {
        self.store.count_rows(filter).await
    }

    pub async fn successors(&self, id: i64) -> Result<Vec<TaRecord>, LedgerError> {
        self.store.successors(id).await
    }

    /// Nearest ancestor at `stage`, following parent links only. Rows below a
    /// merge have several origins and yield `None`.
    pub async fn origin(&self, id: i64, stage: Stage) -> Result<Option<TaRecord>, LedgerError> {
        let mut current = self.get(id).await?;
        loop {
            if current.stage == stage {
                return Ok(Some(current));
            }
            if current.parent == 0 {
                return Ok(None);
            }
            current = self.get(current.parent).await?;
        }
    }

    pub async fn delete(&self, id: i64) -> Result<u64, LedgerError> {
        let row = self.store.get_row(id).await?;
        let deleted = self.store.delete_row(id).await?;
        if let Some(row) = row
            && row.link == LinkKind::MergeTarget
        {
            self.store.clear_child_links(id).await?;
        }
        Ok(deleted)
    }

    /// Delete every row reachable from `id` through split or merge links.
    /// The row itself is kept.
    pub async fn delete_descendants(&self, id: i64) -> Result<u64, LedgerError> {
        let mut seen = HashSet::new();
        let mut pending = vec![id];
        let mut doomed = Vec::new();
        while let Some(current) = pending.pop() {
            for row in self.store.successors(current).await? {
                if seen.insert(row.id) {
                    pending.push(row.id);
                    doomed.push(row);
                }
            }
        }

        let mut deleted = 0;
        for row in doomed.iter().rev() {
            deleted += self.store.delete_row(row.id).await?;
            if row.link == LinkKind::MergeTarget {
                self.store.clear_child_links(row.id).await?;
            }
        }
        debug!(root = id, deleted, "Deleted descendants");
        Ok(deleted)
    }
}

fn split_child(
    ctx: &ProcessCtx,
    source: i64,
    stage: Stage,
    overrides: TaChanges,
    consume_source: Option<Outcome>,
) -> CopySpec {
    CopySpec {
        row: NewRow {
            stage,
            parent: source,
            link: LinkKind::SplitChild,
            process: ctx.process(),
            reinjected_from: 0,
            fields: overrides,
        },
        consume_source,
    }
}

/// A failed row never gets successors. A stuck row only gets one when it is
/// consumed by the same write.
fn check_successor(source: &TaRecord, stage: Stage, consumes: bool) -> Result<(), LedgerError> {
    let terminal = match source.outcome {
        Outcome::Error => true,
        Outcome::Ok => !consumes,
        _ => false,
    };
    if terminal {
        return Err(LedgerError::ChildOfTerminalRow {
            id: source.id,
            outcome: source.outcome,
        });
    }
    if !source.stage.can_advance_to(stage) {
        return Err(LedgerError::StageRegression {
            id: source.id,
            from: source.stage,
            to: stage,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteLedgerStore;
    use crate::test_support::test_ledger;

    #[tokio::test]
    async fn test_copy_forward_links_parent() {
        let ledger = test_ledger().await;
        let ctx = ProcessCtx::root();
        let root = ledger
            .create_root(&ctx, Stage::ExternIn, TaChanges::default())
            .await
            .unwrap();
        let stored = ledger
            .copy_forward(&ctx, root, Stage::FileIn, TaChanges::outcome(Outcome::Ok))
            .await
            .unwrap();

        let row = ledger.get(stored).await.unwrap();
        assert_eq!(row.parent, root);
        assert_eq!(row.link, LinkKind::SplitChild);
        assert_eq!(row.outcome, Outcome::Ok);
        assert!(row.id > root);
        assert_eq!(ledger.get(root).await.unwrap().outcome, Outcome::Open);
    }

    #[tokio::test]
    async fn test_copy_forward_rejects_terminal_rows() {
        let ledger = test_ledger().await;
        let ctx = ProcessCtx::root();
        let failed = ledger
            .create_root(&ctx, Stage::FileIn, TaChanges::error("bad"))
            .await
            .unwrap();
        let stuck = ledger
            .create_root(&ctx, Stage::FileIn, TaChanges::outcome(Outcome::Ok))
            .await
            .unwrap();

        for id in [failed, stuck] {
            let err = ledger
                .copy_forward(&ctx, id, Stage::Translated, TaChanges::default())
                .await
                .unwrap_err();
            assert!(matches!(err, LedgerError::ChildOfTerminalRow { .. }));
        }
        let err = ledger
            .advance(&ctx, failed, Stage::Translated, TaChanges::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ChildOfTerminalRow { .. }));
    }

    #[tokio::test]
    async fn test_copy_forward_rejects_stage_regression() {
        let ledger = test_ledger().await;
        let ctx = ProcessCtx::root();
        let merged = ledger
            .create_root(&ctx, Stage::Merged, TaChanges::outcome(Outcome::Done))
            .await
            .unwrap();
        let err = ledger
            .copy_forward(&ctx, merged, Stage::FileIn, TaChanges::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::StageRegression { .. }));

        ledger
            .copy_forward(&ctx, merged, Stage::Discard, TaChanges::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_advance_consumes_source() {
        let ledger = test_ledger().await;
        let ctx = ProcessCtx::root();
        let stored = ledger
            .create_root(&ctx, Stage::FileIn, TaChanges::outcome(Outcome::Ok))
            .await
            .unwrap();
        let next = ledger
            .advance(&ctx, stored, Stage::Merged, TaChanges::outcome(Outcome::Ok))
            .await
            .unwrap();

        assert_eq!(ledger.get(stored).await.unwrap().outcome, Outcome::Done);
        assert_eq!(ledger.get(next).await.unwrap().outcome, Outcome::Ok);
    }

    #[tokio::test]
    async fn test_promote_moves_matching_rows() {
        let ledger = test_ledger().await;
        let ctx = ProcessCtx::root();
        for route in ["a", "a", "b"] {
            ledger
                .create_root(
                    &ctx,
                    Stage::FileIn,
                    TaChanges {
                        outcome: Some(Outcome::Ok),
                        route: Some(route.to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let filter = TaFilter::stage(Stage::FileIn)
            .with_outcome(Outcome::Ok)
            .route("a");
        let moved = ledger
            .promote(&ctx, &filter, Stage::Merged, TaChanges::outcome(Outcome::Ok))
            .await
            .unwrap();

        assert_eq!(moved, 2);
        assert_eq!(ledger.count(&filter).await.unwrap(), 0);
        let merged = ledger
            .count(&TaFilter::stage(Stage::Merged).route("a"))
            .await
            .unwrap();
        assert_eq!(merged, 2);
    }

    #[tokio::test]
    async fn test_empty_update_is_noop() {
        let ledger = test_ledger().await;
        assert_eq!(ledger.update(12345, &TaChanges::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_descendants_follows_both_links() {
        let ledger = test_ledger().await;
        let ctx = ProcessCtx::root();
        let root = ledger
            .create_root(&ctx, Stage::ExternIn, TaChanges::outcome(Outcome::Done))
            .await
            .unwrap();
        let stored = ledger
            .copy_forward(&ctx, root, Stage::FileIn, TaChanges::outcome(Outcome::Done))
            .await
            .unwrap();
        let m1 = ledger
            .copy_forward(&ctx, stored, Stage::Translated, TaChanges::default())
            .await
            .unwrap();
        let m2 = ledger
            .copy_forward(&ctx, stored, Stage::Translated, TaChanges::default())
            .await
            .unwrap();
        let merged = ledger
            .merge(&ctx, &[m1, m2], Stage::Merged, TaChanges::outcome(Outcome::Ok))
            .await
            .unwrap();

        let deleted = ledger.delete_descendants(root).await.unwrap();

        assert_eq!(deleted, 4);
        assert!(ledger.store().get_row(merged).await.unwrap().is_none());
        assert!(ledger.store().get_row(root).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reinject_starts_new_root() {
        let ledger = test_ledger().await;
        let ctx = ProcessCtx::root();
        let outgoing = ledger
            .create_root(
                &ctx,
                Stage::FileOut,
                TaChanges {
                    outcome: Some(Outcome::Done),
                    filename: Some("17".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let fresh = ledger
            .reinject(&ctx, outgoing, Stage::ExternIn, None, TaChanges::outcome(Outcome::Done))
            .await
            .unwrap();

        let row = ledger.get(fresh).await.unwrap();
        assert_eq!(row.parent, 0);
        assert_eq!(row.link, LinkKind::Root);
        assert_eq!(row.reinjected_from, outgoing);
        assert_eq!(row.filename, "17");
        assert!(ledger.successors(outgoing).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_requires_contributors() {
        let store = SqliteLedgerStore::new(crate::test_support::test_pool().await);
        let ledger = Ledger::new(Arc::new(store));
        let err = ledger
            .merge(&ProcessCtx::root(), &[], Stage::Merged, TaChanges::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::EmptyMerge));
    }
}
