//! Deletion enforcer: re-verifies uploaded archives and deletes original
//! records once every record in a block has aged past the retention
//! threshold.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use common::model::{MeasureBlock, MeasureKind};

use crate::backend::ArchiveBackend;
use crate::store::MeasureStore;

#[derive(Clone, Debug)]
pub struct EnforcerOptions {
    /// Minimum age a record must reach before it may be deleted.
    pub retention: Duration,
    /// Maximum rows deleted per statement when draining a block.
    pub delete_chunk_size: i64,
}

/// Outcome of one enforcement pass over a kind.
#[derive(Clone, Debug, Default)]
pub struct DeletionRun {
    pub blocks_examined: usize,
    pub blocks_finalized: usize,
    pub blocks_deferred: usize,
    pub records_deleted: u64,
}

enum BlockOutcome {
    Finalized(u64),
    Deferred,
}

/// Process every archived-but-not-finalized block of `kind`.
///
/// A block is drained and finalized only when its upload re-verifies
/// against the stored digest and every record in the range is older
/// than the retention threshold. Deletion is whole-block-or-nothing:
/// a failed verification or a single too-young record defers the block
/// wholesale to a later pass. Safe to invoke repeatedly; a second pass
/// over a finalized block deletes nothing.
pub async fn delete_archived(
    store: &MeasureStore,
    backend: &dyn ArchiveBackend,
    opts: &EnforcerOptions,
    kind: MeasureKind,
) -> Result<DeletionRun> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(opts.retention).context("retention period out of range")?;

    let blocks = store
        .deletable_blocks(kind)
        .await
        .context("list deletable blocks")?;

    let mut run = DeletionRun::default();
    for block in &blocks {
        run.blocks_examined += 1;
        match enforce_block(store, backend, opts, kind, block, cutoff).await {
            Ok(BlockOutcome::Finalized(deleted)) => {
                info!(
                    kind = %kind,
                    start_id = block.start_id,
                    end_id = block.end_id,
                    deleted,
                    "block finalized"
                );
                run.blocks_finalized += 1;
                run.records_deleted += deleted;
            }
            Ok(BlockOutcome::Deferred) => {
                run.blocks_deferred += 1;
            }
            Err(e) => {
                warn!(
                    kind = %kind,
                    start_id = block.start_id,
                    end_id = block.end_id,
                    error = %e,
                    "block deletion failed, will retry on next invocation"
                );
                run.blocks_deferred += 1;
            }
        }
    }

    Ok(run)
}

async fn enforce_block(
    store: &MeasureStore,
    backend: &dyn ArchiveBackend,
    opts: &EnforcerOptions,
    kind: MeasureKind,
    block: &MeasureBlock,
    cutoff: DateTime<Utc>,
) -> Result<BlockOutcome> {
    let (Some(key), Some(sha)) = (&block.s3_key, &block.archive_sha) else {
        // deletable_blocks only returns fully archived blocks
        anyhow::bail!("block is missing archive fields");
    };

    if !backend
        .verify(key, sha)
        .await
        .context("verify archive")?
    {
        warn!(
            kind = %kind,
            key = %key,
            start_id = block.start_id,
            end_id = block.end_id,
            "archive missing or digest mismatch, deferring deletion"
        );
        return Ok(BlockOutcome::Deferred);
    }

    let young = store
        .count_younger_than(kind, block.start_id, block.end_id, cutoff)
        .await
        .context("check record ages")?;
    if young > 0 {
        info!(
            kind = %kind,
            start_id = block.start_id,
            end_id = block.end_id,
            young,
            "records below retention age, deferring deletion"
        );
        return Ok(BlockOutcome::Deferred);
    }

    let deleted = store
        .delete_records_range(kind, block.start_id, block.end_id, opts.delete_chunk_size)
        .await
        .context("delete archived records")?;
    store
        .finalize_block(block.id, Utc::now())
        .await
        .context("finalize block")?;

    Ok(BlockOutcome::Finalized(deleted))
}
