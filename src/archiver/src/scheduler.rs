//! Block scheduling: partitions the unscheduled record-id space into
//! fixed-size contiguous blocks.

use anyhow::{Context, Result};
use tracing::{info, warn};

use common::model::MeasureKind;

use crate::store::MeasureStore;

/// Claim every full `batch_size`-wide block of unscheduled record ids
/// for `kind` and return the claimed `(start_id, end_id)` ranges in
/// order.
///
/// The first block of a kind starts at the lowest existing record id;
/// afterwards each block continues where the previous one ended. A
/// remainder smaller than `batch_size` is left unscheduled for a later
/// call. Repeated calls against unchanged inputs claim nothing, and a
/// claim lost to a concurrent scheduler stops the loop rather than
/// creating an overlapping range.
pub async fn schedule(
    store: &MeasureStore,
    kind: MeasureKind,
    batch_size: i64,
) -> Result<Vec<(i64, i64)>> {
    if batch_size <= 0 {
        anyhow::bail!("batch size must be positive, got {batch_size}");
    }

    let mut last_end = match store
        .max_block_end(kind)
        .await
        .context("query last scheduled block")?
    {
        Some(end) => end,
        None => match store
            .min_record_id(kind)
            .await
            .context("query first record id")?
        {
            Some(min_id) => min_id,
            None => return Ok(Vec::new()),
        },
    };

    let Some(max_id) = store
        .max_record_id(kind)
        .await
        .context("query last record id")?
    else {
        return Ok(Vec::new());
    };

    // Record ids are inclusive, block ranges half-open.
    let upper = max_id + 1;

    let mut claimed = Vec::new();
    while upper - last_end >= batch_size {
        let end = last_end + batch_size;
        if !store
            .claim_block(kind, last_end, end)
            .await
            .context("claim block")?
        {
            warn!(
                kind = %kind,
                start_id = last_end,
                end_id = end,
                "block claim lost to a concurrent scheduler, stopping"
            );
            break;
        }
        info!(kind = %kind, start_id = last_end, end_id = end, "block scheduled");
        claimed.push((last_end, end));
        last_end = end;
    }

    Ok(claimed)
}
