//! Archive writer: exports unarchived blocks, uploads the bundles and
//! records the object key and digest.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

use common::model::{MeasureBlock, MeasureKind};

use crate::backend::ArchiveBackend;
use crate::bundle;
use crate::store::MeasureStore;

#[derive(Clone, Debug)]
pub struct WriterOptions {
    /// Key prefix under which archives are uploaded.
    pub prefix: String,
    /// Directory where bundles are staged before upload.
    pub staging_dir: PathBuf,
    /// Remove the local bundle after a confirmed upload. Disable to
    /// retain artifacts for inspection.
    pub cleanup_local: bool,
}

/// One successfully written archive.
#[derive(Clone, Debug)]
pub struct WrittenArchive {
    pub kind: MeasureKind,
    pub start_id: i64,
    pub end_id: i64,
    pub key: String,
    pub archive_sha: Vec<u8>,
    pub local_path: PathBuf,
    pub records: usize,
}

/// Archive every block of `kind` that has no upload recorded yet.
///
/// Per block: export the record range to CSV, bundle it, upload under
/// the block's deterministic key, then persist `s3_key` and
/// `archive_sha` as the single commit point. An upload failure leaves
/// the block untouched and eligible for the next invocation; it never
/// aborts the remaining blocks of the same call.
pub async fn write_archives(
    store: &MeasureStore,
    backend: &dyn ArchiveBackend,
    opts: &WriterOptions,
    kind: MeasureKind,
) -> Result<Vec<WrittenArchive>> {
    let blocks = store
        .unarchived_blocks(kind)
        .await
        .context("list unarchived blocks")?;
    if blocks.is_empty() {
        return Ok(Vec::new());
    }

    tokio::fs::create_dir_all(&opts.staging_dir)
        .await
        .with_context(|| format!("create staging dir {}", opts.staging_dir.display()))?;

    let mut written = Vec::with_capacity(blocks.len());
    for block in &blocks {
        match write_block(store, backend, opts, kind, block).await {
            Ok(archive) => {
                info!(
                    kind = %kind,
                    start_id = archive.start_id,
                    end_id = archive.end_id,
                    key = %archive.key,
                    archive = %archive.local_path.display(),
                    sha1 = %hex::encode(&archive.archive_sha),
                    records = archive.records,
                    "block archived"
                );
                if opts.cleanup_local {
                    if let Err(e) = tokio::fs::remove_file(&archive.local_path).await {
                        warn!(
                            archive = %archive.local_path.display(),
                            error = %e,
                            "failed to remove local archive"
                        );
                    }
                }
                written.push(archive);
            }
            Err(e) => {
                warn!(
                    kind = %kind,
                    start_id = block.start_id,
                    end_id = block.end_id,
                    error = %e,
                    "block archival failed, will retry on next invocation"
                );
            }
        }
    }

    Ok(written)
}

async fn write_block(
    store: &MeasureStore,
    backend: &dyn ArchiveBackend,
    opts: &WriterOptions,
    kind: MeasureKind,
    block: &MeasureBlock,
) -> Result<WrittenArchive> {
    let records = store
        .fetch_records(kind, block.start_id, block.end_id)
        .await
        .context("fetch block records")?;

    let local_path = opts
        .staging_dir
        .join(format!("{}_{}-{}.zip", kind, block.start_id, block.end_id));
    let archive_sha =
        bundle::write_bundle(&local_path, kind, &records).context("write archive bundle")?;

    let key = block.object_key(&opts.prefix);
    if let Err(e) = backend.upload(&key, &local_path).await {
        // Nothing was persisted; a retry rebuilds the bundle from
        // scratch. The staged artifact is kept when cleanup is disabled
        // so the bytes that failed to upload can be examined.
        if opts.cleanup_local {
            let _ = tokio::fs::remove_file(&local_path).await;
        }
        return Err(e).context("upload archive");
    }

    store
        .set_archived(block.id, &key, &archive_sha)
        .await
        .context("record archive location")?;

    Ok(WrittenArchive {
        kind,
        start_id: block.start_id,
        end_id: block.end_id,
        key,
        archive_sha,
        local_path,
        records: records.len(),
    })
}
