//! End-to-end tests for the block archival pipeline: scheduling, bundle
//! round trips, and verification- and age-gated deletion.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use object_store::memory::InMemory;
use sha1::{Digest, Sha1};
use tempfile::TempDir;

use archiver::{
    ArchiveBackend, EnforcerOptions, MeasureStore, ObjectStoreBackend, WriterOptions,
    delete_archived, schedule, write_archives,
};
use common::model::MeasureKind;

async fn test_store() -> MeasureStore {
    MeasureStore::connect("sqlite::memory:").await.unwrap()
}

fn memory_backend() -> ObjectStoreBackend {
    ObjectStoreBackend::new(Arc::new(InMemory::new()))
}

fn really_old() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1980, 1, 1, 0, 0, 0).unwrap()
}

fn writer_opts(staging: &TempDir, cleanup_local: bool) -> WriterOptions {
    WriterOptions {
        prefix: "backups/tests".to_string(),
        staging_dir: staging.path().to_path_buf(),
        cleanup_local,
    }
}

fn enforcer_opts() -> EnforcerOptions {
    EnforcerOptions {
        retention: Duration::from_secs(3600),
        // Small chunk so multi-chunk deletes are exercised
        delete_chunk_size: 7,
    }
}

/// Seed `n` records of `kind` and return the first assigned id.
async fn seed(store: &MeasureStore, kind: MeasureKind, n: usize, created: DateTime<Utc>) -> i64 {
    let mut first = None;
    for _ in 0..n {
        let id = store.insert_record(kind, created).await.unwrap();
        first.get_or_insert(id);
    }
    first.unwrap()
}

fn sha1_of_file(path: &Path) -> Vec<u8> {
    Sha1::digest(std::fs::read(path).unwrap()).to_vec()
}

/// Backend double whose upload always fails, as when the object store is
/// unreachable.
struct UnreachableBackend;

#[async_trait]
impl ArchiveBackend for UnreachableBackend {
    async fn upload(&self, _key: &str, _local_path: &Path) -> Result<()> {
        anyhow::bail!("object store unreachable")
    }

    async fn verify(&self, _key: &str, _expected_sha: &[u8]) -> Result<bool> {
        Ok(false)
    }
}

/// Backend double that stores objects but reports every verification as
/// failed.
struct DenyingBackend(ObjectStoreBackend);

#[async_trait]
impl ArchiveBackend for DenyingBackend {
    async fn upload(&self, key: &str, local_path: &Path) -> Result<()> {
        self.0.upload(key, local_path).await
    }

    async fn verify(&self, _key: &str, _expected_sha: &[u8]) -> Result<bool> {
        Ok(false)
    }
}

/// Backend double that rejects uploads for keys containing a marker,
/// passing everything else through.
struct PartiallyFailingBackend {
    inner: ObjectStoreBackend,
    reject: String,
}

#[async_trait]
impl ArchiveBackend for PartiallyFailingBackend {
    async fn upload(&self, key: &str, local_path: &Path) -> Result<()> {
        if key.contains(&self.reject) {
            anyhow::bail!("injected upload failure for {key}");
        }
        self.inner.upload(key, local_path).await
    }

    async fn verify(&self, key: &str, expected_sha: &[u8]) -> Result<bool> {
        self.inner.verify(key, expected_sha).await
    }
}

#[tokio::test]
async fn test_schedule_cell_measures() {
    let store = test_store().await;
    let start_id = seed(&store, MeasureKind::Cell, 20, really_old()).await;

    let blocks = schedule(&store, MeasureKind::Cell, 15).await.unwrap();
    assert_eq!(blocks, vec![(start_id, start_id + 15)]);

    // Remainder of 5 is not enough for a batch of 6
    let blocks = schedule(&store, MeasureKind::Cell, 6).await.unwrap();
    assert!(blocks.is_empty());

    let blocks = schedule(&store, MeasureKind::Cell, 5).await.unwrap();
    assert_eq!(blocks, vec![(start_id + 15, start_id + 20)]);

    // Everything is scheduled now
    let blocks = schedule(&store, MeasureKind::Cell, 1).await.unwrap();
    assert!(blocks.is_empty());
}

#[tokio::test]
async fn test_schedule_wifi_measures() {
    let store = test_store().await;
    let batch_size = 10;
    let start_id = seed(&store, MeasureKind::Wifi, 2 * batch_size as usize, really_old()).await;

    let blocks = schedule(&store, MeasureKind::Wifi, batch_size).await.unwrap();
    assert_eq!(
        blocks,
        vec![
            (start_id, start_id + batch_size),
            (start_id + batch_size, start_id + 2 * batch_size),
        ]
    );

    // Unchanged inputs schedule nothing further
    let blocks = schedule(&store, MeasureKind::Wifi, batch_size).await.unwrap();
    assert!(blocks.is_empty());
}

#[tokio::test]
async fn test_schedule_kinds_are_independent() {
    let store = test_store().await;
    let cell_start = seed(&store, MeasureKind::Cell, 10, really_old()).await;
    seed(&store, MeasureKind::Wifi, 3, really_old()).await;

    let blocks = schedule(&store, MeasureKind::Cell, 10).await.unwrap();
    assert_eq!(blocks, vec![(cell_start, cell_start + 10)]);

    let blocks = schedule(&store, MeasureKind::Wifi, 10).await.unwrap();
    assert!(blocks.is_empty());
}

#[tokio::test]
async fn test_archive_round_trip() {
    let store = test_store().await;
    let backend = memory_backend();
    let staging = TempDir::new().unwrap();
    let start_id = seed(&store, MeasureKind::Cell, 10, really_old()).await;

    schedule(&store, MeasureKind::Cell, 10).await.unwrap();
    let written = write_archives(&store, &backend, &writer_opts(&staging, false), MeasureKind::Cell)
        .await
        .unwrap();
    assert_eq!(written.len(), 1);
    let archive = &written[0];
    assert_eq!(archive.records, 10);

    // The retained local artifact holds exactly the version marker and
    // the kind's export
    let mut bundle = zip::ZipArchive::new(File::open(&archive.local_path).unwrap()).unwrap();
    let mut names: Vec<String> = bundle.file_names().map(String::from).collect();
    names.sort();
    assert_eq!(names, vec!["cell_measure.csv", "schema_version.txt"]);
    drop(bundle);

    // Persisted digest matches the artifact bytes and what the writer
    // reported
    let recomputed = sha1_of_file(&archive.local_path);
    assert_eq!(archive.archive_sha, recomputed);

    let block = &store.blocks(MeasureKind::Cell).await.unwrap()[0];
    assert_eq!(block.archive_sha.as_deref(), Some(recomputed.as_slice()));
    let key = block.s3_key.as_deref().unwrap();
    assert!(key.contains("/cell_"));
    assert_eq!(key, format!("backups/tests/cell_{}-{}", start_id, start_id + 10));
    assert!(block.archive_date.is_none());

    // And the uploaded object verifies against the persisted digest
    assert!(backend.verify(key, &recomputed).await.unwrap());
}

#[tokio::test]
async fn test_archive_cleanup_removes_local_artifact() {
    let store = test_store().await;
    let backend = memory_backend();
    let staging = TempDir::new().unwrap();
    seed(&store, MeasureKind::Wifi, 10, really_old()).await;

    schedule(&store, MeasureKind::Wifi, 10).await.unwrap();
    let written = write_archives(&store, &backend, &writer_opts(&staging, true), MeasureKind::Wifi)
        .await
        .unwrap();
    assert_eq!(written.len(), 1);
    assert!(!written[0].local_path.exists());

    // The upload itself is unaffected by local cleanup
    assert!(
        backend
            .verify(&written[0].key, &written[0].archive_sha)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_upload_failure_leaves_block_eligible() {
    let store = test_store().await;
    let staging = TempDir::new().unwrap();
    seed(&store, MeasureKind::Cell, 10, really_old()).await;
    schedule(&store, MeasureKind::Cell, 10).await.unwrap();

    let written = write_archives(
        &store,
        &UnreachableBackend,
        &writer_opts(&staging, true),
        MeasureKind::Cell,
    )
    .await
    .unwrap();
    assert!(written.is_empty());

    // No partial state was persisted; the block is still eligible
    let block = &store.blocks(MeasureKind::Cell).await.unwrap()[0];
    assert!(block.s3_key.is_none());
    assert!(block.archive_sha.is_none());

    // The next invocation with a healthy backend succeeds
    let backend = memory_backend();
    let written = write_archives(&store, &backend, &writer_opts(&staging, true), MeasureKind::Cell)
        .await
        .unwrap();
    assert_eq!(written.len(), 1);
}

#[tokio::test]
async fn test_failed_upload_retains_artifact_when_cleanup_disabled() {
    let store = test_store().await;
    let staging = TempDir::new().unwrap();
    let start_id = seed(&store, MeasureKind::Cell, 10, really_old()).await;
    schedule(&store, MeasureKind::Cell, 10).await.unwrap();

    write_archives(
        &store,
        &UnreachableBackend,
        &writer_opts(&staging, false),
        MeasureKind::Cell,
    )
    .await
    .unwrap();

    // The bundle that failed to upload stays on disk for inspection
    let bundle = staging
        .path()
        .join(format!("cell_{}-{}.zip", start_id, start_id + 10));
    assert!(bundle.exists());

    // With cleanup enabled the failed bundle is removed
    write_archives(
        &store,
        &UnreachableBackend,
        &writer_opts(&staging, true),
        MeasureKind::Cell,
    )
    .await
    .unwrap();
    assert!(!bundle.exists());
}

#[tokio::test]
async fn test_one_failed_block_does_not_abort_siblings() {
    let store = test_store().await;
    let staging = TempDir::new().unwrap();
    let start_id = seed(&store, MeasureKind::Cell, 20, really_old()).await;
    schedule(&store, MeasureKind::Cell, 10).await.unwrap();

    let backend = PartiallyFailingBackend {
        inner: memory_backend(),
        reject: format!("cell_{start_id}-"),
    };
    let written = write_archives(&store, &backend, &writer_opts(&staging, true), MeasureKind::Cell)
        .await
        .unwrap();

    // The first block failed, the second one went through
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].start_id, start_id + 10);

    let blocks = store.blocks(MeasureKind::Cell).await.unwrap();
    assert!(blocks[0].s3_key.is_none());
    assert!(blocks[1].s3_key.is_some());
}

#[tokio::test]
async fn test_delete_archived_records() {
    let store = test_store().await;
    let backend = memory_backend();
    let staging = TempDir::new().unwrap();
    for id in 100..150 {
        store
            .insert_record_with_id(MeasureKind::Cell, id, really_old())
            .await
            .unwrap();
    }
    store.claim_block(MeasureKind::Cell, 120, 140).await.unwrap();
    write_archives(&store, &backend, &writer_opts(&staging, true), MeasureKind::Cell)
        .await
        .unwrap();

    let run = delete_archived(&store, &backend, &enforcer_opts(), MeasureKind::Cell)
        .await
        .unwrap();
    assert_eq!(run.blocks_finalized, 1);
    assert_eq!(run.records_deleted, 20);

    // Records outside the block survive
    assert_eq!(store.count_records(MeasureKind::Cell).await.unwrap(), 30);
    let block = &store.blocks(MeasureKind::Cell).await.unwrap()[0];
    assert!(block.archive_date.is_some());
}

#[tokio::test]
async fn test_delete_archived_is_idempotent() {
    let store = test_store().await;
    let backend = memory_backend();
    let staging = TempDir::new().unwrap();
    seed(&store, MeasureKind::Wifi, 10, really_old()).await;
    schedule(&store, MeasureKind::Wifi, 10).await.unwrap();
    write_archives(&store, &backend, &writer_opts(&staging, true), MeasureKind::Wifi)
        .await
        .unwrap();

    let run = delete_archived(&store, &backend, &enforcer_opts(), MeasureKind::Wifi)
        .await
        .unwrap();
    assert_eq!(run.records_deleted, 10);
    let archive_date = store.blocks(MeasureKind::Wifi).await.unwrap()[0].archive_date;

    // A second pass has nothing left to do and changes nothing
    let run = delete_archived(&store, &backend, &enforcer_opts(), MeasureKind::Wifi)
        .await
        .unwrap();
    assert_eq!(run.blocks_examined, 0);
    assert_eq!(run.records_deleted, 0);
    assert_eq!(
        store.blocks(MeasureKind::Wifi).await.unwrap()[0].archive_date,
        archive_date
    );
}

#[tokio::test]
async fn test_young_records_defer_whole_block() {
    let store = test_store().await;
    let backend = memory_backend();
    let staging = TempDir::new().unwrap();
    let start_id = seed(&store, MeasureKind::Cell, 10, Utc::now()).await;
    schedule(&store, MeasureKind::Cell, 10).await.unwrap();
    write_archives(&store, &backend, &writer_opts(&staging, true), MeasureKind::Cell)
        .await
        .unwrap();

    // All records are younger than the retention threshold: nothing may
    // be deleted, however often the enforcer runs
    for _ in 0..2 {
        let run = delete_archived(&store, &backend, &enforcer_opts(), MeasureKind::Cell)
            .await
            .unwrap();
        assert_eq!(run.blocks_deferred, 1);
        assert_eq!(run.records_deleted, 0);
        assert_eq!(store.count_records(MeasureKind::Cell).await.unwrap(), 10);
        let block = &store.blocks(MeasureKind::Cell).await.unwrap()[0];
        assert!(block.archive_date.is_none());
    }

    // Once every record has aged past the threshold the next pass
    // drains the block
    store
        .backdate_records(MeasureKind::Cell, start_id, start_id + 10, really_old())
        .await
        .unwrap();
    let run = delete_archived(&store, &backend, &enforcer_opts(), MeasureKind::Cell)
        .await
        .unwrap();
    assert_eq!(run.blocks_finalized, 1);
    assert_eq!(store.count_records(MeasureKind::Cell).await.unwrap(), 0);
    assert!(store.blocks(MeasureKind::Cell).await.unwrap()[0].archive_date.is_some());
}

#[tokio::test]
async fn test_single_young_record_defers_whole_block() {
    let store = test_store().await;
    let backend = memory_backend();
    let staging = TempDir::new().unwrap();
    let start_id = seed(&store, MeasureKind::Cell, 10, really_old()).await;
    schedule(&store, MeasureKind::Cell, 10).await.unwrap();
    write_archives(&store, &backend, &writer_opts(&staging, true), MeasureKind::Cell)
        .await
        .unwrap();

    // One record too young gates the entire block
    store
        .backdate_records(MeasureKind::Cell, start_id + 4, start_id + 5, Utc::now())
        .await
        .unwrap();

    let run = delete_archived(&store, &backend, &enforcer_opts(), MeasureKind::Cell)
        .await
        .unwrap();
    assert_eq!(run.blocks_deferred, 1);
    assert_eq!(store.count_records(MeasureKind::Cell).await.unwrap(), 10);
}

#[tokio::test]
async fn test_failed_verification_gates_deletion() {
    let store = test_store().await;
    let objects: Arc<InMemory> = Arc::new(InMemory::new());
    let denying = DenyingBackend(ObjectStoreBackend::new(objects.clone()));
    let staging = TempDir::new().unwrap();
    seed(&store, MeasureKind::Wifi, 10, really_old()).await;
    schedule(&store, MeasureKind::Wifi, 10).await.unwrap();
    write_archives(&store, &denying, &writer_opts(&staging, true), MeasureKind::Wifi)
        .await
        .unwrap();

    // Records are well past retention age, but verification says no
    let run = delete_archived(&store, &denying, &enforcer_opts(), MeasureKind::Wifi)
        .await
        .unwrap();
    assert_eq!(run.blocks_deferred, 1);
    assert_eq!(run.records_deleted, 0);
    assert_eq!(store.count_records(MeasureKind::Wifi).await.unwrap(), 10);
    assert!(store.blocks(MeasureKind::Wifi).await.unwrap()[0].archive_date.is_none());

    // The same objects seen through an honest backend verify fine and
    // the deletion completes
    let trusting = ObjectStoreBackend::new(objects);
    let run = delete_archived(&store, &trusting, &enforcer_opts(), MeasureKind::Wifi)
        .await
        .unwrap();
    assert_eq!(run.blocks_finalized, 1);
    assert_eq!(store.count_records(MeasureKind::Wifi).await.unwrap(), 0);
}
