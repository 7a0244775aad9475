//! Block archival pipeline for measurement tables.
//!
//! The pipeline runs three idempotent stages per measurement kind, each
//! invoked by an external periodic trigger:
//!
//! 1. [`schedule`] partitions the unscheduled record-id space into
//!    fixed-size contiguous blocks and persists them.
//! 2. [`write_archives`] exports each unarchived block to a compressed
//!    bundle, uploads it and records the object key and digest.
//! 3. [`delete_archived`] re-verifies the upload and, only once every
//!    record in the block has aged past the retention threshold, deletes
//!    the originals and finalizes the block.
//!
//! A block is the atomic unit of work: no stage ever leaves partial
//! per-block state behind, so every failure mode is safe to retry on the
//! next invocation.

pub mod backend;
pub mod bundle;
pub mod enforcer;
pub mod scheduler;
pub mod store;
pub mod writer;

pub use backend::{ArchiveBackend, ObjectStoreBackend};
pub use enforcer::{DeletionRun, EnforcerOptions, delete_archived};
pub use scheduler::schedule;
pub use store::MeasureStore;
pub use writer::{WriterOptions, WrittenArchive, write_archives};
