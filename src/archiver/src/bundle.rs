//! Archive bundle format: a zip container holding a fixed version-marker
//! entry plus one CSV export per bundle.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use sha1::{Digest, Sha1};
use thiserror::Error;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use common::model::{MeasureKind, MeasureRecord};

use crate::store::SCHEMA_VERSION;

/// Fixed name of the version-marker entry present in every bundle.
pub const VERSION_MARKER_ENTRY: &str = "schema_version.txt";

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bundle container error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("csv export error: {0}")]
    Csv(#[from] csv::Error),
}

/// Write the archive bundle for one block to `path` and return the SHA1
/// digest over the final compressed bytes.
///
/// The bundle contains exactly two entries: [`VERSION_MARKER_ENTRY`] and
/// the kind's CSV export with one row per record.
pub fn write_bundle(
    path: &Path,
    kind: MeasureKind,
    records: &[MeasureRecord],
) -> Result<Vec<u8>, BundleError> {
    let file = File::create(path)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(VERSION_MARKER_ENTRY, options)?;
    zip.write_all(SCHEMA_VERSION.as_bytes())?;

    zip.start_file(kind.csv_filename(), options)?;
    zip.write_all(&export_csv(records)?)?;

    zip.finish()?;

    // The digest covers the bytes exactly as uploaded.
    let bytes = std::fs::read(path)?;
    Ok(sha1_digest(&bytes))
}

fn export_csv(records: &[MeasureRecord]) -> Result<Vec<u8>, BundleError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["id", "created"])?;
    for record in records {
        writer.write_record([record.id.to_string(), record.created.to_rfc3339()])?;
    }
    writer.into_inner().map_err(|e| BundleError::Io(e.into_error()))
}

/// SHA1 over a byte slice as raw digest bytes.
pub fn sha1_digest(bytes: &[u8]) -> Vec<u8> {
    Sha1::digest(bytes).to_vec()
}
