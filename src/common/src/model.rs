use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of measurement a table holds. Each kind binds to its own
/// ingestion table and export filename; the archival pipeline itself is
/// kind-agnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasureKind {
    Cell,
    Wifi,
}

impl MeasureKind {
    pub const ALL: [MeasureKind; 2] = [MeasureKind::Cell, MeasureKind::Wifi];

    pub fn as_str(self) -> &'static str {
        match self {
            MeasureKind::Cell => "cell",
            MeasureKind::Wifi => "wifi",
        }
    }

    /// Name of the ingestion table holding raw records of this kind.
    pub fn table_name(self) -> &'static str {
        match self {
            MeasureKind::Cell => "cell_measure",
            MeasureKind::Wifi => "wifi_measure",
        }
    }

    /// Name of the CSV export entry inside an archive bundle.
    pub fn csv_filename(self) -> &'static str {
        match self {
            MeasureKind::Cell => "cell_measure.csv",
            MeasureKind::Wifi => "wifi_measure.csv",
        }
    }
}

impl fmt::Display for MeasureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeasureKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cell" => Ok(MeasureKind::Cell),
            "wifi" => Ok(MeasureKind::Wifi),
            other => Err(anyhow::anyhow!("unknown measure kind: {other}")),
        }
    }
}

/// One raw measurement row. Owned by the external ingestion pipeline;
/// the archival core only reads and deletes these.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasureRecord {
    pub id: i64,
    pub created: DateTime<Utc>,
}

/// Lifecycle state of a block, derived from which fields are set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// Range claimed, nothing uploaded yet.
    Scheduled,
    /// Archive uploaded and recorded, originals still present.
    Archived,
    /// Originals deleted; terminal.
    Finalized,
}

/// A persisted, contiguous half-open id range forming one archival unit.
///
/// Blocks of one kind never overlap and strictly increase in `start_id`.
/// Fields only ever transition forward: `s3_key`/`archive_sha` are set
/// together when the upload commits, `archive_date` when the originals
/// are deleted. Blocks are never deleted.
#[derive(Clone, Debug)]
pub struct MeasureBlock {
    pub id: i64,
    pub measure_type: MeasureKind,
    pub start_id: i64,
    pub end_id: i64,
    pub s3_key: Option<String>,
    pub archive_sha: Option<Vec<u8>>,
    pub archive_date: Option<DateTime<Utc>>,
}

impl MeasureBlock {
    /// Deterministic object key for this block, derivable from block
    /// fields alone so redundant writers converge on the same object.
    pub fn object_key(&self, prefix: &str) -> String {
        format!(
            "{}/{}_{}-{}",
            prefix.trim_end_matches('/'),
            self.measure_type,
            self.start_id,
            self.end_id
        )
    }

    pub fn state(&self) -> BlockState {
        match (&self.s3_key, &self.archive_date) {
            (None, _) => BlockState::Scheduled,
            (Some(_), None) => BlockState::Archived,
            (Some(_), Some(_)) => BlockState::Finalized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(s3_key: Option<&str>, archive_date: Option<DateTime<Utc>>) -> MeasureBlock {
        MeasureBlock {
            id: 1,
            measure_type: MeasureKind::Cell,
            start_id: 120,
            end_id: 140,
            s3_key: s3_key.map(String::from),
            archive_sha: s3_key.map(|_| vec![0u8; 20]),
            archive_date,
        }
    }

    #[test]
    fn test_object_key_is_deterministic() {
        let b = block(None, None);
        assert_eq!(b.object_key("backups/tests"), "backups/tests/cell_120-140");
        // Trailing slash on the prefix must not double up
        assert_eq!(b.object_key("backups/"), "backups/cell_120-140");
    }

    #[test]
    fn test_block_state_progression() {
        assert_eq!(block(None, None).state(), BlockState::Scheduled);
        assert_eq!(block(Some("k"), None).state(), BlockState::Archived);
        assert_eq!(
            block(Some("k"), Some(Utc::now())).state(),
            BlockState::Finalized
        );
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in MeasureKind::ALL {
            assert_eq!(kind.as_str().parse::<MeasureKind>().unwrap(), kind);
        }
        assert!("bluetooth".parse::<MeasureKind>().is_err());
    }

    #[test]
    fn test_kind_bindings() {
        assert_eq!(MeasureKind::Cell.table_name(), "cell_measure");
        assert_eq!(MeasureKind::Wifi.csv_filename(), "wifi_measure.csv");
    }
}
