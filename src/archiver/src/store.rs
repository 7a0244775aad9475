//! Relational boundary of the archival pipeline.
//!
//! [`MeasureStore`] is the explicit handle every pipeline operation takes;
//! there is no ambient session state. It speaks to the measurement
//! database (PostgreSQL or SQLite) and owns the `measure_blocks` ledger
//! plus read/delete access to the per-kind ingestion tables.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::postgres::PgPool;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Row, query};

use common::model::{MeasureBlock, MeasureKind, MeasureRecord};

/// Version of the store schema, embedded in every archive bundle as the
/// version-marker entry so bundles are self-describing on restore.
pub const SCHEMA_VERSION: &str = "1";

const BLOCK_COLUMNS: &str = "id, measure_type, start_id, end_id, s3_key, archive_sha, archive_date";

/// Store handle over the measurement database (PostgreSQL or SQLite).
#[derive(Clone)]
pub enum MeasureStore {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl MeasureStore {
    /// Connect to the measurement database and initialize the block
    /// ledger schema if it does not exist yet.
    pub async fn connect(dsn: &str) -> Result<Self, sqlx::Error> {
        log::info!("Connecting to measurement database with DSN: {dsn}");

        let store = if dsn.starts_with("sqlite:") {
            let pool = if dsn.contains(":memory:") {
                // A pooled in-memory database is per-connection; pin the
                // pool to a single long-lived connection so all callers
                // share one database.
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect(dsn)
                    .await?
            } else {
                // Add mode=rwc to create the database file if missing
                let dsn_with_create = if dsn.contains('?') {
                    dsn.to_string()
                } else {
                    format!("{dsn}?mode=rwc")
                };
                SqlitePool::connect(&dsn_with_create).await?
            };
            MeasureStore::Sqlite(pool)
        } else {
            MeasureStore::Postgres(PgPool::connect(dsn).await?)
        };

        store.init().await?;
        Ok(store)
    }

    /// Create the block ledger and ingestion tables if absent.
    async fn init(&self) -> Result<(), sqlx::Error> {
        match self {
            MeasureStore::Sqlite(pool) => {
                let create_blocks = r#"
                CREATE TABLE IF NOT EXISTS measure_blocks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    measure_type TEXT NOT NULL,
                    start_id INTEGER NOT NULL,
                    end_id INTEGER NOT NULL,
                    s3_key TEXT,
                    archive_sha BLOB,
                    archive_date TEXT
                )"#;
                query(create_blocks).execute(pool).await?;

                // The unique index is what makes concurrent block claims
                // race-free: the second claimant's insert is a no-op.
                query(
                    "CREATE UNIQUE INDEX IF NOT EXISTS measure_blocks_type_start \
                     ON measure_blocks (measure_type, start_id)",
                )
                .execute(pool)
                .await?;

                for kind in MeasureKind::ALL {
                    let create = format!(
                        "CREATE TABLE IF NOT EXISTS {} (\
                         id INTEGER PRIMARY KEY AUTOINCREMENT, \
                         created TEXT NOT NULL)",
                        kind.table_name()
                    );
                    query(&create).execute(pool).await?;
                }
            }
            MeasureStore::Postgres(pool) => {
                let create_blocks = r#"
                CREATE TABLE IF NOT EXISTS measure_blocks (
                    id BIGSERIAL PRIMARY KEY,
                    measure_type TEXT NOT NULL,
                    start_id BIGINT NOT NULL,
                    end_id BIGINT NOT NULL,
                    s3_key TEXT,
                    archive_sha BYTEA,
                    archive_date TIMESTAMPTZ
                )"#;
                query(create_blocks).execute(pool).await?;

                query(
                    "CREATE UNIQUE INDEX IF NOT EXISTS measure_blocks_type_start \
                     ON measure_blocks (measure_type, start_id)",
                )
                .execute(pool)
                .await?;

                for kind in MeasureKind::ALL {
                    let create = format!(
                        "CREATE TABLE IF NOT EXISTS {} (\
                         id BIGSERIAL PRIMARY KEY, \
                         created TIMESTAMPTZ NOT NULL)",
                        kind.table_name()
                    );
                    query(&create).execute(pool).await?;
                }
            }
        }

        Ok(())
    }

    /// Highest record id present for this kind, if any.
    pub async fn max_record_id(&self, kind: MeasureKind) -> Result<Option<i64>, sqlx::Error> {
        let sql = format!("SELECT MAX(id) AS max_id FROM {}", kind.table_name());
        match self {
            MeasureStore::Sqlite(pool) => {
                Ok(query(&sql).fetch_one(pool).await?.get::<Option<i64>, _>("max_id"))
            }
            MeasureStore::Postgres(pool) => {
                Ok(query(&sql).fetch_one(pool).await?.get::<Option<i64>, _>("max_id"))
            }
        }
    }

    /// Lowest record id present for this kind, if any.
    pub async fn min_record_id(&self, kind: MeasureKind) -> Result<Option<i64>, sqlx::Error> {
        let sql = format!("SELECT MIN(id) AS min_id FROM {}", kind.table_name());
        match self {
            MeasureStore::Sqlite(pool) => {
                Ok(query(&sql).fetch_one(pool).await?.get::<Option<i64>, _>("min_id"))
            }
            MeasureStore::Postgres(pool) => {
                Ok(query(&sql).fetch_one(pool).await?.get::<Option<i64>, _>("min_id"))
            }
        }
    }

    /// Highest `end_id` over all blocks of this kind, if any exist.
    pub async fn max_block_end(&self, kind: MeasureKind) -> Result<Option<i64>, sqlx::Error> {
        match self {
            MeasureStore::Sqlite(pool) => {
                let row = query("SELECT MAX(end_id) AS last_end FROM measure_blocks WHERE measure_type = ?")
                    .bind(kind.as_str())
                    .fetch_one(pool)
                    .await?;
                Ok(row.get::<Option<i64>, _>("last_end"))
            }
            MeasureStore::Postgres(pool) => {
                let row = query("SELECT MAX(end_id) AS last_end FROM measure_blocks WHERE measure_type = $1")
                    .bind(kind.as_str())
                    .fetch_one(pool)
                    .await?;
                Ok(row.get::<Option<i64>, _>("last_end"))
            }
        }
    }

    /// Atomically claim the block `[start_id, end_id)` for `kind`.
    ///
    /// The claim only succeeds if `start_id` still equals the current
    /// maximum `end_id` (or no blocks exist yet), re-checked inside a
    /// transaction, and if no other claimant inserted the same range
    /// first. Returns `false` when the claim was lost to a concurrent
    /// scheduler; the caller must stop extending its view of the range.
    pub async fn claim_block(
        &self,
        kind: MeasureKind,
        start_id: i64,
        end_id: i64,
    ) -> Result<bool, sqlx::Error> {
        match self {
            MeasureStore::Sqlite(pool) => {
                let mut tx = pool.begin().await?;
                let last_end: Option<i64> =
                    query("SELECT MAX(end_id) AS last_end FROM measure_blocks WHERE measure_type = ?")
                        .bind(kind.as_str())
                        .fetch_one(&mut *tx)
                        .await?
                        .get("last_end");
                if last_end.is_some_and(|e| e != start_id) {
                    return Ok(false);
                }
                let inserted = query(
                    "INSERT OR IGNORE INTO measure_blocks (measure_type, start_id, end_id) \
                     VALUES (?, ?, ?)",
                )
                .bind(kind.as_str())
                .bind(start_id)
                .bind(end_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                tx.commit().await?;
                Ok(inserted == 1)
            }
            MeasureStore::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                let last_end: Option<i64> =
                    query("SELECT MAX(end_id) AS last_end FROM measure_blocks WHERE measure_type = $1")
                        .bind(kind.as_str())
                        .fetch_one(&mut *tx)
                        .await?
                        .get("last_end");
                if last_end.is_some_and(|e| e != start_id) {
                    return Ok(false);
                }
                let inserted = query(
                    "INSERT INTO measure_blocks (measure_type, start_id, end_id) \
                     VALUES ($1, $2, $3) ON CONFLICT (measure_type, start_id) DO NOTHING",
                )
                .bind(kind.as_str())
                .bind(start_id)
                .bind(end_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                tx.commit().await?;
                Ok(inserted == 1)
            }
        }
    }

    /// Blocks of this kind with no archive uploaded yet, in range order.
    pub async fn unarchived_blocks(
        &self,
        kind: MeasureKind,
    ) -> Result<Vec<MeasureBlock>, sqlx::Error> {
        match self {
            MeasureStore::Sqlite(pool) => {
                let sql = format!(
                    "SELECT {BLOCK_COLUMNS} FROM measure_blocks \
                     WHERE measure_type = ? AND s3_key IS NULL ORDER BY start_id"
                );
                let rows = query(&sql).bind(kind.as_str()).fetch_all(pool).await?;
                rows.iter().map(block_from_sqlite_row).collect()
            }
            MeasureStore::Postgres(pool) => {
                let sql = format!(
                    "SELECT {BLOCK_COLUMNS} FROM measure_blocks \
                     WHERE measure_type = $1 AND s3_key IS NULL ORDER BY start_id"
                );
                let rows = query(&sql).bind(kind.as_str()).fetch_all(pool).await?;
                rows.iter().map(block_from_pg_row).collect()
            }
        }
    }

    /// Blocks that are archived but whose originals are still present.
    pub async fn deletable_blocks(
        &self,
        kind: MeasureKind,
    ) -> Result<Vec<MeasureBlock>, sqlx::Error> {
        match self {
            MeasureStore::Sqlite(pool) => {
                let sql = format!(
                    "SELECT {BLOCK_COLUMNS} FROM measure_blocks \
                     WHERE measure_type = ? AND s3_key IS NOT NULL \
                     AND archive_sha IS NOT NULL AND archive_date IS NULL \
                     ORDER BY start_id"
                );
                let rows = query(&sql).bind(kind.as_str()).fetch_all(pool).await?;
                rows.iter().map(block_from_sqlite_row).collect()
            }
            MeasureStore::Postgres(pool) => {
                let sql = format!(
                    "SELECT {BLOCK_COLUMNS} FROM measure_blocks \
                     WHERE measure_type = $1 AND s3_key IS NOT NULL \
                     AND archive_sha IS NOT NULL AND archive_date IS NULL \
                     ORDER BY start_id"
                );
                let rows = query(&sql).bind(kind.as_str()).fetch_all(pool).await?;
                rows.iter().map(block_from_pg_row).collect()
            }
        }
    }

    /// Fetch all records of `kind` with id in `[start_id, end_id)`.
    pub async fn fetch_records(
        &self,
        kind: MeasureKind,
        start_id: i64,
        end_id: i64,
    ) -> Result<Vec<MeasureRecord>, sqlx::Error> {
        match self {
            MeasureStore::Sqlite(pool) => {
                let sql = format!(
                    "SELECT id, created FROM {} WHERE id >= ? AND id < ? ORDER BY id",
                    kind.table_name()
                );
                let rows = query(&sql).bind(start_id).bind(end_id).fetch_all(pool).await?;
                rows.iter()
                    .map(|row| {
                        Ok(MeasureRecord {
                            id: row.get("id"),
                            created: parse_timestamp(&row.get::<String, _>("created"))?,
                        })
                    })
                    .collect()
            }
            MeasureStore::Postgres(pool) => {
                let sql = format!(
                    "SELECT id, created FROM {} WHERE id >= $1 AND id < $2 ORDER BY id",
                    kind.table_name()
                );
                let rows = query(&sql).bind(start_id).bind(end_id).fetch_all(pool).await?;
                Ok(rows
                    .iter()
                    .map(|row| MeasureRecord {
                        id: row.get("id"),
                        created: row.get("created"),
                    })
                    .collect())
            }
        }
    }

    /// Record a completed upload on a block. Sets `s3_key` and
    /// `archive_sha` together, and only if both are still unset, so a
    /// redundant writer cannot rewrite an already-committed block.
    pub async fn set_archived(
        &self,
        block_id: i64,
        s3_key: &str,
        archive_sha: &[u8],
    ) -> Result<bool, sqlx::Error> {
        match self {
            MeasureStore::Sqlite(pool) => {
                let updated = query(
                    "UPDATE measure_blocks SET s3_key = ?, archive_sha = ? \
                     WHERE id = ? AND s3_key IS NULL AND archive_sha IS NULL",
                )
                .bind(s3_key)
                .bind(archive_sha.to_vec())
                .bind(block_id)
                .execute(pool)
                .await?
                .rows_affected();
                Ok(updated == 1)
            }
            MeasureStore::Postgres(pool) => {
                let updated = query(
                    "UPDATE measure_blocks SET s3_key = $1, archive_sha = $2 \
                     WHERE id = $3 AND s3_key IS NULL AND archive_sha IS NULL",
                )
                .bind(s3_key)
                .bind(archive_sha.to_vec())
                .bind(block_id)
                .execute(pool)
                .await?
                .rows_affected();
                Ok(updated == 1)
            }
        }
    }

    /// Count records in `[start_id, end_id)` created after `cutoff`,
    /// i.e. records still too young to delete.
    pub async fn count_younger_than(
        &self,
        kind: MeasureKind,
        start_id: i64,
        end_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        match self {
            MeasureStore::Sqlite(pool) => {
                let sql = format!(
                    "SELECT COUNT(*) AS young FROM {} \
                     WHERE id >= ? AND id < ? AND created > ?",
                    kind.table_name()
                );
                let row = query(&sql)
                    .bind(start_id)
                    .bind(end_id)
                    .bind(format_timestamp(cutoff))
                    .fetch_one(pool)
                    .await?;
                Ok(row.get("young"))
            }
            MeasureStore::Postgres(pool) => {
                let sql = format!(
                    "SELECT COUNT(*) AS young FROM {} \
                     WHERE id >= $1 AND id < $2 AND created > $3",
                    kind.table_name()
                );
                let row = query(&sql)
                    .bind(start_id)
                    .bind(end_id)
                    .bind(cutoff)
                    .fetch_one(pool)
                    .await?;
                Ok(row.get("young"))
            }
        }
    }

    /// Delete all records of `kind` in `[start_id, end_id)`, at most
    /// `chunk_size` ids per statement to bound lock duration. Returns
    /// the number of rows deleted.
    pub async fn delete_records_range(
        &self,
        kind: MeasureKind,
        start_id: i64,
        end_id: i64,
        chunk_size: i64,
    ) -> Result<u64, sqlx::Error> {
        let chunk_size = chunk_size.max(1);
        let mut deleted = 0u64;
        let mut lo = start_id;
        while lo < end_id {
            let hi = end_id.min(lo + chunk_size);
            deleted += match self {
                MeasureStore::Sqlite(pool) => {
                    let sql =
                        format!("DELETE FROM {} WHERE id >= ? AND id < ?", kind.table_name());
                    query(&sql).bind(lo).bind(hi).execute(pool).await?.rows_affected()
                }
                MeasureStore::Postgres(pool) => {
                    let sql =
                        format!("DELETE FROM {} WHERE id >= $1 AND id < $2", kind.table_name());
                    query(&sql).bind(lo).bind(hi).execute(pool).await?.rows_affected()
                }
            };
            lo = hi;
        }
        Ok(deleted)
    }

    /// Finalize a block by stamping `archive_date`. Only transitions
    /// forward: a block that already carries a date is left untouched.
    pub async fn finalize_block(
        &self,
        block_id: i64,
        archive_date: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        match self {
            MeasureStore::Sqlite(pool) => {
                let updated = query(
                    "UPDATE measure_blocks SET archive_date = ? \
                     WHERE id = ? AND archive_date IS NULL",
                )
                .bind(format_timestamp(archive_date))
                .bind(block_id)
                .execute(pool)
                .await?
                .rows_affected();
                Ok(updated == 1)
            }
            MeasureStore::Postgres(pool) => {
                let updated = query(
                    "UPDATE measure_blocks SET archive_date = $1 \
                     WHERE id = $2 AND archive_date IS NULL",
                )
                .bind(archive_date)
                .bind(block_id)
                .execute(pool)
                .await?
                .rows_affected();
                Ok(updated == 1)
            }
        }
    }
}

/// Test-support operations. Record ingestion belongs to the external
/// pipeline in production; tests need a way to seed and inspect it.
#[cfg(any(test, feature = "testing"))]
impl MeasureStore {
    pub async fn insert_record(
        &self,
        kind: MeasureKind,
        created: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        match self {
            MeasureStore::Sqlite(pool) => {
                let sql = format!(
                    "INSERT INTO {} (created) VALUES (?) RETURNING id",
                    kind.table_name()
                );
                let row = query(&sql).bind(format_timestamp(created)).fetch_one(pool).await?;
                Ok(row.get("id"))
            }
            MeasureStore::Postgres(pool) => {
                let sql = format!(
                    "INSERT INTO {} (created) VALUES ($1) RETURNING id",
                    kind.table_name()
                );
                let row = query(&sql).bind(created).fetch_one(pool).await?;
                Ok(row.get("id"))
            }
        }
    }

    pub async fn insert_record_with_id(
        &self,
        kind: MeasureKind,
        id: i64,
        created: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        match self {
            MeasureStore::Sqlite(pool) => {
                let sql = format!(
                    "INSERT INTO {} (id, created) VALUES (?, ?)",
                    kind.table_name()
                );
                query(&sql).bind(id).bind(format_timestamp(created)).execute(pool).await?;
            }
            MeasureStore::Postgres(pool) => {
                let sql = format!(
                    "INSERT INTO {} (id, created) VALUES ($1, $2)",
                    kind.table_name()
                );
                query(&sql).bind(id).bind(created).execute(pool).await?;
            }
        }
        Ok(())
    }

    pub async fn count_records(&self, kind: MeasureKind) -> Result<i64, sqlx::Error> {
        let sql = format!("SELECT COUNT(*) AS total FROM {}", kind.table_name());
        match self {
            MeasureStore::Sqlite(pool) => Ok(query(&sql).fetch_one(pool).await?.get("total")),
            MeasureStore::Postgres(pool) => Ok(query(&sql).fetch_one(pool).await?.get("total")),
        }
    }

    pub async fn backdate_records(
        &self,
        kind: MeasureKind,
        start_id: i64,
        end_id: i64,
        created: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        match self {
            MeasureStore::Sqlite(pool) => {
                let sql = format!(
                    "UPDATE {} SET created = ? WHERE id >= ? AND id < ?",
                    kind.table_name()
                );
                query(&sql)
                    .bind(format_timestamp(created))
                    .bind(start_id)
                    .bind(end_id)
                    .execute(pool)
                    .await?;
            }
            MeasureStore::Postgres(pool) => {
                let sql = format!(
                    "UPDATE {} SET created = $1 WHERE id >= $2 AND id < $3",
                    kind.table_name()
                );
                query(&sql).bind(created).bind(start_id).bind(end_id).execute(pool).await?;
            }
        }
        Ok(())
    }

    /// All blocks of this kind in range order, regardless of state.
    pub async fn blocks(&self, kind: MeasureKind) -> Result<Vec<MeasureBlock>, sqlx::Error> {
        match self {
            MeasureStore::Sqlite(pool) => {
                let sql = format!(
                    "SELECT {BLOCK_COLUMNS} FROM measure_blocks \
                     WHERE measure_type = ? ORDER BY start_id"
                );
                let rows = query(&sql).bind(kind.as_str()).fetch_all(pool).await?;
                rows.iter().map(block_from_sqlite_row).collect()
            }
            MeasureStore::Postgres(pool) => {
                let sql = format!(
                    "SELECT {BLOCK_COLUMNS} FROM measure_blocks \
                     WHERE measure_type = $1 ORDER BY start_id"
                );
                let rows = query(&sql).bind(kind.as_str()).fetch_all(pool).await?;
                rows.iter().map(block_from_pg_row).collect()
            }
        }
    }
}

/// SQLite stores timestamps as RFC 3339 text; microsecond precision with
/// a `Z` suffix keeps lexicographic and chronological order identical.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn block_from_sqlite_row(row: &sqlx::sqlite::SqliteRow) -> Result<MeasureBlock, sqlx::Error> {
    let measure_type: String = row.get("measure_type");
    let measure_type = measure_type
        .parse::<MeasureKind>()
        .map_err(|e| sqlx::Error::Decode(e.into()))?;
    let archive_date = row
        .get::<Option<String>, _>("archive_date")
        .map(|s| parse_timestamp(&s))
        .transpose()?;

    Ok(MeasureBlock {
        id: row.get("id"),
        measure_type,
        start_id: row.get("start_id"),
        end_id: row.get("end_id"),
        s3_key: row.get("s3_key"),
        archive_sha: row.get("archive_sha"),
        archive_date,
    })
}

fn block_from_pg_row(row: &sqlx::postgres::PgRow) -> Result<MeasureBlock, sqlx::Error> {
    let measure_type: String = row.get("measure_type");
    let measure_type = measure_type
        .parse::<MeasureKind>()
        .map_err(|e| sqlx::Error::Decode(e.into()))?;

    Ok(MeasureBlock {
        id: row.get("id"),
        measure_type,
        start_id: row.get("start_id"),
        end_id: row.get("end_id"),
        s3_key: row.get("s3_key"),
        archive_sha: row.get("archive_sha"),
        archive_date: row.get("archive_date"),
    })
}
