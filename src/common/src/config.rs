use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub archival: ArchivalConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// DSN of the measurement database (PostgreSQL or SQLite).
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/coldstore.db"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// DSN of the archive object store (file://, memory:// or s3://).
    pub dsn: String,
    /// Key prefix under which archive objects are stored.
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("file://.data/archives"),
            prefix: String::from("backups"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchivalConfig {
    /// Number of records per archival block.
    pub batch_size: i64,
    /// Minimum age a record must reach before it may be deleted.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// Maximum rows deleted per statement when draining a block.
    pub delete_chunk_size: i64,
    /// Interval between archival passes.
    #[serde(with = "humantime_serde")]
    pub run_interval: Duration,
    /// Directory where bundles are staged before upload.
    pub staging_dir: String,
    /// Remove local bundles after a confirmed upload.
    pub cleanup_local: bool,
}

impl Default for ArchivalConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            retention: Duration::from_secs(30 * 86400),
            delete_chunk_size: 1_000,
            run_interval: Duration::from_secs(3600),
            staging_dir: String::from(".data/staging"),
            cleanup_local: true,
        }
    }
}

impl Configuration {
    /// Load configuration from defaults, `coldstore.toml` and
    /// `COLDSTORE__`-prefixed environment variables, in that order.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file("coldstore.toml"))
            .merge(Env::prefixed("COLDSTORE__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    /// Load configuration from an explicit file path instead of the
    /// default `coldstore.toml`.
    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("COLDSTORE__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }
}
