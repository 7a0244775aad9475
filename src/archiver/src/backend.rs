//! Object store boundary: the two operations the pipeline needs from
//! durable storage, behind a trait so tests can substitute a double.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::{ObjectStore, path::Path as ObjectPath};

use crate::bundle::sha1_digest;

/// Narrow interface to the archive object store. The pipeline depends on
/// nothing else from the store: no listing, no range reads.
#[async_trait]
pub trait ArchiveBackend: Send + Sync {
    /// Durably store the local artifact under `key`.
    async fn upload(&self, key: &str, local_path: &Path) -> Result<()>;

    /// Confirm the object exists and its content matches `expected_sha`.
    async fn verify(&self, key: &str, expected_sha: &[u8]) -> Result<bool>;
}

/// Production backend over any `object_store` implementation
/// (S3, local filesystem, in-memory).
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ArchiveBackend for ObjectStoreBackend {
    async fn upload(&self, key: &str, local_path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("read local archive {}", local_path.display()))?;
        self.store
            .put(&ObjectPath::from(key), Bytes::from(bytes).into())
            .await
            .with_context(|| format!("upload archive to {key}"))?;
        Ok(())
    }

    async fn verify(&self, key: &str, expected_sha: &[u8]) -> Result<bool> {
        match self.store.get(&ObjectPath::from(key)).await {
            Ok(result) => {
                let bytes = result
                    .bytes()
                    .await
                    .with_context(|| format!("read remote archive {key}"))?;
                Ok(sha1_digest(&bytes).as_slice() == expected_sha)
            }
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("verify archive {key}")),
        }
    }
}
