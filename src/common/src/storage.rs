use std::sync::Arc;

use anyhow::Result;
use object_store::{ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory};
use url::Url;

/// Create an object store from a DSN string.
///
/// Supported schemes: `file:///path`, `memory://` and
/// `s3://[access_key:secret_key@]host[:port]/bucket`.
pub fn build_object_store(dsn: &str) -> Result<Arc<dyn ObjectStore>> {
    let url =
        Url::parse(dsn).map_err(|e| anyhow::anyhow!("Invalid storage DSN '{}': {}", dsn, e))?;

    match url.scheme() {
        "file" => {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(anyhow::anyhow!(
                    "File DSN must specify a path: file:///path/to/archives"
                ));
            }
            // Remove leading slash for relative paths like /.data/archives
            let path = if path.starts_with("/.") {
                &path[1..]
            } else {
                path
            };
            std::fs::create_dir_all(path)?;
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        "memory" => Ok(Arc::new(InMemory::new())),
        "s3" => {
            let builder = s3_builder_from_dsn(&url)?;
            Ok(Arc::new(builder.build()?))
        }
        scheme => Err(anyhow::anyhow!(
            "Unsupported storage scheme: {}. Supported: file, memory, s3",
            scheme
        )),
    }
}

/// Build an S3 client configuration from a DSN.
fn s3_builder_from_dsn(dsn: &Url) -> Result<AmazonS3Builder> {
    let host = dsn
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("Missing S3 host in DSN"))?;
    let port = dsn.port();
    let bucket = dsn.path().trim_start_matches('/');

    if bucket.is_empty() {
        return Err(anyhow::anyhow!(
            "S3 DSN must specify a bucket: s3://host/bucket"
        ));
    }

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_region("us-east-1");

    let access_key = dsn.username();
    if !access_key.is_empty() {
        builder = builder
            .with_access_key_id(access_key)
            .with_secret_access_key(dsn.password().unwrap_or(""));
    }

    // Anything that is not real S3 (MinIO, localstack) needs an explicit
    // endpoint and path-style requests.
    if !host.contains("amazonaws.com") {
        let scheme = if port == Some(443) { "https" } else { "http" };
        let endpoint = match port {
            Some(p) => format!("{scheme}://{host}:{p}"),
            None => format!("{scheme}://{host}"),
        };
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(true)
            .with_virtual_hosted_style_request(false);
    }

    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_object_store() {
        let object_store = build_object_store("memory://").unwrap();
        assert!(Arc::strong_count(&object_store) == 1);
    }

    #[test]
    fn test_filesystem_object_store() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("archives");
        let dsn = format!("file://{}", path.display());

        let object_store = build_object_store(&dsn).unwrap();
        assert!(Arc::strong_count(&object_store) == 1);
        // The prefix directory is created on demand
        assert!(path.is_dir());
    }

    #[test]
    fn test_invalid_dsn() {
        let result = build_object_store("not-a-url");
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Invalid storage DSN")
        );
    }

    #[test]
    fn test_unsupported_scheme() {
        let result = build_object_store("gcs://bucket/prefix");
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Unsupported storage scheme")
        );
    }

    #[test]
    fn test_file_dsn_without_path() {
        let result = build_object_store("file://");
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("must specify a path")
        );
    }

    #[test]
    fn test_s3_dsn_parsing() {
        let result = s3_builder_from_dsn(&Url::parse("s3://mybucket.s3.amazonaws.com/data").unwrap());
        assert!(result.is_ok());

        // S3-compatible DSN with inline credentials
        let result =
            s3_builder_from_dsn(&Url::parse("s3://access:secret@localhost:9000/bucket").unwrap());
        assert!(result.is_ok());

        let result = s3_builder_from_dsn(&Url::parse("s3://localhost:9000/").unwrap());
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("must specify a bucket")
        );
    }
}
