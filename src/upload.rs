//! One-shot upload of a local file to a single `(bucket, region)` backend.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tracing::info;

use crate::registry::BackendRegistry;

/// Budget for the whole `put`.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// What was written where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub local_path: PathBuf,
    pub bucket_name: String,
    pub key: String,
    pub content_type: String,
    pub size: usize,
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// Content type by file extension, `application/octet-stream` when unknown.
pub fn content_type_for(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let known = match ext.as_str() {
        "jpg" | "jpeg" => mime::IMAGE_JPEG,
        "png" => mime::IMAGE_PNG,
        "gif" => mime::IMAGE_GIF,
        "bmp" => mime::IMAGE_BMP,
        "svg" => mime::IMAGE_SVG,
        "html" | "htm" => mime::TEXT_HTML,
        "css" => mime::TEXT_CSS,
        "csv" => mime::TEXT_CSV,
        "txt" => mime::TEXT_PLAIN,
        "xml" => mime::TEXT_XML,
        "js" | "mjs" => mime::TEXT_JAVASCRIPT,
        "json" => mime::APPLICATION_JSON,
        "pdf" => mime::APPLICATION_PDF,
        "woff" => mime::FONT_WOFF,
        "woff2" => mime::FONT_WOFF2,
        "webp" => return "image/webp".to_string(),
        "avif" => return "image/avif".to_string(),
        "ico" => return "image/x-icon".to_string(),
        "mp4" => return "video/mp4".to_string(),
        "webm" => return "video/webm".to_string(),
        "mp3" => return "audio/mpeg".to_string(),
        _ => mime::APPLICATION_OCTET_STREAM,
    };
    known.to_string()
}

/// Upload `local_path` to `remote_path` of the `bucket`/`region` backend.
///
/// The remote path loses one leading `/` and then gets the backend's path
/// prefix, so the object lands where the gateway will look for it.
pub async fn upload_file(
    registry: &BackendRegistry,
    bucket: &str,
    region: &str,
    local_path: &str,
    remote_path: &str,
) -> anyhow::Result<UploadReport> {
    let descriptor = registry.get(bucket, region).with_context(|| {
        format!("bucket '{bucket}' has no usable configuration for region '{region}'")
    })?;

    let local_path = expand_home(local_path);
    let data = tokio::fs::read(&local_path)
        .await
        .with_context(|| format!("failed to read {}", local_path.display()))?;

    let remote_path = remote_path.strip_prefix('/').unwrap_or(remote_path);
    let key = descriptor.resolve_path(remote_path);
    let content_type = content_type_for(&local_path);
    let size = data.len();

    tokio::time::timeout(
        UPLOAD_TIMEOUT,
        descriptor
            .store()
            .put(&key, Bytes::from(data), &content_type),
    )
    .await
    .map_err(|_| anyhow::anyhow!("upload timed out after {:?}", UPLOAD_TIMEOUT))?
    .context("failed to upload file")?;

    info!(
        "Uploaded {} to s3://{}/{} (Content-Type: {})",
        local_path.display(),
        descriptor.target.bucket_name,
        key,
        content_type
    );

    Ok(UploadReport {
        local_path,
        bucket_name: descriptor.target.bucket_name.clone(),
        key,
        content_type,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendSettings, BucketsConfig};
    use crate::registry::BackendTarget;
    use crate::storage::backend::ObjectStore;
    use crate::storage::memory::MemoryStore;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Arc;

    fn registry(prefix: Option<&str>, store: Arc<MemoryStore>) -> BackendRegistry {
        let config = BucketsConfig {
            public_names: Some(vec!["avatars".to_string()]),
            region_aliases: Some(vec!["us".to_string(), "eu".to_string()]),
            backends: HashMap::from([(
                "avatars".to_string(),
                HashMap::from([(
                    "us".to_string(),
                    BackendSettings {
                        endpoint: Some("memory://".to_string()),
                        region: Some("us-east-1".to_string()),
                        bucket: Some("real-avatars".to_string()),
                        path_prefix: prefix.map(str::to_string),
                        access_key_id: Some("ak".to_string()),
                        secret_access_key: Some("sk".to_string()),
                        force_path_style: true,
                    },
                )]),
            )]),
        };
        let connect = move |_: &str,
                            _: &str,
                            _: &BackendTarget|
              -> anyhow::Result<Arc<dyn ObjectStore>> {
            let store: Arc<dyn ObjectStore> = store.clone();
            Ok(store)
        };
        BackendRegistry::build_with(&config, &connect).unwrap()
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("a.jpg")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("a.JPEG")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("x/y.png")), "image/png");
        assert_eq!(content_type_for(Path::new("a.webp")), "image/webp");
        assert_eq!(content_type_for(Path::new("a.bin")), "application/octet-stream");
        assert_eq!(content_type_for(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/tmp/a.jpg"), PathBuf::from("/tmp/a.jpg"));
        assert_eq!(expand_home("rel/a.jpg"), PathBuf::from("rel/a.jpg"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_home("~/a.jpg"), Path::new(&home).join("a.jpg"));
        }
    }

    #[tokio::test]
    async fn test_upload_applies_prefix_and_content_type() {
        let mut file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
        file.write_all(b"\x89PNG").unwrap();

        let store = Arc::new(MemoryStore::new("us"));
        let registry = registry(Some("/public"), store.clone());
        let report = upload_file(
            &registry,
            "avatars",
            "us",
            file.path().to_str().unwrap(),
            "/user1/a.png",
        )
        .await
        .unwrap();

        assert_eq!(report.key, "public/user1/a.png");
        assert_eq!(report.bucket_name, "real-avatars");
        assert_eq!(report.content_type, "image/png");
        assert_eq!(report.size, 4);

        let stored = store.get("public/user1/a.png").await.unwrap();
        assert_eq!(stored.content_type, "image/png");
        assert_eq!(stored.data.as_ref(), b"\x89PNG");
    }

    #[tokio::test]
    async fn test_upload_without_prefix_strips_leading_slash() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = Arc::new(MemoryStore::new("us"));
        let registry = registry(None, store.clone());

        let report = upload_file(&registry, "avatars", "us", file.path().to_str().unwrap(), "/a")
            .await
            .unwrap();
        assert_eq!(report.key, "a");
        assert_eq!(report.content_type, "application/octet-stream");
        assert!(store.get("a").await.is_some());
    }

    #[tokio::test]
    async fn test_upload_requires_configured_pair() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = Arc::new(MemoryStore::new("us"));
        let registry = registry(None, store);
        let path = file.path().to_str().unwrap();

        assert!(upload_file(&registry, "avatars", "eu", path, "a").await.is_err());
        assert!(upload_file(&registry, "other", "us", path, "a").await.is_err());
    }

    #[tokio::test]
    async fn test_upload_missing_file() {
        let store = Arc::new(MemoryStore::new("us"));
        let registry = registry(None, store);
        let err = upload_file(&registry, "avatars", "us", "/nonexistent/x.jpg", "a")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
