//! S3-compatible storage backend.
//!
//! One [`S3Backend`] exists per configured `(bucket alias, region alias)`
//! pair.  It targets a single upstream bucket on an explicit endpoint with
//! static credentials, so no ambient AWS credential chain is consulted.
//!
//! Keys are used verbatim: path prefixes are applied by the registry
//! descriptor before any call reaches this type.

use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{ObjectStore, StoreFuture};
use crate::registry::BackendTarget;

/// Backend that forwards existence checks, presigning and writes to an
/// S3-compatible service.
pub struct S3Backend {
    /// S3 SDK client bound to the target endpoint and region.
    client: Client,
    /// The real bucket name on the backend.
    bucket: String,
}

impl S3Backend {
    /// Create a client for `target`.
    ///
    /// Construction is purely local; no request is sent until the first
    /// probe.
    pub fn new(target: &BackendTarget) -> anyhow::Result<Self> {
        if target.endpoint.is_empty() {
            anyhow::bail!("endpoint must not be empty");
        }

        let credentials = Credentials::new(
            &target.credentials.access_key_id,
            &target.credentials.secret_access_key,
            None, // session_token
            None, // expiry
            "cdn-s3-config",
        );

        let s3_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(target.region.clone()))
            .endpoint_url(&target.endpoint)
            .credentials_provider(credentials)
            .force_path_style(target.force_path_style)
            .build();

        info!(
            "S3 backend initialized: endpoint={} region={} bucket={}",
            target.endpoint, target.region, target.bucket_name
        );

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: target.bucket_name.clone(),
        })
    }

    /// Map an AWS SDK error to an anyhow error with context.
    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> anyhow::Error {
        anyhow::anyhow!("S3 {context}: {err}")
    }
}

impl ObjectStore for S3Backend {
    fn exists(&self, key: &str) -> StoreFuture<'_, bool> {
        let key = key.to_string();
        Box::pin(async move {
            debug!("S3 head_object: bucket={} key={}", self.bucket, key);

            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) => {
                    let service_err = e.into_service_error();
                    if service_err.is_not_found() {
                        Ok(false)
                    } else {
                        Err(Self::map_sdk_error("head_object", service_err))
                    }
                }
            }
        })
    }

    fn presign_get(&self, key: &str, expires_in: Duration) -> StoreFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            let presigning = PresigningConfig::expires_in(expires_in)
                .map_err(|e| Self::map_sdk_error("presigning config", e))?;

            let request = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .presigned(presigning)
                .await
                .map_err(|e| Self::map_sdk_error("presign get_object", e))?;

            Ok(request.uri().to_string())
        })
    }

    fn put(&self, key: &str, data: Bytes, content_type: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        let content_type = content_type.to_string();
        Box::pin(async move {
            debug!(
                "S3 put_object: bucket={} key={} size={}",
                self.bucket,
                key,
                data.len()
            );

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .content_type(content_type)
                .body(aws_sdk_s3::primitives::ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("put_object", e))?;

            Ok(())
        })
    }
}
