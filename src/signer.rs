//! Presigned GET URL issuance for a resolved backend.

use std::time::Duration;

use metrics::counter;
use tracing::{debug, warn};

use crate::errors::SigningError;
use crate::metrics::SIGNING_FAILURES_TOTAL;
use crate::registry::BackendDescriptor;

/// Signs GET URLs against the backend a resolution picked.
#[derive(Debug, Clone)]
pub struct Signer {
    timeout: Duration,
}

impl Signer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Produce a URL granting GET on `resolved_path` of `descriptor`'s real
    /// bucket, valid for `ttl`.
    ///
    /// `resolved_path` already carries the backend prefix and is used as-is.
    pub async fn sign(
        &self,
        descriptor: &BackendDescriptor,
        resolved_path: &str,
        ttl: Duration,
    ) -> Result<String, SigningError> {
        let result = tokio::time::timeout(
            self.timeout,
            descriptor.store().presign_get(resolved_path, ttl),
        )
        .await;

        let err = match result {
            Ok(Ok(url)) => {
                debug!(
                    "Presigned {} in region {} for {:?}",
                    resolved_path, descriptor.region_alias, ttl
                );
                return Ok(url);
            }
            Ok(Err(source)) => SigningError::Backend {
                bucket: descriptor.bucket_alias.clone(),
                key: resolved_path.to_string(),
                source,
            },
            Err(_) => SigningError::TimedOut {
                bucket: descriptor.bucket_alias.clone(),
                key: resolved_path.to_string(),
                elapsed: self.timeout,
            },
        };

        warn!("Region {}: {}", descriptor.region_alias, err);
        counter!(SIGNING_FAILURES_TOTAL, "region" => descriptor.region_alias.clone()).increment(1);
        Err(err)
    }
}
