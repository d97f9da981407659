//! Backend registry: public bucket alias x region alias -> backend.
//!
//! Built once at startup from [`BucketsConfig`] and never mutated, so it is
//! shared across requests behind an `Arc` without any locking.
//!
//! Partial configuration is expected.  A pair missing a required field is
//! skipped with a warning, and a bucket may end up with no usable region at
//! all; that only matters once a request targets it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{BackendSettings, BucketsConfig};
use crate::errors::ConfigError;
use crate::storage::backend::ObjectStore;
use crate::storage::s3::S3Backend;

/// Static access key pair of one backend.
#[derive(Clone)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Fully specified location of one regional replica.
#[derive(Debug, Clone)]
pub struct BackendTarget {
    /// S3-compatible endpoint URL.
    pub endpoint: String,
    /// Signing region.
    pub region: String,
    /// Real bucket name on the backend.
    pub bucket_name: String,
    /// Prefix prepended to every object key (may be empty).
    pub path_prefix: String,
    /// Static credentials.
    pub credentials: StaticCredentials,
    /// Force path-style URL addressing.
    pub force_path_style: bool,
}

impl BackendTarget {
    /// Validate `settings`, returning the names of missing required fields
    /// on failure.
    fn from_settings(settings: &BackendSettings) -> Result<Self, Vec<&'static str>> {
        let required = |value: &Option<String>| {
            value
                .as_deref()
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        match (
            required(&settings.endpoint),
            required(&settings.region),
            required(&settings.bucket),
            required(&settings.access_key_id),
            required(&settings.secret_access_key),
        ) {
            (
                Some(endpoint),
                Some(region),
                Some(bucket_name),
                Some(access_key_id),
                Some(secret_access_key),
            ) => Ok(Self {
                endpoint,
                region,
                bucket_name,
                path_prefix: settings.path_prefix.clone().unwrap_or_default(),
                credentials: StaticCredentials {
                    access_key_id,
                    secret_access_key,
                },
                force_path_style: settings.force_path_style,
            }),
            (endpoint, region, bucket, access_key_id, secret_access_key) => {
                let present = [
                    ("endpoint", endpoint.is_some()),
                    ("region", region.is_some()),
                    ("bucket", bucket.is_some()),
                    ("access_key_id", access_key_id.is_some()),
                    ("secret_access_key", secret_access_key.is_some()),
                ];
                Err(present
                    .iter()
                    .filter(|(_, ok)| !ok)
                    .map(|(name, _)| *name)
                    .collect())
            }
        }
    }
}

/// One `(public bucket alias, region alias)` backend with its capability.
///
/// Identity is the alias pair.  Immutable after construction.
pub struct BackendDescriptor {
    pub bucket_alias: String,
    pub region_alias: String,
    pub target: BackendTarget,
    store: Arc<dyn ObjectStore>,
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("bucket_alias", &self.bucket_alias)
            .field("region_alias", &self.region_alias)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl BackendDescriptor {
    pub fn new(
        bucket_alias: impl Into<String>,
        region_alias: impl Into<String>,
        target: BackendTarget,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            bucket_alias: bucket_alias.into(),
            region_alias: region_alias.into(),
            target,
            store,
        }
    }

    /// Existence-check and signing capability of this backend.
    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    /// Apply this backend's path prefix to a requested object path.
    ///
    /// Without a prefix the object path is used unchanged.  With one, the
    /// prefix and the object path each lose one leading `/` and are joined
    /// with `/`.
    pub fn resolve_path(&self, object_path: &str) -> String {
        apply_prefix(&self.target.path_prefix, object_path)
    }
}

/// Join `prefix` and `object_path` the way every backend key is formed.
pub fn apply_prefix(prefix: &str, object_path: &str) -> String {
    if prefix.is_empty() {
        return object_path.to_string();
    }
    let prefix = prefix.strip_prefix('/').unwrap_or(prefix);
    let object_path = object_path.strip_prefix('/').unwrap_or(object_path);
    format!("{prefix}/{object_path}")
}

/// Builds the storage capability for a validated backend target.
pub type StoreConnector<'a> =
    dyn Fn(&str, &str, &BackendTarget) -> anyhow::Result<Arc<dyn ObjectStore>> + 'a;

/// Immutable map of every usable backend.
#[derive(Debug)]
pub struct BackendRegistry {
    bucket_aliases: Vec<String>,
    region_aliases: Vec<String>,
    backends: HashMap<String, HashMap<String, Arc<BackendDescriptor>>>,
}

impl BackendRegistry {
    /// Build the registry with [`S3Backend`] clients.
    pub fn build(config: &BucketsConfig) -> Result<Self, ConfigError> {
        Self::build_with(
            config,
            &|_: &str, _: &str, target: &BackendTarget| -> anyhow::Result<Arc<dyn ObjectStore>> {
                Ok(Arc::new(S3Backend::new(target)?))
            },
        )
    }

    /// Build the registry, creating each backend's capability with `connect`.
    ///
    /// Fails only when the global alias lists are missing or a client cannot
    /// be constructed for an otherwise complete pair.
    pub fn build_with(
        config: &BucketsConfig,
        connect: &StoreConnector<'_>,
    ) -> Result<Self, ConfigError> {
        let bucket_aliases = config
            .public_names
            .clone()
            .filter(|names| !names.is_empty())
            .ok_or(ConfigError::MissingBucketAliases)?;
        let region_aliases = config
            .region_aliases
            .clone()
            .filter(|names| !names.is_empty())
            .ok_or(ConfigError::MissingRegionAliases)?;

        let mut backends: HashMap<String, HashMap<String, Arc<BackendDescriptor>>> =
            HashMap::new();

        for bucket in &bucket_aliases {
            // The first ':' of a cache key must always end the bucket alias.
            if bucket.is_empty() || bucket.contains(':') || bucket.contains('/') {
                warn!(
                    "Skipping bucket alias '{}': must be non-empty and contain no ':' or '/'",
                    bucket
                );
                continue;
            }

            let per_bucket = backends.entry(bucket.clone()).or_default();
            let configured = config.backends.get(bucket);

            for region in &region_aliases {
                let Some(settings) = configured.and_then(|m| m.get(region)) else {
                    warn!("Skipping bucket {} region {}: not configured", bucket, region);
                    continue;
                };

                let target = match BackendTarget::from_settings(settings) {
                    Ok(target) => target,
                    Err(missing) => {
                        warn!(
                            "Skipping bucket {} region {} due to missing configuration: {}",
                            bucket,
                            region,
                            missing.join(", ")
                        );
                        continue;
                    }
                };

                let store =
                    connect(bucket, region, &target).map_err(|source| ConfigError::Backend {
                        bucket: bucket.clone(),
                        region: region.clone(),
                        source,
                    })?;

                info!(
                    "Configured bucket: {}, region: {}, actual bucket name: {}",
                    bucket, region, target.bucket_name
                );
                per_bucket.insert(
                    region.clone(),
                    Arc::new(BackendDescriptor::new(bucket, region, target, store)),
                );
            }

            if per_bucket.is_empty() {
                warn!("Bucket {} has no usable region", bucket);
            }
        }

        Ok(Self {
            bucket_aliases,
            region_aliases,
            backends,
        })
    }

    /// Configured public bucket aliases, as given.
    pub fn bucket_aliases(&self) -> &[String] {
        &self.bucket_aliases
    }

    /// Configured region aliases, in probe launch order.
    pub fn region_aliases(&self) -> &[String] {
        &self.region_aliases
    }

    /// Whether `bucket` is a served alias (possibly with zero regions).
    pub fn contains_bucket(&self, bucket: &str) -> bool {
        self.backends.contains_key(bucket)
    }

    /// Look up a single backend.
    pub fn get(&self, bucket: &str, region: &str) -> Option<Arc<BackendDescriptor>> {
        self.backends.get(bucket)?.get(region).cloned()
    }

    /// Usable backends of `bucket`, ordered by the region alias list.
    pub fn backends_for(&self, bucket: &str) -> Vec<Arc<BackendDescriptor>> {
        let Some(per_bucket) = self.backends.get(bucket) else {
            return Vec::new();
        };
        self.region_aliases
            .iter()
            .filter_map(|region| per_bucket.get(region).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    fn settings(prefix: Option<&str>) -> BackendSettings {
        BackendSettings {
            endpoint: Some("https://s3.example.com".to_string()),
            region: Some("eu-central-1".to_string()),
            bucket: Some("real-bucket".to_string()),
            path_prefix: prefix.map(str::to_string),
            access_key_id: Some("AKIA".to_string()),
            secret_access_key: Some("secret".to_string()),
            force_path_style: true,
        }
    }

    fn buckets_config(
        buckets: &[&str],
        regions: &[&str],
        pairs: &[(&str, &str, BackendSettings)],
    ) -> BucketsConfig {
        let mut backends: HashMap<String, HashMap<String, BackendSettings>> = HashMap::new();
        for (bucket, region, s) in pairs {
            backends
                .entry(bucket.to_string())
                .or_default()
                .insert(region.to_string(), s.clone());
        }
        BucketsConfig {
            public_names: Some(buckets.iter().map(|s| s.to_string()).collect()),
            region_aliases: Some(regions.iter().map(|s| s.to_string()).collect()),
            backends,
        }
    }

    fn memory_connector(
        _bucket: &str,
        region: &str,
        _target: &BackendTarget,
    ) -> anyhow::Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(MemoryStore::new(region)))
    }

    #[test]
    fn test_apply_prefix() {
        assert_eq!(apply_prefix("", "u1/a.jpg"), "u1/a.jpg");
        assert_eq!(apply_prefix("", "/u1/a.jpg"), "/u1/a.jpg");
        assert_eq!(apply_prefix("public", "u1/a.jpg"), "public/u1/a.jpg");
        assert_eq!(apply_prefix("/public", "/u1/a.jpg"), "public/u1/a.jpg");
        assert_eq!(apply_prefix("cdn/v2", "x"), "cdn/v2/x");
    }

    #[test]
    fn test_missing_global_lists_is_fatal() {
        let mut config = buckets_config(&["avatars"], &["eu"], &[]);
        config.public_names = None;
        assert!(matches!(
            BackendRegistry::build_with(&config, &memory_connector),
            Err(ConfigError::MissingBucketAliases)
        ));

        let mut config = buckets_config(&["avatars"], &["eu"], &[]);
        config.region_aliases = Some(Vec::new());
        assert!(matches!(
            BackendRegistry::build_with(&config, &memory_connector),
            Err(ConfigError::MissingRegionAliases)
        ));
    }

    #[test]
    fn test_incomplete_pairs_are_skipped() {
        let mut incomplete = settings(None);
        incomplete.secret_access_key = None;
        let mut empty_endpoint = settings(None);
        empty_endpoint.endpoint = Some(String::new());

        let config = buckets_config(
            &["avatars", "media"],
            &["eu", "us", "ap"],
            &[
                ("avatars", "eu", settings(Some("/public"))),
                ("avatars", "us", incomplete),
                ("media", "ap", empty_endpoint),
            ],
        );
        let registry = BackendRegistry::build_with(&config, &memory_connector).unwrap();

        assert!(registry.get("avatars", "eu").is_some());
        assert!(registry.get("avatars", "us").is_none());
        assert!(registry.get("avatars", "ap").is_none());
        // A bucket with no usable region is still served (and resolves nothing).
        assert!(registry.contains_bucket("media"));
        assert!(registry.backends_for("media").is_empty());
        assert!(!registry.contains_bucket("unknown"));

        let eu = registry.get("avatars", "eu").unwrap();
        assert_eq!(eu.target.bucket_name, "real-bucket");
        assert_eq!(eu.resolve_path("/u1/a.jpg"), "public/u1/a.jpg");
    }

    #[test]
    fn test_backends_follow_region_order() {
        let config = buckets_config(
            &["avatars"],
            &["us", "eu", "ap"],
            &[
                ("avatars", "eu", settings(None)),
                ("avatars", "ap", settings(None)),
                ("avatars", "us", settings(None)),
            ],
        );
        let registry = BackendRegistry::build_with(&config, &memory_connector).unwrap();
        let order: Vec<_> = registry
            .backends_for("avatars")
            .iter()
            .map(|d| d.region_alias.clone())
            .collect();
        assert_eq!(order, vec!["us", "eu", "ap"]);
        assert_eq!(registry.region_aliases(), ["us", "eu", "ap"]);
    }

    #[test]
    fn test_bucket_alias_with_separator_is_rejected() {
        let config = buckets_config(
            &["bad:alias", "ok"],
            &["eu"],
            &[
                ("bad:alias", "eu", settings(None)),
                ("ok", "eu", settings(None)),
            ],
        );
        let registry = BackendRegistry::build_with(&config, &memory_connector).unwrap();
        assert!(!registry.contains_bucket("bad:alias"));
        assert!(registry.contains_bucket("ok"));
        assert_eq!(registry.bucket_aliases().len(), 2);
    }

    #[test]
    fn test_connector_failure_is_fatal() {
        let config = buckets_config(&["avatars"], &["eu"], &[("avatars", "eu", settings(None))]);
        let failing = |_: &str,
                       _: &str,
                       _: &BackendTarget|
         -> anyhow::Result<Arc<dyn ObjectStore>> { anyhow::bail!("no client") };
        assert!(matches!(
            BackendRegistry::build_with(&config, &failing),
            Err(ConfigError::Backend { .. })
        ));
    }

    #[tokio::test]
    async fn test_build_with_s3_clients() {
        let config = buckets_config(&["avatars"], &["eu"], &[("avatars", "eu", settings(None))]);
        let registry = BackendRegistry::build(&config).unwrap();
        assert_eq!(registry.backends_for("avatars").len(), 1);
    }

    #[test]
    fn test_descriptor_debug_redacts_secret() {
        let config = buckets_config(&["avatars"], &["eu"], &[("avatars", "eu", settings(None))]);
        let registry = BackendRegistry::build_with(&config, &memory_connector).unwrap();
        let rendered = format!("{:?}", registry.get("avatars", "eu").unwrap());
        assert!(rendered.contains("AKIA"));
        assert!(!rendered.contains("\"secret\""));
    }
}
