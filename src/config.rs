//! Configuration loading and types for the gateway.
//!
//! Configuration comes from one of two places, read once at startup:
//!
//! - a YAML file deserialized into [`Config`] ([`load_config`]), or
//! - `CDN_*` environment variables, optionally seeded from a `.env` file
//!   ([`load_from_env`]).
//!
//! Per-pair backend fields are all optional here; the registry decides which
//! `(bucket, region)` pairs are usable.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::errors::ConfigError;

/// Longest validity a SigV4 presigned URL may have.
pub const MAX_PRESIGN_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Time budgets and URL lifetimes.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Signed URL cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Public buckets and their regional backends.
    #[serde(default)]
    pub buckets: BucketsConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text, json, or auto (json unless stdout is a terminal).
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

/// Time budgets for every suspension point of a request.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Validity of issued presigned URLs, in seconds.
    #[serde(default = "default_presign_ttl")]
    pub presign_ttl_secs: u64,

    /// Subtracted from the presign TTL to get the advertised max-age.
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: u64,

    /// Timeout of a single existence probe.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Overall budget for racing all regions.
    #[serde(default = "default_resolve_deadline")]
    pub resolve_deadline_ms: u64,

    /// Timeout of a presign call.
    #[serde(default = "default_sign_timeout")]
    pub sign_timeout_ms: u64,

    /// Budget for a cache read on the request path.
    #[serde(default = "default_cache_lookup_timeout")]
    pub cache_lookup_timeout_ms: u64,

    /// Timeout for detached cache writes and deletes.
    #[serde(default = "default_cache_write_timeout")]
    pub cache_write_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            presign_ttl_secs: default_presign_ttl(),
            safety_margin_secs: default_safety_margin(),
            probe_timeout_ms: default_probe_timeout(),
            resolve_deadline_ms: default_resolve_deadline(),
            sign_timeout_ms: default_sign_timeout(),
            cache_lookup_timeout_ms: default_cache_lookup_timeout(),
            cache_write_timeout_ms: default_cache_write_timeout(),
        }
    }
}

impl GatewayConfig {
    /// Check that every budget is usable and that the advertised max-age
    /// stays strictly inside the presigned URL lifetime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.presign_ttl_secs == 0 || self.presign_ttl_secs > MAX_PRESIGN_TTL_SECS {
            return Err(ConfigError::InvalidTiming(format!(
                "presign_ttl_secs must be within 1..={MAX_PRESIGN_TTL_SECS}, got {}",
                self.presign_ttl_secs
            )));
        }
        if self.safety_margin_secs == 0 || self.safety_margin_secs >= self.presign_ttl_secs {
            return Err(ConfigError::InvalidTiming(format!(
                "safety_margin_secs must be within 1..{}, got {}",
                self.presign_ttl_secs, self.safety_margin_secs
            )));
        }
        let timeouts = [
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("resolve_deadline_ms", self.resolve_deadline_ms),
            ("sign_timeout_ms", self.sign_timeout_ms),
            ("cache_lookup_timeout_ms", self.cache_lookup_timeout_ms),
            ("cache_write_timeout_ms", self.cache_write_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::InvalidTiming(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }

    /// Max-age advertised to clients and used as the cache TTL.
    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs.saturating_sub(self.safety_margin_secs))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn resolve_deadline(&self) -> Duration {
        Duration::from_millis(self.resolve_deadline_ms)
    }

    pub fn sign_timeout(&self) -> Duration {
        Duration::from_millis(self.sign_timeout_ms)
    }

    pub fn cache_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_lookup_timeout_ms)
    }

    pub fn cache_write_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_write_timeout_ms)
    }
}

/// External URL cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Redis connection string.  Caching is disabled when absent.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Budget for connecting and the initial PING.
    #[serde(default = "default_cache_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            connect_timeout_ms: default_cache_connect_timeout(),
        }
    }
}

/// Public bucket aliases, region aliases, and per-pair backend settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BucketsConfig {
    /// Public bucket aliases served by the gateway.
    #[serde(default)]
    pub public_names: Option<Vec<String>>,

    /// Region aliases, in probe launch order.
    #[serde(default)]
    pub region_aliases: Option<Vec<String>>,

    /// `bucket alias -> region alias -> settings`.
    #[serde(default)]
    pub backends: HashMap<String, HashMap<String, BackendSettings>>,
}

/// Settings of one `(bucket alias, region alias)` backend.
///
/// Everything except `path_prefix` and `force_path_style` is required for
/// the pair to be usable.
#[derive(Clone, Deserialize)]
pub struct BackendSettings {
    /// S3-compatible endpoint URL.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Signing region.
    #[serde(default)]
    pub region: Option<String>,
    /// Real bucket name on the backend.
    #[serde(default, alias = "bucket_name")]
    pub bucket: Option<String>,
    /// Prefix prepended to every object key.
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// Access key id.
    #[serde(default, alias = "access_key")]
    pub access_key_id: Option<String>,
    /// Secret access key.
    #[serde(default, alias = "secret_key")]
    pub secret_access_key: Option<String>,
    /// Force path-style URL addressing.
    #[serde(default = "default_true")]
    pub force_path_style: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: None,
            bucket: None,
            path_prefix: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: default_true(),
        }
    }
}

impl std::fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSettings")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("path_prefix", &self.path_prefix)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "auto".to_string()
}

fn default_presign_ttl() -> u64 {
    MAX_PRESIGN_TTL_SECS
}

fn default_safety_margin() -> u64 {
    8 * 60 * 60
}

fn default_probe_timeout() -> u64 {
    4_000
}

fn default_resolve_deadline() -> u64 {
    5_000
}

fn default_sign_timeout() -> u64 {
    5_000
}

fn default_cache_lookup_timeout() -> u64 {
    500
}

fn default_cache_write_timeout() -> u64 {
    5_000
}

fn default_cache_connect_timeout() -> u64 {
    5_000
}

// -- Loaders -----------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.gateway.validate()?;
    Ok(config)
}

/// Load configuration from `CDN_*` environment variables.
///
/// A `.env` file in the working directory, if present, is applied first.
pub fn load_from_env() -> Result<Config, ConfigError> {
    let _ = dotenv::dotenv();
    let config = config_from_lookup(|name| std::env::var(name).ok())?;
    config.gateway.validate()?;
    Ok(config)
}

/// Build a [`Config`] from a variable lookup using the `CDN_*` naming scheme.
///
/// Per-pair variables are named `CDN_BUCKET_<FIELD>_<bucket>_<region>`.
/// Empty values count as missing.
pub fn config_from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

    let mut config = Config::default();

    let public_names = get("CDN_BUCKET_PUBLIC_NAMES").map(|v| split_list(&v));
    let region_aliases = get("CDN_BUCKET_REGION_ALIASES").map(|v| split_list(&v));

    if let (Some(buckets), Some(regions)) = (&public_names, &region_aliases) {
        for bucket in buckets {
            let mut per_region = HashMap::new();
            for region in regions {
                let field = |kind: &str| get(&format!("CDN_BUCKET_{kind}_{bucket}_{region}"));
                per_region.insert(
                    region.clone(),
                    BackendSettings {
                        endpoint: field("ENDPOINT"),
                        region: field("REGION"),
                        bucket: field("NAME"),
                        path_prefix: field("PATH_PREFIX"),
                        access_key_id: field("ACCESS_KEY_ID"),
                        secret_access_key: field("SECRET_ACCESS_KEY"),
                        force_path_style: true,
                    },
                );
            }
            config.buckets.backends.insert(bucket.clone(), per_region);
        }
    }
    config.buckets.public_names = public_names;
    config.buckets.region_aliases = region_aliases;

    config.cache.redis_url = get("CDN_URL_CACHE_REDIS");

    if let Some(addr) = get("CDN_LISTEN_ADDR") {
        let (host, port) = parse_listen_addr(&addr)?;
        config.server.host = host;
        config.server.port = port;
    }

    if let Some(level) = get("CDN_LOG_LEVEL") {
        config.logging.level = level;
    }
    if matches!(get("CDN_LOG_FORCE_JSON").as_deref(), Some("1") | Some("true")) {
        config.logging.format = "json".to_string();
    }

    Ok(config)
}

/// Split a comma-separated list, trimming entries and dropping empty ones.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `:8080` or `host:port`.
fn parse_listen_addr(addr: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidListenAddr(addr.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidListenAddr(addr.to_string()))?;
    let host = if host.is_empty() {
        default_host()
    } else {
        host.to_string()
    };
    Ok((host, port))
}
