use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Lower the default log level to `debug`.
    #[serde(default)]
    pub debug: bool,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub links: LinksConfig,
    #[serde(default)]
    pub background: BackgroundConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the origin LFS server, e.g.
    /// `https://github.com/acme/assets.git/info/lfs/`.  The inbound request
    /// path is appended to this URL's path.
    pub base_url: String,
    /// Overall timeout (seconds) for one batch call against the origin.
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

fn default_upstream_timeout() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// In-memory descriptor cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// TTL (seconds) applied to every cached object descriptor.
    #[serde(default = "default_cache_eviction")]
    pub eviction_secs: u64,
    /// Upper bound on the number of cached descriptors.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            eviction_secs: default_cache_eviction(),
            max_entries: default_cache_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn eviction(&self) -> Duration {
        Duration::from_secs(self.eviction_secs)
    }
}

fn default_cache_eviction() -> u64 {
    23 * 3600
}

fn default_cache_max_entries() -> u64 {
    1_000_000
}

// ---------------------------------------------------------------------------
// Object downloads and link probes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LinksConfig {
    /// TCP/TLS connect timeout (seconds) for every outbound HTTP request.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Longest wait (seconds) for any single read, including the response
    /// head.  Streams that keep delivering data are not cut off.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

impl Default for LinksConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl LinksConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Storage (S3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub s3: S3StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    pub bucket: String,
    /// Region override.  When unset the AWS provider chain decides.
    #[serde(default)]
    pub region: Option<String>,
    /// Use the S3 Transfer Acceleration endpoint.
    #[serde(default)]
    pub use_accelerate: bool,
    /// Hand out pre-signed URLs.  When disabled, clients receive plain
    /// virtual-host URLs and the bucket must be readable by them.
    #[serde(default = "bool_true")]
    pub presign_enabled: bool,
    /// TTL (seconds) for pre-signed download and probe URLs.
    #[serde(default = "default_presign_expiry")]
    pub presign_expiry_secs: u64,
    /// Size (bytes) of each multipart upload part.
    #[serde(default = "default_multipart_part_size")]
    pub multipart_part_size: usize,
}

impl S3StorageConfig {
    pub fn presign_expiry(&self) -> Duration {
        Duration::from_secs(self.presign_expiry_secs)
    }
}

fn bool_true() -> bool {
    true
}

fn default_presign_expiry() -> u64 {
    24 * 3600
}

fn default_multipart_part_size() -> usize {
    8 * 1024 * 1024
}

/// S3 rejects non-final multipart parts smaller than this.
const MIN_MULTIPART_PART_SIZE: usize = 5 * 1024 * 1024;

/// SigV4 pre-signed URLs cannot outlive seven days.
const MAX_PRESIGN_EXPIRY_SECS: u64 = 7 * 24 * 3600;

// ---------------------------------------------------------------------------
// Background work
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BackgroundConfig {
    /// Maximum number of backfill uploads and link probes in flight at once.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// How long (seconds) shutdown waits for background work before
    /// cancelling it.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

fn default_max_in_flight() -> usize {
    256
}

fn default_drain_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Expose `GET /metrics`.
    #[serde(default)]
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("invalid YAML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    let base = reqwest::Url::parse(&config.upstream.base_url)
        .with_context(|| format!("invalid upstream.base_url: {}", config.upstream.base_url))?;
    anyhow::ensure!(
        matches!(base.scheme(), "http" | "https"),
        "upstream.base_url must use http or https"
    );
    anyhow::ensure!(
        !config.storage.s3.bucket.trim().is_empty(),
        "storage.s3.bucket must not be empty"
    );
    anyhow::ensure!(config.cache.eviction_secs > 0, "cache.eviction_secs must be > 0");
    if config.storage.s3.presign_enabled {
        anyhow::ensure!(
            (1..=MAX_PRESIGN_EXPIRY_SECS).contains(&config.storage.s3.presign_expiry_secs),
            "storage.s3.presign_expiry_secs must be between 1 and {MAX_PRESIGN_EXPIRY_SECS}"
        );
    }
    anyhow::ensure!(
        config.storage.s3.multipart_part_size >= MIN_MULTIPART_PART_SIZE,
        "storage.s3.multipart_part_size must be at least {MIN_MULTIPART_PART_SIZE} bytes"
    );
    anyhow::ensure!(
        config.links.connect_timeout_secs > 0 && config.links.read_timeout_secs > 0,
        "links timeouts must be > 0"
    );
    anyhow::ensure!(
        config.background.max_in_flight > 0,
        "background.max_in_flight must be > 0"
    );
    Ok(())
}
