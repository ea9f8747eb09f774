use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted when `[geocoder] api_key` is not set.
pub const GEOCODER_KEY_ENV: &str = "SHOPFINDER_GEOCODER_KEY";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    #[serde(default)]
    pub sqlite: Option<SqliteConfig>,
    #[serde(default)]
    pub postgis: Option<PostgisConfig>,
    #[serde(default)]
    pub tantivy: Option<TantivyConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub enrich: EnrichConfig,
    #[serde(default)]
    pub geocoder: GeocoderConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Postgis,
    Tantivy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SqliteConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PostgisConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct TantivyConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_ttl_secs() -> u64 {
    600
}
fn default_session_ttl_secs() -> u64 {
    120
}
fn default_sweep_interval_secs() -> u64 {
    1200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_geocode_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout_secs: default_geocode_timeout_secs(),
        }
    }
}

fn default_workers() -> usize {
    5
}
fn default_geocode_timeout_secs() -> u64 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeocoderConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            base_url: None,
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl GeocoderConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Configured key, falling back to [`GEOCODER_KEY_ENV`].
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(GEOCODER_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_http_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // The selected backend must have its section
    match config.backend.kind {
        BackendKind::Sqlite if config.sqlite.is_none() => {
            anyhow::bail!("backend.kind is 'sqlite' but [sqlite] is missing")
        }
        BackendKind::Postgis if config.postgis.is_none() => {
            anyhow::bail!("backend.kind is 'postgis' but [postgis] is missing")
        }
        BackendKind::Tantivy if config.tantivy.is_none() => {
            anyhow::bail!("backend.kind is 'tantivy' but [tantivy] is missing")
        }
        _ => {}
    }

    if config.cache.ttl_secs == 0 {
        anyhow::bail!("cache.ttl_secs must be > 0");
    }
    if config.cache.session_ttl_secs == 0 {
        anyhow::bail!("cache.session_ttl_secs must be > 0");
    }
    if config.cache.sweep_interval_secs == 0 {
        anyhow::bail!("cache.sweep_interval_secs must be > 0");
    }

    if config.enrich.workers == 0 {
        anyhow::bail!("enrich.workers must be >= 1");
    }
    if config.enrich.timeout_secs == 0 {
        anyhow::bail!("enrich.timeout_secs must be > 0");
    }

    match config.geocoder.provider.as_str() {
        "disabled" | "google" | "bing" => {}
        other => anyhow::bail!(
            "Unknown geocoder provider: '{}'. Must be disabled, google, or bing.",
            other
        ),
    }

    Ok(())
}
