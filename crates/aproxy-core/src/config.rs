use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::chunk::DEFAULT_CHUNK_SIZE;

/// Worker lane retry parameters (optional section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first failed attempt before the task is handed back.
    pub max_retries: u32,
    /// Backoff unit in milliseconds; the delay before retry `n` is `n² × base`.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_secs: 30,
        }
    }
}

/// Upstream HTTP client settings (optional section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Sent as `Authorization: OAuth <token>` to the resolver.
    #[serde(default)]
    pub oauth_token: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub connect_timeout_secs: u64,
    /// Abort a transfer that delivers nothing for this long.
    pub read_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            oauth_token: None,
            user_agent: None,
            connect_timeout_secs: 10,
            read_timeout_secs: 10,
        }
    }
}

impl UpstreamConfig {
    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("aproxy/{}", env!("CARGO_PKG_VERSION")))
    }
}

/// Global configuration loaded from `~/.config/aproxy/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Loopback port to listen on (0 = pick a free port).
    pub port: u16,
    /// Cache base directory; defaults to `~/.cache/aproxy`.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Chunk size in bytes. Changing it invalidates existing incomplete caches.
    pub chunk_size: u64,
    /// Seconds the proxy waits for the first chunk of a response.
    pub initial_timeout_secs: u64,
    /// Seconds the proxy waits for each following chunk.
    pub transfer_timeout_secs: u64,
    /// Chunks prefetched for the "next" URL.
    pub preload_chunks: u32,
    /// Delay before prefetching the next URL while the current one still streams.
    pub next_preload_delay_secs: u64,
    /// Whether prefetching is allowed at all (e.g. only on unmetered networks).
    pub prefetch: bool,
    /// Treat redirects as invalid once their `Expires` time passed.
    pub honor_redirect_expiry: bool,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 0,
            cache_dir: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            initial_timeout_secs: 15,
            transfer_timeout_secs: 60,
            preload_chunks: 3,
            next_preload_delay_secs: 10,
            prefetch: true,
            honor_redirect_expiry: false,
            retry: None,
            upstream: None,
        }
    }
}

impl ProxyConfig {
    /// Cache base directory, falling back to the XDG cache home.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => {
                let xdg_dirs = xdg::BaseDirectories::with_prefix("aproxy")?;
                Ok(xdg_dirs.create_cache_directory("")?)
            }
        }
    }

    pub fn initial_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn next_preload_delay(&self) -> Duration {
        Duration::from_secs(self.next_preload_delay_secs)
    }

    pub fn retry_or_default(&self) -> RetryConfig {
        self.retry.clone().unwrap_or_default()
    }

    pub fn upstream_or_default(&self) -> UpstreamConfig {
        self.upstream.clone().unwrap_or_default()
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("aproxy")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<ProxyConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = ProxyConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: ProxyConfig = toml::from_str(&data)?;
    Ok(cfg)
}
