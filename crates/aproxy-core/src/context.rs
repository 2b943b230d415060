//! Long-lived objects built once at startup and handed to the proxy.

use crate::config::ProxyConfig;
use crate::loader::Loader;
use crate::storage::Store;
use crate::upstream::{CurlUpstream, Upstream};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Store, loader and configuration shared by every proxy connection.
pub struct StreamingContext {
    config: ProxyConfig,
    store: Store,
    loader: Loader,
}

impl StreamingContext {
    /// Open the cache under `config.cache_dir()` and start the loader on the
    /// current tokio runtime.
    pub fn new(config: ProxyConfig, upstream: Arc<dyn Upstream>) -> Result<StreamingContext> {
        if config.chunk_size == 0 {
            anyhow::bail!("chunk_size must be positive");
        }
        let base = config.cache_dir()?;
        let store = Store::open(&base, config.chunk_size)
            .with_context(|| format!("open cache at {}", base.display()))?;
        let loader = Loader::start(store.clone(), upstream, &config).context("start loader thread")?;
        tracing::info!(cache = %base.display(), "streaming context ready");
        Ok(StreamingContext {
            config,
            store,
            loader,
        })
    }

    /// Context talking to the network through curl.
    pub fn with_curl(config: ProxyConfig) -> Result<StreamingContext> {
        let upstream = CurlUpstream::new(&config.upstream_or_default());
        Self::new(config, Arc::new(upstream))
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    /// True while a worker lane is talking to upstream.
    pub fn network_busy(&self) -> bool {
        self.loader.network_busy()
    }

    pub async fn shutdown(&self) {
        self.loader.shutdown().await;
    }
}
