//! Serve command: run the proxy until Ctrl-C.

use anyhow::{Context, Result};
use aproxy_core::config::ProxyConfig;
use aproxy_core::context::StreamingContext;
use aproxy_core::proxy::ProxyServer;
use std::path::PathBuf;

/// Command-line overrides for the loaded config.
#[derive(Debug, Default)]
pub struct ServeOptions {
    pub port: Option<u16>,
    pub cache_dir: Option<PathBuf>,
    pub no_prefetch: bool,
}

impl ServeOptions {
    fn apply(self, mut cfg: ProxyConfig) -> ProxyConfig {
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if self.cache_dir.is_some() {
            cfg.cache_dir = self.cache_dir;
        }
        if self.no_prefetch {
            cfg.prefetch = false;
        }
        cfg
    }
}

pub async fn run_serve(cfg: ProxyConfig, opts: ServeOptions) -> Result<()> {
    let cfg = opts.apply(cfg);
    let ctx = StreamingContext::with_curl(cfg)?;
    let proxy = ProxyServer::bind(&ctx).await?.start();
    println!("aproxy listening on http://127.0.0.1:{}/", proxy.port());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("interrupted, shutting down");
    proxy.stop().await;
    ctx.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_config() {
        let opts = ServeOptions {
            port: Some(8123),
            cache_dir: Some(PathBuf::from("/tmp/aproxy-cache")),
            no_prefetch: true,
        };
        let cfg = opts.apply(ProxyConfig::default());
        assert_eq!(cfg.port, 8123);
        assert_eq!(cfg.cache_dir, Some(PathBuf::from("/tmp/aproxy-cache")));
        assert!(!cfg.prefetch);
    }

    #[test]
    fn no_overrides_keep_config() {
        let cfg = ServeOptions::default().apply(ProxyConfig::default());
        assert_eq!(cfg.port, 0);
        assert!(cfg.cache_dir.is_none());
        assert!(cfg.prefetch);
    }
}
