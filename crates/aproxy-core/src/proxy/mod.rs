//! Loopback HTTP proxy: players connect here with the upstream URL as a
//! query parameter and receive audio bytes served from the chunk cache.

mod handler;
pub mod request;
pub mod response;

use crate::context::StreamingContext;
use crate::loader::Loader;
use anyhow::{bail, Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use url::Url;

pub(crate) struct ProxyShared {
    loader: Loader,
    initial_timeout: Duration,
    transfer_timeout: Duration,
    next_preload_delay: Duration,
    running: AtomicBool,
    stop: Notify,
}

impl ProxyShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// A bound but not yet accepting proxy.
pub struct ProxyServer {
    listener: TcpListener,
    port: u16,
    shared: Arc<ProxyShared>,
}

impl ProxyServer {
    /// Bind `127.0.0.1:<port>` (port from config, 0 = ephemeral).
    pub async fn bind(ctx: &StreamingContext) -> Result<ProxyServer> {
        let config = ctx.config();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {}", addr))?;
        let port = listener.local_addr()?.port();
        tracing::debug!(port, "port obtained");

        Ok(ProxyServer {
            listener,
            port,
            shared: Arc::new(ProxyShared {
                loader: ctx.loader().clone(),
                initial_timeout: config.initial_timeout(),
                transfer_timeout: config.transfer_timeout(),
                next_preload_delay: config.next_preload_delay(),
                running: AtomicBool::new(true),
                stop: Notify::new(),
            }),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Spawn the accept loop.
    pub fn start(self) -> ProxyHandle {
        let shared = Arc::clone(&self.shared);
        let port = self.port;
        let task = tokio::spawn(accept_loop(self.listener, Arc::clone(&self.shared)));
        tracing::info!(port, "proxy listening on 127.0.0.1:{}", port);
        ProxyHandle { port, shared, task }
    }
}

/// Running proxy.
pub struct ProxyHandle {
    port: u16,
    shared: Arc<ProxyShared>,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn create_uri(&self, stream_url: &str, next_stream_url: Option<&str>) -> Result<Url> {
        create_uri(self.port, stream_url, next_stream_url)
    }

    /// Stop accepting; open connections end after their current write.
    pub async fn stop(self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.stop.notify_one();
        let _ = self.task.await;
    }
}

/// URL a player should open to stream `stream_url` through the proxy on
/// `port`, optionally prefetching `next_stream_url`.
pub fn create_uri(port: u16, stream_url: &str, next_stream_url: Option<&str>) -> Result<Url> {
    if stream_url.is_empty() {
        bail!("stream url is empty");
    }
    let mut uri = Url::parse(&format!("http://127.0.0.1:{}/", port))?;
    {
        let mut query = uri.query_pairs_mut();
        query.append_pair(request::PARAM_STREAM_URL, stream_url);
        if let Some(next) = next_stream_url {
            query.append_pair(request::PARAM_NEXT_STREAM_URL, next);
        }
    }
    Ok(uri)
}

async fn accept_loop(listener: TcpListener, shared: Arc<ProxyShared>) {
    loop {
        tokio::select! {
            _ = shared.stop.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "client connected");
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, "set_nodelay: {}", e);
                    }
                    tokio::spawn(serve_connection(stream, peer, Arc::clone(&shared)));
                }
                Err(e) => tracing::warn!("proxy accept error: {}", e),
            }
        }
    }
    tracing::info!("proxy stopped");
}

/// One request per connection; players reconnect for each seek.
async fn serve_connection(stream: tokio::net::TcpStream, peer: SocketAddr, shared: Arc<ProxyShared>) {
    let io = TokioIo::new(stream);
    let svc = service_fn(move |req| handler::handle(req, peer, Arc::clone(&shared)));
    let conn = http1::Builder::new().keep_alive(false).serve_connection(io, svc);
    match conn.await {
        Ok(()) => tracing::debug!(%peer, "connection closed"),
        Err(e) if handler::is_expected_close(&e) => {
            tracing::debug!(%peer, "connection ended early: {}", e)
        }
        Err(e) => tracing::warn!(%peer, "proxy connection error: {}", e),
    }
}
