//! Loader: turns "bytes [start, len) of url" into a [`StreamFuture`].
//!
//! The [`Loader`] handle is cheap to clone and used from proxy connections.
//! All bookkeeping (queues, pending futures, in-flight tasks) lives on a
//! dedicated `aproxy-loader` thread that owns a [`state::LoaderState`]; the
//! handle only sends it messages. Worker lanes report into the same channel.
//! Store mutations happen on that thread, never on a runtime worker.

mod state;

use crate::chunk::{ByteRange, ChunkIndex, ChunkRange};
use crate::config::ProxyConfig;
use crate::future::StreamFuture;
use crate::item::ItemRef;
use crate::lane::{LaneContext, LaneReport, NetworkLock, WorkerLane};
use crate::retry::RetryPolicy;
use crate::storage::Store;
use crate::upstream::Upstream;
use state::LoaderState;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const RESULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// The item is known to be gone upstream.
    #[error("item unavailable (HTTP {status})")]
    Unavailable { status: u16 },
    /// The range starts beyond any chunk the cache can address.
    #[error("range starting at byte {start} is out of range")]
    OutOfRange { start: u64 },
    /// Cached data claims to be complete but cannot be read back.
    #[error("cached data unreadable: {0}")]
    Storage(String),
    #[error("loader stopped")]
    Closed,
}

/// Loader knobs taken from [`ProxyConfig`].
#[derive(Debug, Clone, Copy)]
pub struct LoaderOptions {
    pub preload_chunks: u32,
    pub prefetch: bool,
    pub honor_redirect_expiry: bool,
}

impl From<&ProxyConfig> for LoaderOptions {
    fn from(cfg: &ProxyConfig) -> Self {
        Self {
            preload_chunks: cfg.preload_chunks,
            prefetch: cfg.prefetch,
            honor_redirect_expiry: cfg.honor_redirect_expiry,
        }
    }
}

pub(crate) enum Message {
    /// A player read with `missing` chunks not yet stored.
    Request {
        future: StreamFuture,
        missing: ChunkIndex,
    },
    Preload {
        item: ItemRef,
        missing: ChunkIndex,
    },
    LogPlayback {
        url: String,
    },
    Report(LaneReport),
    Shutdown,
}

impl From<LaneReport> for Message {
    fn from(report: LaneReport) -> Self {
        Message::Report(report)
    }
}

enum Lookup {
    Ready(ItemRef, Vec<u8>),
    Missing(ItemRef, ChunkIndex),
}

#[derive(Clone)]
pub struct Loader {
    shared: Arc<Shared>,
}

struct Shared {
    tx: mpsc::Sender<Message>,
    store: Store,
    options: LoaderOptions,
    network_lock: Arc<NetworkLock>,
    preload_generation: AtomicU64,
    /// Hands back both lanes once the loader thread has left its loop.
    stopped: Mutex<Option<oneshot::Receiver<(WorkerLane, WorkerLane)>>>,
}

impl Loader {
    /// Start the loader thread and both worker lanes. Must be called from
    /// within a tokio runtime, which the lanes and the loader thread use.
    pub fn start(store: Store, upstream: Arc<dyn Upstream>, config: &ProxyConfig) -> io::Result<Loader> {
        let options = LoaderOptions::from(config);
        let network_lock = NetworkLock::new();
        let ctx = LaneContext {
            upstream,
            policy: RetryPolicy::from(&config.retry_or_default()),
            network_lock: Arc::clone(&network_lock),
            chunk_size: store.chunk_size(),
        };
        let (tx, rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let resolve_lane = WorkerLane::spawn("resolve", ctx.clone(), tx.clone());
        let fetch_lane = WorkerLane::spawn("fetch", ctx, tx.clone());
        let state = LoaderState::new(store.clone(), options, resolve_lane, fetch_lane);

        let runtime = tokio::runtime::Handle::current();
        let (done_tx, done_rx) = oneshot::channel();
        thread::Builder::new()
            .name("aproxy-loader".to_string())
            .spawn(move || {
                let _rt = runtime.enter();
                let lanes = state.run(rx);
                let _ = done_tx.send(lanes);
            })?;
        tracing::info!(chunk_size = store.chunk_size(), "loader started");

        Ok(Loader {
            shared: Arc::new(Shared {
                tx,
                store,
                options,
                network_lock,
                preload_generation: AtomicU64::new(0),
                stopped: Mutex::new(Some(done_rx)),
            }),
        })
    }

    pub fn store(&self) -> &Store {
        &self.shared.store
    }

    pub fn options(&self) -> LoaderOptions {
        self.shared.options
    }

    /// True while a worker lane is talking to upstream.
    pub fn network_busy(&self) -> bool {
        self.shared.network_lock.is_held()
    }

    /// Request `range` of `url`.
    ///
    /// When every covered chunk is stored the returned future is already
    /// settled. Otherwise the missing chunks are queued at high priority and
    /// `url` becomes the current item.
    pub async fn request_range(&self, url: &str, range: ByteRange) -> Result<StreamFuture, LoaderError> {
        tracing::debug!(url, ?range, "request range");
        let store = self.shared.store.clone();
        let owned = url.to_string();
        let lookup = tokio::task::spawn_blocking(move || lookup(&store, &owned, range))
            .await
            .map_err(|_| LoaderError::Closed)??;

        match lookup {
            Lookup::Ready(item, data) => {
                tracing::debug!(url, "serving range from storage");
                let future = StreamFuture::new(item, range);
                future.set_data(data);
                Ok(future)
            }
            Lookup::Missing(item, missing) => {
                let future = StreamFuture::new(item, range);
                let msg = Message::Request {
                    future: future.clone(),
                    missing,
                };
                self.shared.tx.send(msg).await.map_err(|_| LoaderError::Closed)?;
                Ok(future)
            }
        }
    }

    /// After `delay`, queue the first chunks of `url` at low priority.
    ///
    /// A later call supersedes a preload that has not fired yet. Does
    /// nothing when prefetching is disabled.
    pub fn preload(&self, url: &str, delay: Duration) {
        let opts = self.shared.options;
        if !opts.prefetch || opts.preload_chunks == 0 {
            return;
        }
        let generation = self.shared.preload_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = Arc::clone(&self.shared);
        let url = url.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if shared.preload_generation.load(Ordering::SeqCst) != generation {
                tracing::debug!(url = %url, "preload superseded");
                return;
            }
            let store = shared.store.clone();
            let range = ChunkRange::new(0, opts.preload_chunks);
            let found = tokio::task::spawn_blocking(move || {
                let item = store.get_metadata(&url);
                let missing = store.compute_missing_chunks(&url, range);
                (item, missing)
            })
            .await;
            let Ok((item, missing)) = found else {
                return;
            };
            if missing.is_empty() || !item.is_available() {
                return;
            }
            tracing::debug!(url = item.url(), "preloading");
            let _ = shared.tx.send(Message::Preload { item, missing }).await;
        });
    }

    /// Queue a playback log for `url` on the resolve lane. Returns false if
    /// the loader is saturated or stopped.
    pub fn log_playcount(&self, url: &str) -> bool {
        self.shared
            .tx
            .try_send(Message::LogPlayback {
                url: url.to_string(),
            })
            .is_ok()
    }

    /// Cancel pending futures, wait for the loader thread and stop both
    /// lanes.
    pub async fn shutdown(&self) {
        let _ = self.shared.tx.send(Message::Shutdown).await;
        let stopped = crate::lock(&self.shared.stopped).take();
        let Some(stopped) = stopped else {
            return;
        };
        match stopped.await {
            Ok((resolve_lane, fetch_lane)) => {
                resolve_lane.shutdown().await;
                fetch_lane.shutdown().await;
                tracing::info!("loader stopped");
            }
            Err(_) => tracing::error!("loader thread exited without handing back its lanes"),
        }
    }
}

/// Resolve a request against the store. A record that claims the range is
/// stored but cannot be read is dropped and looked up once more.
fn lookup(store: &Store, url: &str, range: ByteRange) -> Result<Lookup, LoaderError> {
    let chunks = range
        .try_chunk_range(store.chunk_size())
        .ok_or(LoaderError::OutOfRange { start: range.start })?;
    let mut last_error = String::new();
    for _ in 0..2 {
        let item = store.get_metadata(url);
        if !item.is_available() {
            let status = item.record().http_error;
            return Err(LoaderError::Unavailable { status });
        }
        let missing = store.compute_missing_chunks(url, chunks);
        if !missing.is_empty() {
            return Ok(Lookup::Missing(item, missing));
        }
        match store.read_bytes(url, range) {
            Ok(data) => return Ok(Lookup::Ready(item, data)),
            Err(e) => {
                tracing::warn!(url, "stored read failed, reloading metadata: {:#}", e);
                last_error = format!("{:#}", e);
                store.remove_metadata(url);
            }
        }
    }
    Err(LoaderError::Storage(last_error))
}
