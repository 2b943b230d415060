//! Core engine for aproxy: a loopback HTTP proxy that streams remote audio
//! to a local player while caching it on disk in fixed-size chunks.

pub mod checksum;
pub mod chunk;
pub mod config;
pub mod context;
pub mod future;
pub mod item;
pub mod lane;
pub mod loader;
pub mod logging;
pub mod proxy;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod task;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Mutex, MutexGuard};

/// Lock `m`, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
