//! Shared network-performance lock held by worker lanes while a task runs.
//!
//! Reference counted: the lock is "held" while at least one lane is inside
//! a task, and released when the last guard drops. The loader reports it as
//! [`crate::loader::Loader::network_busy`]; the first acquire and last
//! release are logged.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct NetworkLock {
    holders: AtomicUsize,
}

impl NetworkLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of guards currently alive.
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::Relaxed)
    }

    pub fn is_held(&self) -> bool {
        self.holders() > 0
    }

    /// Take a reference; released when the guard drops.
    pub fn acquire(self: &Arc<Self>) -> NetworkLockGuard {
        if self.holders.fetch_add(1, Ordering::AcqRel) == 0 {
            tracing::debug!("network in use");
        }
        NetworkLockGuard {
            lock: Arc::clone(self),
        }
    }
}

#[derive(Debug)]
pub struct NetworkLockGuard {
    lock: Arc<NetworkLock>,
}

impl Drop for NetworkLockGuard {
    fn drop(&mut self) {
        if self.lock.holders.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::debug!("network idle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_are_counted() {
        let lock = NetworkLock::new();
        assert!(!lock.is_held());
        let a = lock.acquire();
        let b = lock.acquire();
        assert_eq!(lock.holders(), 2);
        drop(a);
        assert!(lock.is_held());
        drop(b);
        assert_eq!(lock.holders(), 0);
    }
}
