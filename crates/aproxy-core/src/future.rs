//! Single-settlement handle for one pending player read.

use crate::chunk::ByteRange;
use crate::item::ItemRef;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FutureError {
    #[error("timed out waiting for data")]
    Timeout,
    #[error("request canceled")]
    Canceled,
}

enum Slot {
    Pending,
    Ready(Vec<u8>),
    Canceled,
}

struct Inner {
    item: ItemRef,
    range: ByteRange,
    slot: Mutex<Slot>,
    notify: Notify,
}

/// Bytes for `range` of `item`, delivered later. Settles exactly once,
/// either with data or as canceled; whichever comes first wins.
#[derive(Clone)]
pub struct StreamFuture {
    inner: Arc<Inner>,
}

impl StreamFuture {
    pub fn new(item: ItemRef, range: ByteRange) -> Self {
        StreamFuture {
            inner: Arc::new(Inner {
                item,
                range,
                slot: Mutex::new(Slot::Pending),
                notify: Notify::new(),
            }),
        }
    }

    pub fn item(&self) -> &ItemRef {
        &self.inner.item
    }

    pub fn range(&self) -> ByteRange {
        self.inner.range
    }

    /// Settle with data. Returns false if already settled.
    pub fn set_data(&self, data: Vec<u8>) -> bool {
        self.settle(Slot::Ready(data))
    }

    /// Settle as canceled. Returns false if already settled.
    pub fn cancel(&self) -> bool {
        self.settle(Slot::Canceled)
    }

    pub fn is_settled(&self) -> bool {
        !matches!(*crate::lock(&self.inner.slot), Slot::Pending)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(*crate::lock(&self.inner.slot), Slot::Canceled)
    }

    /// True when no handle other than this one is left, i.e. the requester
    /// stopped waiting.
    pub fn is_abandoned(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// Wait up to `timeout` for the result.
    pub async fn get(&self, timeout: Duration) -> Result<Vec<u8>, FutureError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.peek() {
                return result;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.peek().unwrap_or(Err(FutureError::Timeout));
            }
        }
    }

    fn peek(&self) -> Option<Result<Vec<u8>, FutureError>> {
        match &*crate::lock(&self.inner.slot) {
            Slot::Pending => None,
            Slot::Ready(data) => Some(Ok(data.clone())),
            Slot::Canceled => Some(Err(FutureError::Canceled)),
        }
    }

    fn settle(&self, value: Slot) -> bool {
        {
            let mut slot = crate::lock(&self.inner.slot);
            if !matches!(*slot, Slot::Pending) {
                return false;
            }
            *slot = value;
        }
        self.inner.notify.notify_waiters();
        true
    }
}

impl fmt::Debug for StreamFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*crate::lock(&self.inner.slot) {
            Slot::Pending => "pending",
            Slot::Ready(_) => "ready",
            Slot::Canceled => "canceled",
        };
        f.debug_struct("StreamFuture")
            .field("url", &self.inner.item.url())
            .field("range", &self.inner.range)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;

    fn future() -> StreamFuture {
        StreamFuture::new(Item::new("http://x/a"), ByteRange::new(0, 4))
    }

    #[tokio::test]
    async fn data_then_cancel_is_noop() {
        let f = future();
        assert!(f.set_data(b"abcd".to_vec()));
        assert!(!f.cancel());
        assert!(!f.set_data(b"zzzz".to_vec()));
        assert_eq!(f.get(Duration::from_millis(10)).await, Ok(b"abcd".to_vec()));
        assert!(!f.is_canceled());
    }

    #[tokio::test]
    async fn cancel_then_data_is_noop() {
        let f = future();
        assert!(f.cancel());
        assert!(!f.set_data(b"abcd".to_vec()));
        assert_eq!(f.get(Duration::from_millis(10)).await, Err(FutureError::Canceled));
    }

    #[tokio::test]
    async fn get_times_out_when_pending() {
        let f = future();
        assert_eq!(f.get(Duration::from_millis(20)).await, Err(FutureError::Timeout));
        assert!(!f.is_settled());
    }

    #[tokio::test]
    async fn waiter_wakes_on_settle() {
        let f = future();
        let setter = f.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            setter.set_data(vec![1, 2, 3, 4]);
        });
        assert_eq!(f.get(Duration::from_secs(5)).await, Ok(vec![1, 2, 3, 4]));
        task.await.unwrap();
    }

    #[test]
    fn abandoned_when_last_handle() {
        let f = future();
        let other = f.clone();
        assert!(!f.is_abandoned());
        drop(other);
        assert!(f.is_abandoned());
    }
}
