//! Bounded outbound payload queue
//!
//! The queue between payload producers (TTS pacer, DTMF generator) and a
//! call's single paced sender. It is FIFO, bounded, and clearable: a barge-in
//! flushes pending audio without touching the sender's sequence/timestamp
//! bookkeeping.
//!
//! `push` applies backpressure by waiting for space, which keeps producers at
//! the real-time rate once the queue has filled.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// A bounded multi-producer single-consumer FIFO of RTP payloads
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    items: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    /// Signalled when an item is pushed
    available: Notify,
    /// Signalled when space frees up
    space: Notify,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` payloads
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity: capacity.max(1),
                available: Notify::new(),
                space: Notify::new(),
            }),
        }
    }

    /// Enqueue a payload, waiting for space if the queue is full
    pub async fn push(&self, payload: Bytes) {
        loop {
            let space = self.inner.space.notified();
            {
                let mut items = self.inner.items.lock();
                if items.len() < self.inner.capacity {
                    items.push_back(payload);
                    self.inner.available.notify_one();
                    return;
                }
            }
            space.await;
        }
    }

    /// Enqueue without waiting; returns the payload back when the queue is full
    pub fn try_push(&self, payload: Bytes) -> std::result::Result<(), Bytes> {
        let mut items = self.inner.items.lock();
        if items.len() < self.inner.capacity {
            items.push_back(payload);
            self.inner.available.notify_one();
            Ok(())
        } else {
            Err(payload)
        }
    }

    /// Dequeue the next payload, waiting until one arrives
    pub async fn pop(&self) -> Bytes {
        loop {
            let available = self.inner.available.notified();
            {
                let mut items = self.inner.items.lock();
                if let Some(payload) = items.pop_front() {
                    self.inner.space.notify_one();
                    return payload;
                }
            }
            available.await;
        }
    }

    /// Dequeue with a bounded wait; `None` on timeout
    pub async fn pop_timeout(&self, wait: Duration) -> Option<Bytes> {
        tokio::time::timeout(wait, self.pop()).await.ok()
    }

    /// Drop every pending payload, returning how many were discarded
    pub fn clear(&self) -> usize {
        let drained = {
            let mut items = self.inner.items.lock();
            let n = items.len();
            items.clear();
            n
        };
        if drained > 0 {
            self.inner.space.notify_waiters();
        }
        drained
    }

    /// Number of payloads currently queued
    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_preserved() {
        let queue = OutboundQueue::new(8);
        for i in 0u8..5 {
            queue.push(Bytes::from(vec![i])).await;
        }
        for i in 0u8..5 {
            assert_eq!(queue.pop().await[0], i);
        }
    }

    #[tokio::test]
    async fn pop_timeout_on_empty() {
        let queue = OutboundQueue::new(2);
        let got = queue.pop_timeout(Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn push_blocks_until_space() {
        let queue = OutboundQueue::new(2);
        queue.push(Bytes::from_static(b"a")).await;
        queue.push(Bytes::from_static(b"b")).await;
        assert!(queue.try_push(Bytes::from_static(b"c")).is_err());

        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.push(Bytes::from_static(b"c")).await;
            })
        };
        // Give the pusher a chance to park on the full queue
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pusher.is_finished());

        assert_eq!(&queue.pop().await[..], b"a");
        pusher.await.unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn clear_discards_everything() {
        let queue = OutboundQueue::new(8);
        for _ in 0..5 {
            queue.push(Bytes::from_static(b"x")).await;
        }
        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
        assert_eq!(queue.clear(), 0);
    }

    #[tokio::test]
    async fn clear_unblocks_pushers() {
        let queue = OutboundQueue::new(1);
        queue.push(Bytes::from_static(b"a")).await;
        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.push(Bytes::from_static(b"b")).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.clear();
        pusher.await.unwrap();
        assert_eq!(&queue.pop().await[..], b"b");
    }
}
