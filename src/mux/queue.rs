//! Bounded drop-oldest queue of encoded frames.
//!
//! Many writers (the scheduler task), one reader (the send loop). When the
//! queue is full the oldest frame is evicted so a slow viewer falls behind
//! on stale data, not fresh data; the caller learns about drops from the
//! [`FrameQueue::push`] return value and triggers a resync.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

struct Inner {
    frames: VecDeque<Bytes>,
    closed: bool,
}

/// FIFO of encoded frames with a hard capacity.
pub struct FrameQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl FrameQueue {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a frame, evicting the oldest when full.
    ///
    /// Returns `true` if any frame was dropped to make room. Pushing to a
    /// closed queue is a no-op returning `false`.
    pub fn push(&self, frame: Bytes) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        let mut dropped = false;
        while inner.frames.len() >= self.capacity {
            inner.frames.pop_front();
            dropped = true;
        }
        inner.frames.push_back(frame);
        drop(inner);
        self.notify.notify_one();
        dropped
    }

    /// Dequeue the next frame, waiting until one is available. Returns
    /// `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Bytes> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Discard all queued frames.
    pub fn clear(&self) {
        self.inner.lock().frames.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    /// Close the queue. The reader drains what remains, then sees `None`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}
