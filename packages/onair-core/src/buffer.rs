//! Bounded frame queues with explicit overflow policy.
//!
//! [`FrameBuffer`] is the only queue type in the audio path: the PCM ingress
//! buffer (drop-newest, older frames minimize playout latency) and the MP3
//! output buffer (drop-oldest, freshness beats history) are both instances
//! of it. The buffer is format-agnostic; callers own frame shape.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

/// What happens to an incoming frame when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the head to make room; the new frame is always accepted.
    DropOldest,
    /// Refuse the new frame; buffered frames keep their order.
    DropNewest,
}

/// Outcome of a [`FrameBuffer::push`].
#[derive(Debug, PartialEq, Eq)]
pub enum PushResult {
    /// Frame stored. `evicted` carries the head that made room, if any.
    Accepted { evicted: Option<Bytes> },
    /// Buffer full under drop-newest; the frame was refused.
    Rejected,
}

/// Constant-time occupancy snapshot, serializable for the status endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BufferStats {
    pub len: usize,
    pub capacity: usize,
    pub pushed: u64,
    pub dropped: u64,
}

struct Inner {
    queue: VecDeque<Bytes>,
    pushed: u64,
    dropped: u64,
}

/// Bounded FIFO of byte-string frames.
///
/// All operations are O(1) and lock one internal mutex briefly.
/// Multiple producers and consumers are safe; a completed `push` is
/// visible to any `pop` that starts afterwards.
pub struct FrameBuffer {
    capacity: usize,
    policy: OverflowPolicy,
    inner: Mutex<Inner>,
    /// Signalled on every accepted push; `pop_wait` parks on it.
    notify: Notify,
}

impl FrameBuffer {
    /// Creates a buffer holding up to `capacity` frames.
    ///
    /// # Panics
    /// Panics if `capacity` is zero; [`crate::state::Config::validate`]
    /// rejects that before any buffer is built.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "FrameBuffer capacity must be >= 1");
        Self {
            capacity,
            policy,
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                pushed: 0,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Appends a frame, applying the overflow policy. Never blocks.
    pub fn push(&self, frame: Bytes) -> PushResult {
        let result = {
            let mut inner = self.inner.lock();
            if inner.queue.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        let evicted = inner.queue.pop_front();
                        inner.queue.push_back(frame);
                        inner.pushed += 1;
                        inner.dropped += 1;
                        PushResult::Accepted { evicted }
                    }
                    OverflowPolicy::DropNewest => {
                        inner.dropped += 1;
                        PushResult::Rejected
                    }
                }
            } else {
                inner.queue.push_back(frame);
                inner.pushed += 1;
                PushResult::Accepted { evicted: None }
            }
        };

        if matches!(result, PushResult::Accepted { .. }) {
            self.notify.notify_one();
        }
        result
    }

    /// Removes and returns the head frame, or `None` when empty.
    pub fn pop(&self) -> Option<Bytes> {
        self.inner.lock().queue.pop_front()
    }

    /// Like [`FrameBuffer::pop`], but waits up to `timeout` for a frame.
    ///
    /// Returns `None` on timeout. The wait is signalled by `push`, so the
    /// caller wakes as soon as a frame lands rather than polling.
    pub async fn pop_wait(&self, timeout: Duration) -> Option<Bytes> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self.pop() {
                return Some(frame);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                // One last look: a push may have landed between the pop
                // above and the timeout firing.
                return self.pop();
            }
        }
    }

    /// Returns the current occupancy and counters.
    #[must_use]
    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock();
        BufferStats {
            len: inner.queue.len(),
            capacity: self.capacity,
            pushed: inner.pushed,
            dropped: inner.dropped,
        }
    }

    /// Returns the number of frames currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Returns whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Empties the buffer. Test-only: the running pipeline never clears
    /// a buffer (restart survival depends on it).
    #[cfg(test)]
    pub fn clear(&self) {
        self.inner.lock().queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(byte: u8) -> Bytes {
        Bytes::from(vec![byte; 8])
    }

    #[test]
    fn push_then_pop_returns_identical_bytes() {
        let buffer = FrameBuffer::new(4, OverflowPolicy::DropNewest);
        let input = Bytes::from_static(b"\x01\x02\x03\x04");
        assert_eq!(
            buffer.push(input.clone()),
            PushResult::Accepted { evicted: None }
        );
        assert_eq!(buffer.pop(), Some(input));
        assert_eq!(buffer.pop(), None);
    }

    #[test]
    fn drop_newest_rejects_on_overflow_and_preserves_order() {
        let buffer = FrameBuffer::new(2, OverflowPolicy::DropNewest);
        buffer.push(frame(1));
        buffer.push(frame(2));
        assert_eq!(buffer.push(frame(3)), PushResult::Rejected);

        assert_eq!(buffer.pop().unwrap()[0], 1);
        assert_eq!(buffer.pop().unwrap()[0], 2);
        assert_eq!(buffer.pop(), None);

        let stats = buffer.stats();
        assert_eq!(stats.pushed, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn drop_oldest_evicts_head_and_keeps_capacity() {
        let buffer = FrameBuffer::new(2, OverflowPolicy::DropOldest);
        buffer.push(frame(1));
        buffer.push(frame(2));
        let result = buffer.push(frame(3));
        match result {
            PushResult::Accepted { evicted: Some(e) } => assert_eq!(e[0], 1),
            other => panic!("expected eviction, got {:?}", other),
        }

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.pop().unwrap()[0], 2);
        assert_eq!(buffer.pop().unwrap()[0], 3);

        let stats = buffer.stats();
        assert_eq!(stats.pushed, 3);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn stats_snapshot_reflects_occupancy() {
        let buffer = FrameBuffer::new(8, OverflowPolicy::DropOldest);
        buffer.push(frame(1));
        buffer.push(frame(2));
        let stats = buffer.stats();
        assert_eq!(stats.len, 2);
        assert_eq!(stats.capacity, 8);
        assert_eq!(stats.pushed, 2);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pop_wait_times_out_on_empty_buffer() {
        let buffer = FrameBuffer::new(4, OverflowPolicy::DropNewest);
        let result = buffer.pop_wait(Duration::from_millis(5)).await;
        assert_eq!(result, None);
    }

    #[tokio::test(start_paused = true)]
    async fn pop_wait_wakes_on_push() {
        let buffer = std::sync::Arc::new(FrameBuffer::new(4, OverflowPolicy::DropNewest));

        let consumer = {
            let buffer = std::sync::Arc::clone(&buffer);
            tokio::spawn(async move { buffer.pop_wait(Duration::from_secs(1)).await })
        };

        // Let the consumer park on the notify before pushing.
        tokio::task::yield_now().await;
        buffer.push(frame(7));

        let got = consumer.await.unwrap();
        assert_eq!(got.unwrap()[0], 7);
    }

    #[tokio::test(start_paused = true)]
    async fn pop_wait_returns_existing_frame_immediately() {
        let buffer = FrameBuffer::new(4, OverflowPolicy::DropNewest);
        buffer.push(frame(9));
        let got = buffer.pop_wait(Duration::from_millis(5)).await;
        assert_eq!(got.unwrap()[0], 9);
    }
}
