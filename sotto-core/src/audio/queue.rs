//! Bounded audio frame queue and the batching sender loop.
//!
//! ## Design
//!
//! One producer (the capture worker) and one consumer (the sender task) per
//! session. `push` never blocks: at capacity the oldest frame is evicted —
//! recency beats history for live dictation. Frames are stamped with their
//! session; the consumer silently discards frames from superseded sessions,
//! so a soft-restart needs no queue reset.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::coordinator::EventSender;
use crate::machine::{Event, EventKind};
use crate::session::SessionToken;
use crate::transport::TransportLink;

/// One 100 ms block of capture output: 16-bit signed little-endian mono PCM.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub session: SessionToken,
    pub pcm: Vec<u8>,
    pub captured_at: Instant,
}

/// Frames batched into a single transport send.
pub(crate) const SEND_BATCH_FRAMES: usize = 10;

/// How long the sender waits on an empty queue before re-checking its stop
/// flag.
pub(crate) const SEND_POLL_WAIT: Duration = Duration::from_millis(50);

struct QueueInner {
    frames: VecDeque<AudioFrame>,
    dropped: u64,
}

/// Bounded SPSC queue of [`AudioFrame`]s.
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl FrameQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue a frame. Never blocks; at capacity the oldest frame is
    /// evicted and the drop counter incremented.
    pub fn push(&self, frame: AudioFrame) {
        {
            let mut inner = self.inner.lock();
            if inner.frames.len() >= self.capacity {
                inner.frames.pop_front();
                inner.dropped += 1;
            }
            inner.frames.push_back(frame);
        }
        self.notify.notify_one();
    }

    /// Dequeue up to `max` frames belonging to `session`, waiting up to
    /// `timeout` for the first one. Frames stamped with any other session
    /// are discarded as they are encountered.
    pub async fn pop_batch(
        &self,
        max: usize,
        timeout: Duration,
        session: SessionToken,
    ) -> Vec<AudioFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock();
                let mut items = Vec::new();
                while items.len() < max {
                    match inner.frames.pop_front() {
                        Some(frame) if frame.session == session => items.push(frame),
                        Some(_) => continue,
                        None => break,
                    }
                }
                if !items.is_empty() {
                    return items;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Vec::new();
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => return Vec::new(),
            }
        }
    }

    /// Remove and return every queued frame belonging to `session`,
    /// discarding the rest. Used by the flush path.
    pub fn drain_matching(&self, session: SessionToken) -> Vec<AudioFrame> {
        let mut inner = self.inner.lock();
        inner
            .frames
            .drain(..)
            .filter(|f| f.session == session)
            .collect()
    }

    /// Drop everything. Returns the number of frames discarded.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.frames.len();
        inner.frames.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total frames evicted by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}

/// Sender loop: batch frames off the queue and hand them to the transport.
///
/// Exits when `stop` is set (queue contents are left in place for the flush
/// path) or on the first send failure, which is reported exactly once as a
/// `TransportError` event. No retries — the state machine decides what a
/// transport fault means.
pub(crate) async fn run_sender(
    queue: Arc<FrameQueue>,
    session: SessionToken,
    link: Arc<dyn TransportLink>,
    events: EventSender,
    stop: Arc<AtomicBool>,
) {
    debug!(session = %session, "sender task started");
    while !stop.load(Ordering::Acquire) {
        let frames = queue
            .pop_batch(SEND_BATCH_FRAMES, SEND_POLL_WAIT, session)
            .await;
        if frames.is_empty() {
            continue;
        }

        let mut pcm = Vec::with_capacity(frames.iter().map(|f| f.pcm.len()).sum());
        for frame in &frames {
            pcm.extend_from_slice(&frame.pcm);
        }

        if let Err(e) = link.send_audio(&pcm, false).await {
            warn!(session = %session, error = %e, "audio send failed");
            events.post(
                Event::for_session(EventKind::TransportError, session)
                    .with_detail("Connection lost while streaming audio."),
            );
            return;
        }
    }
    debug!(session = %session, "sender task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(session: SessionToken, byte: u8) -> AudioFrame {
        AudioFrame {
            session,
            pcm: vec![byte; 4],
            captured_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_and_counts_drops() {
        let session = SessionToken::mint();
        let queue = FrameQueue::with_capacity(3);
        for byte in 0..4u8 {
            queue.push(frame(session, byte));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 1);

        let frames = queue
            .pop_batch(10, Duration::from_millis(10), session)
            .await;
        let first: Vec<u8> = frames.iter().map(|f| f.pcm[0]).collect();
        assert_eq!(first, vec![1, 2, 3], "oldest frame must be the one evicted");
    }

    #[tokio::test]
    async fn pop_batch_filters_stale_sessions() {
        let live = SessionToken::mint();
        let stale = SessionToken::mint();
        let queue = FrameQueue::with_capacity(8);
        queue.push(frame(stale, 0));
        queue.push(frame(live, 1));
        queue.push(frame(stale, 2));
        queue.push(frame(live, 3));

        let frames = queue.pop_batch(10, Duration::from_millis(10), live).await;
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.session == live));
        assert!(queue.is_empty(), "stale frames are discarded, not retained");
    }

    #[tokio::test]
    async fn pop_batch_respects_max() {
        let session = SessionToken::mint();
        let queue = FrameQueue::with_capacity(8);
        for byte in 0..5u8 {
            queue.push(frame(session, byte));
        }
        let frames = queue.pop_batch(2, Duration::from_millis(10), session).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn pop_batch_times_out_empty() {
        let queue = FrameQueue::with_capacity(4);
        let started = Instant::now();
        let frames = queue
            .pop_batch(10, Duration::from_millis(30), SessionToken::mint())
            .await;
        assert!(frames.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn pop_batch_wakes_on_push() {
        let session = SessionToken::mint();
        let queue = Arc::new(FrameQueue::with_capacity(4));
        let waiter = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            waiter.pop_batch(10, Duration::from_secs(2), session).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(frame(session, 7));
        let frames = handle.await.expect("pop task panicked");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].pcm[0], 7);
    }

    #[tokio::test]
    async fn drain_matching_keeps_nothing() {
        let live = SessionToken::mint();
        let stale = SessionToken::mint();
        let queue = FrameQueue::with_capacity(8);
        queue.push(frame(live, 1));
        queue.push(frame(stale, 2));
        queue.push(frame(live, 3));

        let drained = queue.drain_matching(live);
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}
