//! MP3 frame broadcast to HTTP listeners.
//!
//! One tick task — on its own cadence, aligned to the frame duration but
//! independent of the pump — pops exactly one frame from the manager per
//! tick and fans it out through a `tokio::sync::broadcast` channel. Every
//! connected client observes the same frame bytes in the same order.
//!
//! Slow-client isolation falls out of the channel: the tick task never
//! waits on any receiver, and a client that stops reading falls behind
//! until the channel reports it lagged, at which point its connection is
//! closed. The channel depth is sized from `client_timeout_ms`, so "lagged"
//! and "couldn't accept within the timeout" coincide.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::encoder::EncoderManager;

/// Delivery gaps above this are counted per client.
const DELIVERY_GAP_THRESHOLD_MS: u64 = 100;

/// Handle for subscribing HTTP clients to the frame feed.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Bytes>,
}

impl Broadcaster {
    /// Subscribes a new client to the live frame feed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }

    /// Number of currently subscribed clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Sizes the broadcast channel so a receiver that stalls for
/// `client_timeout` worth of frames is reported as lagged.
fn channel_capacity(tick: Duration, client_timeout: Duration) -> usize {
    let tick_ms = tick.as_millis().max(1) as u64;
    let frames = client_timeout.as_millis() as u64 / tick_ms;
    (frames as usize).max(2)
}

/// Spawns the broadcast tick task.
///
/// Each tick calls `manager.get_frame()` exactly once. A `None` (cold
/// start, nothing ever encoded) skips the tick without sending bytes;
/// anything else goes to every subscriber.
pub fn spawn_broadcaster(
    manager: Arc<EncoderManager>,
    tick: Duration,
    client_timeout: Duration,
    shutdown: CancellationToken,
) -> (Broadcaster, JoinHandle<()>) {
    let (tx, _) = broadcast::channel(channel_capacity(tick, client_timeout));
    let broadcaster = Broadcaster { tx: tx.clone() };

    let task = tokio::spawn(async move {
        log::info!("[Broadcast] Started ({:?} tick)", tick);
        let mut metronome = tokio::time::interval(tick);
        metronome.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = metronome.tick() => {
                    if let Some(frame) = manager.get_frame() {
                        // Err means no listeners right now; not a failure.
                        let _ = tx.send(frame);
                    }
                }
            }
        }
        log::info!("[Broadcast] Stopped");
    });

    (broadcaster, task)
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-Client Delivery Tracking
// ─────────────────────────────────────────────────────────────────────────────

/// Logs one HTTP listener's lifecycle and tracks its delivery timing.
///
/// Gap tracking uses atomics on the hot path; the summary is written to
/// the log when the guard drops (client disconnected or was dropped).
pub struct DeliveryGuard {
    client_ip: IpAddr,
    reference_time: Instant,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    /// Elapsed nanos of the last delivery (0 = none yet).
    last_delivery_nanos: AtomicU64,
    max_gap_ms: AtomicU64,
    gaps_over_threshold: AtomicU64,
    first_error: Mutex<Option<String>>,
}

impl DeliveryGuard {
    /// Creates a guard and logs the stream start.
    #[must_use]
    pub fn new(client_ip: IpAddr) -> Self {
        log::info!("[Broadcast] Listener connected: {}", client_ip);
        Self {
            client_ip,
            reference_time: Instant::now(),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            last_delivery_nanos: AtomicU64::new(0),
            max_gap_ms: AtomicU64::new(0),
            gaps_over_threshold: AtomicU64::new(0),
            first_error: Mutex::new(None),
        }
    }

    /// Records one frame delivered to this client (lock-free).
    pub fn record_frame(&self, len: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);

        let now_nanos = self.reference_time.elapsed().as_nanos() as u64;
        let prev_nanos = self.last_delivery_nanos.swap(now_nanos, Ordering::Relaxed);
        if prev_nanos > 0 {
            let gap_ms = now_nanos.saturating_sub(prev_nanos) / 1_000_000;
            self.max_gap_ms.fetch_max(gap_ms, Ordering::Relaxed);
            if gap_ms > DELIVERY_GAP_THRESHOLD_MS {
                self.gaps_over_threshold.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Records the first error seen on this client's stream.
    pub fn record_error(&self, err: &str) {
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(err.to_string());
        }
    }
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        let frames = self.frames_sent.load(Ordering::Relaxed);
        let bytes = self.bytes_sent.load(Ordering::Relaxed);
        let max_gap = self.max_gap_ms.load(Ordering::Relaxed);
        let gaps = self.gaps_over_threshold.load(Ordering::Relaxed);

        match self.first_error.get_mut().take() {
            Some(err) => log::warn!(
                "[Broadcast] Listener dropped: {}, frames={}, bytes={}, max_gap={}ms, \
                 gaps_over_{}ms={}, error={}",
                self.client_ip,
                frames,
                bytes,
                max_gap,
                DELIVERY_GAP_THRESHOLD_MS,
                gaps,
                err
            ),
            None => log::info!(
                "[Broadcast] Listener disconnected: {}, frames={}, bytes={}, max_gap={}ms, \
                 gaps_over_{}ms={}",
                self.client_ip,
                frames,
                bytes,
                max_gap,
                DELIVERY_GAP_THRESHOLD_MS,
                gaps
            ),
        }
    }
}
