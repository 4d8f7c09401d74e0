//! PCM ingress: framed PCM from the upstream program source.
//!
//! The wire contract is a stream of fixed 4608-byte records (1152 stereo
//! s16le samples at 48kHz) over a local TCP socket. Any number of
//! producer connections may come and go; each is read record-by-record
//! into the shared drop-newest buffer. A partial trailing record (the
//! producer died mid-write) is discarded, never buffered.
//!
//! Overflow is an expected condition: it is counted and surfaced through
//! the status endpoint, not logged per frame.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::{BufferStats, FrameBuffer, OverflowPolicy, PushResult};
use crate::error::{TowerError, TowerResult};
use crate::protocol_constants::PCM_FRAME_BYTES;

/// Buffered PCM from upstream producers, consumed by the pump.
pub struct PcmIngress {
    /// Drop-newest: refusing fresh frames preserves in-order older ones
    /// and keeps playout latency minimal.
    buffer: FrameBuffer,
}

impl PcmIngress {
    /// Creates the ingress buffer with room for `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: FrameBuffer::new(capacity, OverflowPolicy::DropNewest),
        }
    }

    /// Accepts one complete frame; drops it (counted) when full.
    /// Returns whether the frame was stored.
    pub fn push_frame(&self, frame: Bytes) -> bool {
        matches!(self.buffer.push(frame), PushResult::Accepted { .. })
    }

    /// Pops one frame. With `timeout = None` the call returns
    /// immediately; otherwise it waits up to the timeout.
    pub async fn pop_frame(&self, timeout: Option<Duration>) -> Option<Bytes> {
        match timeout {
            None => self.buffer.pop(),
            Some(timeout) => self.buffer.pop_wait(timeout).await,
        }
    }

    /// Occupancy and drop counters for the status endpoint.
    #[must_use]
    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }
}

/// Binds the PCM listener and spawns the accept loop.
///
/// Returns the bound address (useful when the configured port is 0) and
/// the accept task handle. The task ends when `shutdown` is cancelled.
pub async fn spawn_listener(
    ingress: Arc<PcmIngress>,
    addr: &str,
    shutdown: CancellationToken,
) -> TowerResult<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        TowerError::Configuration(format!("cannot bind PCM listener on {}: {}", addr, e))
    })?;
    let local_addr = listener.local_addr()?;
    log::info!("[Ingress] PCM listener on {}", local_addr);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            log::info!("[Ingress] Producer connected: {}", peer);
                            let ingress = Arc::clone(&ingress);
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                read_producer(stream, peer, &ingress, shutdown).await;
                            });
                        }
                        Err(e) => {
                            log::warn!("[Ingress] Accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        log::debug!("[Ingress] Accept loop stopped");
    });

    Ok((local_addr, task))
}

/// Reads fixed-size records from one producer until it disconnects.
async fn read_producer(
    mut stream: TcpStream,
    peer: SocketAddr,
    ingress: &PcmIngress,
    shutdown: CancellationToken,
) {
    let mut record = vec![0u8; PCM_FRAME_BYTES];
    let mut frames: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            read = stream.read_exact(&mut record) => {
                match read {
                    Ok(_) => {
                        ingress.push_frame(Bytes::copy_from_slice(&record));
                        frames += 1;
                    }
                    Err(e) => {
                        // UnexpectedEof here means a partial trailing
                        // record; read_exact already swallowed it.
                        if e.kind() != std::io::ErrorKind::UnexpectedEof {
                            log::warn!("[Ingress] Read error from {}: {}", peer, e);
                        }
                        break;
                    }
                }
            }
        }
    }

    log::info!(
        "[Ingress] Producer disconnected: {} ({} frames)",
        peer,
        frames
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn frame(byte: u8) -> Bytes {
        Bytes::from(vec![byte; PCM_FRAME_BYTES])
    }

    #[tokio::test(start_paused = true)]
    async fn pop_without_timeout_returns_immediately() {
        let ingress = PcmIngress::new(4);
        assert_eq!(ingress.pop_frame(None).await, None);

        ingress.push_frame(frame(1));
        assert_eq!(ingress.pop_frame(None).await.unwrap()[0], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_drops_newest_and_counts() {
        let ingress = PcmIngress::new(2);
        assert!(ingress.push_frame(frame(1)));
        assert!(ingress.push_frame(frame(2)));
        assert!(!ingress.push_frame(frame(3)));

        let stats = ingress.stats();
        assert_eq!(stats.len, 2);
        assert_eq!(stats.dropped, 1);

        // Order preserved, newest refused.
        assert_eq!(ingress.pop_frame(None).await.unwrap()[0], 1);
        assert_eq!(ingress.pop_frame(None).await.unwrap()[0], 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listener_frames_complete_records_and_discards_partials() {
        let ingress = Arc::new(PcmIngress::new(16));
        let shutdown = CancellationToken::new();
        let (addr, task) = spawn_listener(Arc::clone(&ingress), "127.0.0.1:0", shutdown.clone())
            .await
            .expect("bind should succeed");

        let mut producer = TcpStream::connect(addr).await.unwrap();
        let mut payload = Vec::new();
        payload.extend_from_slice(&vec![0xAA; PCM_FRAME_BYTES]);
        payload.extend_from_slice(&vec![0xBB; PCM_FRAME_BYTES]);
        payload.extend_from_slice(&vec![0xCC; 1000]); // partial trailing record
        producer.write_all(&payload).await.unwrap();
        producer.shutdown().await.unwrap();
        drop(producer);

        // Wait for the reader task to drain the connection.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while ingress.stats().len < 2 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(ingress.stats().len, 2, "partial record must be discarded");
        assert_eq!(ingress.pop_frame(None).await.unwrap()[0], 0xAA);
        assert_eq!(ingress.pop_frame(None).await.unwrap()[0], 0xBB);

        shutdown.cancel();
        let _ = task.await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listener_survives_producer_reconnects() {
        let ingress = Arc::new(PcmIngress::new(16));
        let shutdown = CancellationToken::new();
        let (addr, task) = spawn_listener(Arc::clone(&ingress), "127.0.0.1:0", shutdown.clone())
            .await
            .unwrap();

        for byte in [0x01u8, 0x02] {
            let mut producer = TcpStream::connect(addr).await.unwrap();
            producer
                .write_all(&vec![byte; PCM_FRAME_BYTES])
                .await
                .unwrap();
            producer.shutdown().await.unwrap();
            drop(producer);
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while ingress.stats().len < 2 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ingress.stats().len, 2);

        shutdown.cancel();
        let _ = task.await;
    }
}
