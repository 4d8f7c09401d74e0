//! Encoder child process supervision.
//!
//! The supervisor owns the single encoder child and the three pipes
//! connecting to it. PCM goes in through a bounded channel drained to the
//! child's stdin by a dedicated writer task (so [`EncoderSupervisor::write_pcm`]
//! never blocks); MP3 comes out through a drain task that feeds the
//! packetizer and pushes complete frames into the shared MP3 buffer;
//! stderr is relayed line-by-line to the log.
//!
//! A single run loop acts as watchdog and restart worker: it observes
//! startup timeouts, output stalls, pipe breaks and child exits, restarts
//! with backoff, and after `max_restarts` consecutive failures parks in
//! `Failed` with a periodic self-heal retry. The MP3 buffer is never
//! cleared on restart; whatever audio it holds keeps draining to
//! listeners while the child is down.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::FrameBuffer;
use crate::error::{TowerError, TowerResult};
use crate::mp3::Mp3Packetizer;
use crate::protocol_constants::{
    PCM_WRITE_CHANNEL_CAPACITY, STDERR_LOG_BYTE_LIMIT, STDOUT_READ_CHUNK,
};
use crate::state::EncoderConfig;

use super::{EncoderState, FailureKind};

/// Watchdog poll period for startup/stall deadlines.
const WATCHDOG_POLL: Duration = Duration::from_millis(50);

/// How long a dying child gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// How long the drains get to pull residual output after the child ends.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Lifetime counters for the supervision loop, exposed for diagnostics.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EncoderStats {
    /// Child processes spawned (including the first).
    pub generations: u64,
    /// Restarts performed after a failure.
    pub restarts: u64,
    /// PCM frames dropped because no child could take them.
    pub dropped_writes: u64,
}

/// How one encoder generation (spawn → death) ended.
struct GenerationOutcome {
    /// Whether this generation ever produced an MP3 frame.
    reached_running: bool,
    /// `None` means the generation ended because of shutdown.
    failure: Option<FailureKind>,
}

struct Inner {
    config: EncoderConfig,
    mp3_buffer: Arc<FrameBuffer>,
    state_tx: watch::Sender<EncoderState>,
    /// Sender into the current generation's stdin writer; `None` while no
    /// child can accept input. Writes against `None` are dropped no-ops.
    pcm_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    dropped_writes: AtomicU64,
    generations: AtomicU64,
    restarts: AtomicU64,
    shutdown: CancellationToken,
}

impl Inner {
    fn set_state(&self, state: EncoderState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            log::info!("[Encoder] State: {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }
}

/// Owns the encoder child process; callable only by the encoder manager.
pub struct EncoderSupervisor {
    inner: Arc<Inner>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl EncoderSupervisor {
    /// Creates a supervisor around the shared MP3 output buffer. No child
    /// exists until [`EncoderSupervisor::start`].
    #[must_use]
    pub fn new(config: EncoderConfig, mp3_buffer: Arc<FrameBuffer>) -> Self {
        let (state_tx, _) = watch::channel(EncoderState::Stopped);
        Self {
            inner: Arc::new(Inner {
                config,
                mp3_buffer,
                state_tx,
                pcm_tx: Mutex::new(None),
                dropped_writes: AtomicU64::new(0),
                generations: AtomicU64::new(0),
                restarts: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
            run_task: Mutex::new(None),
        }
    }

    /// Launches the supervision loop, which spawns and re-spawns the
    /// encoder child until [`EncoderSupervisor::stop`].
    ///
    /// # Errors
    /// Rejects an argv without the frame-size hint: without a pinned
    /// bitrate the CBR frame-size derivation and the startup deadline
    /// are both meaningless.
    pub fn start(&self) -> TowerResult<()> {
        if self.inner.config.argv.is_empty() {
            return Err(TowerError::Configuration(
                "encoder argv must name an executable".to_string(),
            ));
        }
        if !self.inner.config.has_frame_size_hint() {
            return Err(TowerError::Configuration(
                "encoder argv is missing the frame-size hint".to_string(),
            ));
        }

        let mut run_task = self.run_task.lock();
        if run_task.as_ref().is_some_and(|task| !task.is_finished()) {
            log::warn!("[Encoder] start() called while already running");
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        *run_task = Some(tokio::spawn(run_loop(inner)));
        Ok(())
    }

    /// Signals shutdown, terminates the child and joins the run loop.
    pub async fn stop(&self, timeout: Duration) {
        self.inner.shutdown.cancel();
        let task = self.run_task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(timeout, task).await.is_err() {
                log::warn!("[Encoder] Run loop did not stop within {:?}", timeout);
            }
        }
        self.inner.set_state(EncoderState::Stopped);
    }

    /// Current encoder state.
    #[must_use]
    pub fn state(&self) -> EncoderState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribes to state changes (message-style callback).
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<EncoderState> {
        self.inner.state_tx.subscribe()
    }

    /// Hands one PCM frame to the child. Never blocks, never fails
    /// upward: with no child ready (or a wedged one), the frame is
    /// dropped and counted, and the run loop handles recovery.
    pub fn write_pcm(&self, frame: Bytes) {
        let guard = self.inner.pcm_tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                if tx.try_send(frame).is_err() {
                    self.inner.dropped_writes.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                self.inner.dropped_writes.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of PCM frames dropped because no child could take them.
    #[must_use]
    pub fn dropped_writes(&self) -> u64 {
        self.inner.dropped_writes.load(Ordering::Relaxed)
    }

    /// Lifetime supervision counters.
    #[must_use]
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            generations: self.inner.generations.load(Ordering::Relaxed),
            restarts: self.inner.restarts.load(Ordering::Relaxed),
            dropped_writes: self.inner.dropped_writes.load(Ordering::Relaxed),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run Loop
// ─────────────────────────────────────────────────────────────────────────────

async fn run_loop(inner: Arc<Inner>) {
    let mut consecutive_failures: u32 = 0;

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        inner.set_state(EncoderState::Starting);
        inner.generations.fetch_add(1, Ordering::Relaxed);

        let outcome = match spawn_child(&inner.config) {
            Ok(child) => run_generation(&inner, child).await,
            Err(e) => {
                log::error!("[Encoder] Failed to spawn '{}': {}", inner.config.argv[0], e);
                GenerationOutcome {
                    reached_running: false,
                    failure: Some(FailureKind::SpawnFailed),
                }
            }
        };

        let Some(kind) = outcome.failure else {
            break; // shutdown
        };

        // A generation that produced output starts a fresh failure series.
        consecutive_failures = if outcome.reached_running {
            1
        } else {
            consecutive_failures.saturating_add(1)
        };
        log::warn!(
            "[Encoder] Generation ended: {} ({} consecutive failures)",
            kind,
            consecutive_failures
        );

        if consecutive_failures >= inner.config.max_restarts {
            inner.set_state(EncoderState::Failed);
            let retry = Duration::from_secs(inner.config.recovery_retry_minutes * 60);
            log::error!(
                "[Encoder] {} consecutive failures; degraded, retrying every {:?}",
                consecutive_failures,
                retry
            );
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep(retry) => {}
            }
            log::info!("[Encoder] Self-heal: attempting a full restart");
            consecutive_failures = 0;
            continue;
        }

        inner.set_state(EncoderState::Restarting);
        inner.restarts.fetch_add(1, Ordering::Relaxed);
        let schedule = &inner.config.backoff_schedule_ms;
        let index = (consecutive_failures as usize - 1).min(schedule.len() - 1);
        let backoff = Duration::from_millis(schedule[index]);
        log::info!("[Encoder] Restarting in {:?}", backoff);
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }

    *inner.pcm_tx.lock() = None;
    inner.set_state(EncoderState::Stopped);
}

fn spawn_child(config: &EncoderConfig) -> std::io::Result<Child> {
    let mut cmd = Command::new(&config.argv[0]);
    cmd.args(&config.argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.spawn()
}

/// Runs one child from spawn to death. Returns how it ended; the caller
/// owns backoff and state bookkeeping.
async fn run_generation(inner: &Arc<Inner>, mut child: Child) -> GenerationOutcome {
    log::info!(
        "[Encoder] Child spawned (pid {:?}): {}",
        child.id(),
        inner.config.argv.join(" ")
    );
    inner.set_state(EncoderState::Booting);

    // Pipes are owned by exactly one task each.
    let Some(mut stdin) = child.stdin.take() else {
        return fail_immediately(child, "no stdin pipe").await;
    };
    let Some(mut stdout) = child.stdout.take() else {
        return fail_immediately(child, "no stdout pipe").await;
    };
    let Some(stderr) = child.stderr.take() else {
        return fail_immediately(child, "no stderr pipe").await;
    };

    // Fresh PCM channel per generation; publishing it makes write_pcm live.
    let (pcm_tx, mut pcm_rx) = mpsc::channel::<Bytes>(PCM_WRITE_CHANNEL_CAPACITY);
    *inner.pcm_tx.lock() = Some(pcm_tx);

    let (fail_tx, mut fail_rx) = mpsc::channel::<FailureKind>(4);

    let first_frame = Arc::new(AtomicBool::new(false));
    let last_output = Arc::new(Mutex::new(Instant::now()));

    // Stdin writer: the only task touching the child's stdin.
    let writer_fail = fail_tx.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = pcm_rx.recv().await {
            if let Err(e) = stdin.write_all(&frame).await {
                log::warn!("[Encoder] PCM write to child failed: {}", e);
                let _ = writer_fail.try_send(FailureKind::PipeClosed);
                break;
            }
        }
    });

    // Stdout drain: bytes → packetizer → MP3 buffer. The packetizer is
    // generation-local, so a restart starts from a clean accumulator.
    let drain = {
        let inner = Arc::clone(inner);
        let first_frame = Arc::clone(&first_frame);
        let last_output = Arc::clone(&last_output);
        let spawn_time = Instant::now();
        tokio::spawn(async move {
            let mut packetizer = Mp3Packetizer::new();
            let mut chunk = vec![0u8; STDOUT_READ_CHUNK];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) | Err(_) => break, // EOF; child.wait() reports it
                    Ok(n) => {
                        for frame in packetizer.feed(&chunk[..n]) {
                            if !first_frame.swap(true, Ordering::SeqCst) {
                                log::info!(
                                    "[Encoder] First MP3 frame after {:?}",
                                    spawn_time.elapsed()
                                );
                                inner.set_state(EncoderState::Running);
                            }
                            *last_output.lock() = Instant::now();
                            inner.mp3_buffer.push(frame);
                        }
                    }
                }
            }
        })
    };

    // Stderr drain: relayed verbatim, bounded per generation.
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut budget = STDERR_LOG_BYTE_LIMIT;
        while let Ok(Some(line)) = lines.next_line().await {
            if budget == 0 {
                continue; // keep draining so the child never blocks on stderr
            }
            budget = budget.saturating_sub(line.len());
            log::info!("[ENCODER] {}", line);
            if budget == 0 {
                log::warn!("[Encoder] Child stderr exceeded log budget; muting");
            }
        }
    });

    // Watchdog: the generation ends on the first of shutdown, reported
    // pipe failure, child exit, startup timeout, or output stall.
    let started = Instant::now();
    let startup_timeout = Duration::from_millis(inner.config.startup_timeout_ms);
    let stall_threshold = Duration::from_millis(inner.config.stall_threshold_ms);

    let failure = loop {
        tokio::select! {
            biased;

            _ = inner.shutdown.cancelled() => break None,

            Some(kind) = fail_rx.recv() => break Some(kind),

            status = child.wait() => {
                match status {
                    Ok(status) => log::warn!("[Encoder] Child exited: {}", status),
                    Err(e) => log::warn!("[Encoder] Child wait failed: {}", e),
                }
                break Some(FailureKind::ChildExited);
            }

            _ = tokio::time::sleep(WATCHDOG_POLL) => {
                if !first_frame.load(Ordering::SeqCst) {
                    if started.elapsed() >= startup_timeout {
                        log::warn!(
                            "[Encoder] No MP3 output within {:?} of spawn",
                            startup_timeout
                        );
                        break Some(FailureKind::StartupTimeout);
                    }
                } else if last_output.lock().elapsed() >= stall_threshold {
                    log::warn!("[Encoder] No MP3 output for {:?}", stall_threshold);
                    break Some(FailureKind::Stalled);
                }
            }
        }
    };

    // Teardown: stop accepting PCM first so the manager's writes become
    // no-ops, then bring the child down and let the drains finish pulling
    // residual output (stderr often carries the diagnostic that matters).
    *inner.pcm_tx.lock() = None;
    writer.abort();
    terminate_child(child).await;
    if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
        log::debug!("[Encoder] Stdout drain still busy at teardown");
    }
    if tokio::time::timeout(DRAIN_GRACE, stderr_task).await.is_err() {
        log::debug!("[Encoder] Stderr drain still busy at teardown");
    }

    GenerationOutcome {
        reached_running: first_frame.load(Ordering::SeqCst),
        failure,
    }
}

async fn fail_immediately(child: Child, reason: &str) -> GenerationOutcome {
    log::error!("[Encoder] {}", reason);
    terminate_child(child).await;
    GenerationOutcome {
        reached_running: false,
        failure: Some(FailureKind::SpawnFailed),
    }
}

/// Brings a child down: SIGTERM, a short grace, then SIGKILL. A child
/// that already exited is just reaped.
async fn terminate_child(mut child: Child) {
    if let Ok(Some(status)) = child.try_wait() {
        log::debug!("[Encoder] Child already exited: {}", status);
        return;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if let Ok(result) = tokio::time::timeout(TERM_GRACE, child.wait()).await {
                if let Ok(status) = result {
                    log::debug!("[Encoder] Child terminated: {}", status);
                }
                return;
            }
            log::warn!("[Encoder] Child ignored SIGTERM; killing");
        }
    }

    let _ = child.kill().await;
    let _ = child.wait().await;
}
