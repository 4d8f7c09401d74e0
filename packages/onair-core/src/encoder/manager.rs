//! Single point of coordination for the encoding pipeline.
//!
//! The manager owns the supervisor, the MP3 output buffer, the fallback
//! source and the routing state machine. The pump calls
//! [`EncoderManager::next_frame`] exactly once per tick; the broadcaster
//! calls [`EncoderManager::get_frame`] exactly once per tick. Neither
//! call can fail: every failure below this point has already been
//! downgraded to a mode change.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::buffer::{BufferStats, FrameBuffer, OverflowPolicy};
use crate::error::TowerResult;
use crate::fallback::FallbackSource;
use crate::ingress::PcmIngress;
use crate::mp3;
use crate::pcm;
use crate::state::Config;

use super::router::{AudioRouter, Route, RouterConfig};
use super::supervisor::EncoderSupervisor;
use super::{AudioState, EncoderState, OperationalMode};

/// How long `next_frame` waits for upstream PCM before falling back.
/// Short enough to never threaten the 24ms tick budget.
const PCM_POP_TIMEOUT: Duration = Duration::from_millis(5);

/// Coordinates encoder supervision, PCM routing and MP3 frame delivery.
pub struct EncoderManager {
    /// `None` in OFFLINE_TEST mode: no child process exists and synthetic
    /// MP3 frames are generated locally.
    supervisor: Option<EncoderSupervisor>,
    mp3_buffer: Arc<FrameBuffer>,
    fallback: Mutex<FallbackSource>,
    router: Mutex<AudioRouter>,
    /// Most recent frame handed to the broadcaster; replayed whenever the
    /// buffer runs dry so output never gaps (I6).
    last_frame: Mutex<Option<Bytes>>,
    crossfade_enabled: bool,
}

impl EncoderManager {
    /// Builds the manager and everything it owns.
    ///
    /// # Errors
    /// Fails only on startup problems the configuration gate lets
    /// through, currently an unreadable fallback loop asset.
    pub fn new(config: &Config) -> TowerResult<Self> {
        let mp3_buffer = Arc::new(FrameBuffer::new(
            config.mp3_buffer_capacity,
            OverflowPolicy::DropOldest,
        ));

        let supervisor = if config.encoder.disabled {
            log::warn!("[Manager] Encoder disabled; OFFLINE_TEST mode, no child process");
            None
        } else {
            Some(EncoderSupervisor::new(
                config.encoder.clone(),
                Arc::clone(&mp3_buffer),
            ))
        };

        Ok(Self {
            supervisor,
            mp3_buffer,
            fallback: Mutex::new(FallbackSource::from_config(&config.fallback)?),
            router: Mutex::new(AudioRouter::new(RouterConfig::from(config), Instant::now())),
            last_frame: Mutex::new(None),
            crossfade_enabled: config.crossfade_enabled,
        })
    }

    /// Starts encoder supervision. No-op in OFFLINE_TEST mode.
    pub fn start(&self) -> TowerResult<()> {
        if let Some(supervisor) = &self.supervisor {
            supervisor.start()?;
        }
        Ok(())
    }

    /// Stops the supervisor (child terminated, tasks joined).
    pub async fn stop(&self, timeout: Duration) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.stop(timeout).await;
        }
    }

    /// The pump's single call each tick: pop upstream PCM (short wait),
    /// route it, and feed the encoder exactly once.
    pub async fn next_frame(&self, ingress: &PcmIngress) {
        let pcm = ingress.pop_frame(Some(PCM_POP_TIMEOUT)).await;
        let route = self
            .router
            .lock()
            .route(Instant::now(), pcm, self.encoder_state());

        match route {
            Route::Program { frame, seam } => {
                self.write(self.at_seam(frame, seam));
            }
            Route::Fallback { request, seam } => {
                let frame = self.fallback.lock().next(request);
                self.write(self.at_seam(frame, seam));
            }
        }
    }

    /// The broadcaster's single call each tick.
    ///
    /// Returns `None` only during cold start, before the pipeline has
    /// ever produced an MP3 frame; the broadcaster skips such ticks.
    /// From the first frame onward the chain buffer → cached last frame
    /// → prebuilt silence frame always yields a valid frame.
    pub fn get_frame(&self) -> Option<Bytes> {
        if let Some(frame) = self.mp3_buffer.pop() {
            *self.last_frame.lock() = Some(frame.clone());
            return Some(frame);
        }
        if let Some(frame) = self.last_frame.lock().clone() {
            return Some(frame);
        }
        if self.mp3_buffer.stats().pushed > 0 || self.encoder_failed() {
            return Some(mp3::silence_frame());
        }
        None
    }

    /// Externally observable operational mode.
    #[must_use]
    pub fn mode(&self) -> OperationalMode {
        let Some(supervisor) = &self.supervisor else {
            return OperationalMode::OfflineTest;
        };
        match supervisor.state() {
            EncoderState::Stopped | EncoderState::Starting => OperationalMode::ColdStart,
            EncoderState::Booting => OperationalMode::Booting,
            EncoderState::Running => match self.router.lock().state() {
                AudioState::Program => OperationalMode::LiveInput,
                // Degraded audio state lags the encoder recovery by one
                // tick; report fallback rather than a stale DEGRADED.
                AudioState::SilenceGrace | AudioState::FallbackTone | AudioState::Degraded => {
                    OperationalMode::FallbackOnly
                }
            },
            EncoderState::Restarting => OperationalMode::RestartRecovery,
            EncoderState::Failed => OperationalMode::Degraded,
        }
    }

    /// Current audio routing state.
    #[must_use]
    pub fn audio_state(&self) -> AudioState {
        self.router.lock().state()
    }

    /// MP3 output buffer statistics.
    #[must_use]
    pub fn mp3_stats(&self) -> BufferStats {
        self.mp3_buffer.stats()
    }

    /// Supervision counters; `None` in OFFLINE_TEST mode.
    #[must_use]
    pub fn encoder_stats(&self) -> Option<super::EncoderStats> {
        self.supervisor.as_ref().map(EncoderSupervisor::stats)
    }

    fn encoder_state(&self) -> EncoderState {
        match &self.supervisor {
            Some(supervisor) => supervisor.state(),
            // OFFLINE_TEST: the router behaves as if the encoder were
            // live, so admission and grace still exercise normally.
            None => EncoderState::Running,
        }
    }

    /// DEGRADED serves the prebuilt silence frame even when nothing was
    /// ever encoded: five failed cold-start spawns must still leave the
    /// broadcaster with something to send.
    fn encoder_failed(&self) -> bool {
        self.supervisor
            .as_ref()
            .is_some_and(|supervisor| supervisor.state() == EncoderState::Failed)
    }

    /// Applies the optional one-frame crossfade at source seams.
    fn at_seam(&self, frame: Bytes, seam: bool) -> Bytes {
        if !(seam && self.crossfade_enabled) {
            return frame;
        }
        let mut faded = frame.to_vec();
        pcm::apply_fade_in(&mut faded);
        Bytes::from(faded)
    }

    /// Feeds exactly one frame into the encode path. With a supervisor,
    /// the PCM goes to the child; offline, one locally generated silence
    /// MP3 frame stands in for the encode result, keeping the pump the
    /// sole clock even in OFFLINE_TEST.
    fn write(&self, frame: Bytes) {
        match &self.supervisor {
            Some(supervisor) => supervisor.write_pcm(frame),
            None => {
                self.mp3_buffer.push(mp3::silence_frame());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn mp3_buffer(&self) -> &Arc<FrameBuffer> {
        &self.mp3_buffer
    }
}
