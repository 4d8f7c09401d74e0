//! Per-tick PCM routing state machine.
//!
//! [`AudioRouter`] decides, once per pump tick, whether the encoder is fed
//! upstream program PCM or internally generated fallback. It is pure
//! state-plus-arithmetic: the caller supplies the tick instant, the popped
//! PCM frame (if any) and the current encoder state, and gets back a
//! [`Route`]. No clocks, no sleeps, no I/O — which is also what makes the
//! grace/loss/admission timing directly testable.

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::fallback::FallbackRequest;
use crate::pcm;
use crate::protocol_constants::PCM_FRAME_BYTES;

use super::{AudioState, EncoderState};

/// Timing and admission parameters, copied out of the tower config.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub admission_threshold: u32,
    pub loss_window: Duration,
    pub grace_period: Duration,
    pub silence_gate_enabled: bool,
    pub silence_amplitude_threshold_db: f64,
    pub silence_duration: Duration,
}

impl From<&crate::state::Config> for RouterConfig {
    fn from(config: &crate::state::Config) -> Self {
        Self {
            admission_threshold: config.admission_threshold,
            loss_window: Duration::from_millis(config.loss_window_ms),
            grace_period: Duration::from_millis(config.grace_period_ms),
            silence_gate_enabled: config.silence_gate_enabled,
            silence_amplitude_threshold_db: config.silence_amplitude_threshold_db,
            silence_duration: Duration::from_millis(config.silence_duration_ms),
        }
    }
}

/// The routing decision for one tick.
#[derive(Debug, PartialEq, Eq)]
pub enum Route {
    /// Feed this upstream frame to the encoder as live program.
    Program { frame: Bytes, seam: bool },
    /// Feed generated fallback. `seam` marks the first fallback tick
    /// after program (or vice versa) for the optional crossfade.
    Fallback { request: FallbackRequest, seam: bool },
}

impl Route {
    /// Returns whether this tick routes live program.
    #[must_use]
    pub fn is_program(&self) -> bool {
        matches!(self, Self::Program { .. })
    }
}

/// Routing source identity, for seam detection only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Program,
    Fallback,
}

/// The operational audio state machine.
pub struct AudioRouter {
    config: RouterConfig,
    state: AudioState,
    /// Consecutive valid PCM frames seen (admission counter).
    valid_run: u32,
    /// When PCM went missing while in PROGRAM.
    loss_since: Option<Instant>,
    /// When the current grace period began.
    grace_since: Option<Instant>,
    /// When gated input fell below the amplitude threshold.
    silent_since: Option<Instant>,
    last_source: Option<SourceKind>,
}

impl AudioRouter {
    /// Creates a router in SILENCE_GRACE with the grace clock at `now`
    /// (cold start behaves exactly like program loss).
    #[must_use]
    pub fn new(config: RouterConfig, now: Instant) -> Self {
        Self {
            config,
            state: AudioState::SilenceGrace,
            valid_run: 0,
            loss_since: None,
            grace_since: Some(now),
            silent_since: None,
            last_source: None,
        }
    }

    /// Current audio state.
    #[must_use]
    pub fn state(&self) -> AudioState {
        self.state
    }

    /// Routes one tick.
    pub fn route(&mut self, now: Instant, pcm: Option<Bytes>, encoder: EncoderState) -> Route {
        self.track_encoder(now, encoder);

        let pcm = pcm.and_then(|frame| self.classify(now, frame));

        match pcm {
            Some(frame) => {
                self.loss_since = None;
                self.valid_run = self.valid_run.saturating_add(1);

                let admitted = self.state == AudioState::Program
                    || self.valid_run >= self.config.admission_threshold;
                if admitted && encoder == EncoderState::Running {
                    if self.state != AudioState::Program {
                        log::info!(
                            "[Router] Entering PROGRAM after {} consecutive valid frames",
                            self.valid_run
                        );
                        self.state = AudioState::Program;
                        self.grace_since = None;
                    }
                    return self.emit(SourceKind::Program, frame);
                }
                // Not yet admitted: fallback carries this tick.
            }
            None => {
                self.valid_run = 0;
                self.advance_timers(now);
            }
        }

        let request = if self.state == AudioState::SilenceGrace {
            FallbackRequest::Silence
        } else {
            FallbackRequest::Preferred
        };
        self.emit_fallback(request)
    }

    /// Demotes out of PROGRAM when the encoder can no longer accept
    /// input, and recovers out of DEGRADED when it can again.
    fn track_encoder(&mut self, now: Instant, encoder: EncoderState) {
        match encoder {
            EncoderState::Failed => {
                if self.state != AudioState::Degraded {
                    log::warn!("[Router] Encoder failed; audio degraded");
                    self.state = AudioState::Degraded;
                    self.valid_run = 0;
                    self.loss_since = None;
                    self.grace_since = None;
                }
            }
            EncoderState::Running => {
                if self.state == AudioState::Degraded {
                    log::info!("[Router] Encoder recovered; re-entering silence grace");
                    self.enter_grace(now);
                }
            }
            _ => {
                // Admission restarts at the threshold on every encoder
                // restart; a PROGRAM state cannot outlive its encoder.
                if self.state == AudioState::Program {
                    log::info!("[Router] Encoder restarting; leaving PROGRAM");
                    self.enter_grace(now);
                    self.valid_run = 0;
                }
            }
        }
    }

    /// Applies the optional amplitude gate: a complete frame that has sat
    /// below the threshold for the configured duration counts as absent.
    fn classify(&mut self, now: Instant, frame: Bytes) -> Option<Bytes> {
        if frame.len() != PCM_FRAME_BYTES {
            // Ingress only delivers complete records, but the contract is
            // enforced here too: a malformed frame never reaches the child.
            log::debug!("[Router] Dropping malformed PCM frame ({} bytes)", frame.len());
            return None;
        }
        if !self.config.silence_gate_enabled {
            return Some(frame);
        }

        if pcm::is_below_threshold(&frame, self.config.silence_amplitude_threshold_db) {
            let since = *self.silent_since.get_or_insert(now);
            if now.duration_since(since) >= self.config.silence_duration {
                return None;
            }
        } else {
            self.silent_since = None;
        }
        Some(frame)
    }

    /// Advances the loss and grace timers on a tick without usable PCM.
    fn advance_timers(&mut self, now: Instant) {
        match self.state {
            AudioState::Program => {
                let since = *self.loss_since.get_or_insert(now);
                if now.duration_since(since) >= self.config.loss_window {
                    log::info!(
                        "[Router] Program lost for {:?}; entering silence grace",
                        self.config.loss_window
                    );
                    self.enter_grace(now);
                }
            }
            AudioState::SilenceGrace => {
                let since = self.grace_since.unwrap_or(now);
                if now.duration_since(since) >= self.config.grace_period {
                    log::info!("[Router] Grace period over; fallback content on air");
                    self.state = AudioState::FallbackTone;
                    self.grace_since = None;
                }
            }
            AudioState::FallbackTone | AudioState::Degraded => {}
        }
    }

    fn enter_grace(&mut self, now: Instant) {
        self.state = AudioState::SilenceGrace;
        self.grace_since = Some(now);
        self.loss_since = None;
    }

    fn emit(&mut self, kind: SourceKind, frame: Bytes) -> Route {
        let seam = self.last_source.is_some_and(|last| last != kind);
        self.last_source = Some(kind);
        Route::Program { frame, seam }
    }

    fn emit_fallback(&mut self, request: FallbackRequest) -> Route {
        let seam = self
            .last_source
            .is_some_and(|last| last != SourceKind::Fallback);
        self.last_source = Some(SourceKind::Fallback);
        Route::Fallback { request, seam }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(24);

    fn config() -> RouterConfig {
        RouterConfig {
            admission_threshold: 15,
            loss_window: Duration::from_millis(500),
            grace_period: Duration::from_millis(1500),
            silence_gate_enabled: false,
            silence_amplitude_threshold_db: -60.0,
            silence_duration: Duration::from_millis(500),
        }
    }

    fn pcm_frame() -> Bytes {
        // Non-silent content so gate tests can distinguish it.
        Bytes::from(vec![0x40; PCM_FRAME_BYTES])
    }

    fn silent_frame() -> Bytes {
        Bytes::from(vec![0u8; PCM_FRAME_BYTES])
    }

    #[test]
    fn cold_start_feeds_silence_during_grace() {
        let start = Instant::now();
        let mut router = AudioRouter::new(config(), start);

        let route = router.route(start + TICK, None, EncoderState::Booting);
        assert_eq!(
            route,
            Route::Fallback {
                request: FallbackRequest::Silence,
                seam: false
            }
        );
        assert_eq!(router.state(), AudioState::SilenceGrace);
    }

    #[test]
    fn grace_expires_into_fallback_tone() {
        let start = Instant::now();
        let mut router = AudioRouter::new(config(), start);

        // One millisecond before expiry: still silence.
        let route = router.route(
            start + Duration::from_millis(1499),
            None,
            EncoderState::Running,
        );
        assert!(matches!(
            route,
            Route::Fallback {
                request: FallbackRequest::Silence,
                ..
            }
        ));

        // At expiry: tone.
        let route = router.route(
            start + Duration::from_millis(1500),
            None,
            EncoderState::Running,
        );
        assert!(matches!(
            route,
            Route::Fallback {
                request: FallbackRequest::Preferred,
                ..
            }
        ));
        assert_eq!(router.state(), AudioState::FallbackTone);
    }

    #[test]
    fn zero_grace_period_transitions_immediately() {
        let start = Instant::now();
        let mut router = AudioRouter::new(
            RouterConfig {
                grace_period: Duration::ZERO,
                ..config()
            },
            start,
        );

        let route = router.route(start, None, EncoderState::Running);
        assert!(matches!(
            route,
            Route::Fallback {
                request: FallbackRequest::Preferred,
                ..
            }
        ));
    }

    #[test]
    fn admission_needs_the_full_consecutive_run() {
        let start = Instant::now();
        let mut router = AudioRouter::new(config(), start);

        for i in 0..14 {
            let route = router.route(start + TICK * i, Some(pcm_frame()), EncoderState::Running);
            assert!(!route.is_program(), "tick {i} admitted too early");
        }
        let route = router.route(start + TICK * 14, Some(pcm_frame()), EncoderState::Running);
        assert!(route.is_program());
        assert_eq!(router.state(), AudioState::Program);
    }

    #[test]
    fn a_gap_resets_the_admission_counter() {
        let start = Instant::now();
        let mut router = AudioRouter::new(config(), start);

        for i in 0..10 {
            router.route(start + TICK * i, Some(pcm_frame()), EncoderState::Running);
        }
        router.route(start + TICK * 10, None, EncoderState::Running);
        for i in 11..25 {
            let route = router.route(start + TICK * i, Some(pcm_frame()), EncoderState::Running);
            assert!(!route.is_program(), "tick {i}: counter should have reset");
        }
        let route = router.route(start + TICK * 25, Some(pcm_frame()), EncoderState::Running);
        assert!(route.is_program());
    }

    #[test]
    fn threshold_of_one_admits_the_first_frame() {
        let start = Instant::now();
        let mut router = AudioRouter::new(
            RouterConfig {
                admission_threshold: 1,
                ..config()
            },
            start,
        );

        let route = router.route(start, Some(pcm_frame()), EncoderState::Running);
        assert!(route.is_program());
    }

    #[test]
    fn admission_waits_for_a_running_encoder() {
        let start = Instant::now();
        let mut router = AudioRouter::new(config(), start);

        for i in 0..40 {
            let route = router.route(start + TICK * i, Some(pcm_frame()), EncoderState::Booting);
            assert!(!route.is_program());
        }
        assert_ne!(router.state(), AudioState::Program);
    }

    #[test]
    fn loss_window_boundary_is_exact() {
        let start = Instant::now();
        let mut router = AudioRouter::new(config(), start);
        for i in 0..15 {
            router.route(start + TICK * i, Some(pcm_frame()), EncoderState::Running);
        }
        assert_eq!(router.state(), AudioState::Program);

        let loss_start = start + TICK * 15;
        router.route(loss_start, None, EncoderState::Running);
        assert_eq!(router.state(), AudioState::Program);

        // One millisecond before the window: still PROGRAM.
        router.route(
            loss_start + Duration::from_millis(499),
            None,
            EncoderState::Running,
        );
        assert_eq!(router.state(), AudioState::Program);

        // At exactly the window: demoted.
        router.route(
            loss_start + Duration::from_millis(500),
            None,
            EncoderState::Running,
        );
        assert_eq!(router.state(), AudioState::SilenceGrace);
    }

    #[test]
    fn pcm_return_inside_loss_window_stays_program() {
        let start = Instant::now();
        let mut router = AudioRouter::new(config(), start);
        for i in 0..15 {
            router.route(start + TICK * i, Some(pcm_frame()), EncoderState::Running);
        }

        // Three absent ticks, well inside the window.
        let gap_start = start + TICK * 15;
        for i in 0..3 {
            let route = router.route(gap_start + TICK * i, None, EncoderState::Running);
            assert!(!route.is_program());
            assert_eq!(router.state(), AudioState::Program);
        }

        // PCM returns: routed as program immediately, no re-admission.
        let route = router.route(gap_start + TICK * 3, Some(pcm_frame()), EncoderState::Running);
        assert!(route.is_program());
    }

    #[test]
    fn loss_runs_through_grace_to_tone() {
        let start = Instant::now();
        let mut router = AudioRouter::new(config(), start);
        for i in 0..15 {
            router.route(start + TICK * i, Some(pcm_frame()), EncoderState::Running);
        }

        // Expire the loss window.
        let loss_start = start + TICK * 15;
        router.route(loss_start, None, EncoderState::Running);
        router.route(
            loss_start + Duration::from_millis(500),
            None,
            EncoderState::Running,
        );
        assert_eq!(router.state(), AudioState::SilenceGrace);

        // Expire the grace period.
        let grace_start = loss_start + Duration::from_millis(500);
        router.route(
            grace_start + Duration::from_millis(1500),
            None,
            EncoderState::Running,
        );
        assert_eq!(router.state(), AudioState::FallbackTone);
    }

    #[test]
    fn encoder_restart_demotes_program_and_resets_admission() {
        let start = Instant::now();
        let mut router = AudioRouter::new(config(), start);
        for i in 0..15 {
            router.route(start + TICK * i, Some(pcm_frame()), EncoderState::Running);
        }
        assert_eq!(router.state(), AudioState::Program);

        let route = router.route(start + TICK * 15, Some(pcm_frame()), EncoderState::Restarting);
        assert!(!route.is_program());
        assert_eq!(router.state(), AudioState::SilenceGrace);

        // Back to Running: full threshold required again.
        for i in 16..30 {
            let route = router.route(start + TICK * i, Some(pcm_frame()), EncoderState::Running);
            assert!(!route.is_program(), "tick {i}");
        }
        let route = router.route(start + TICK * 30, Some(pcm_frame()), EncoderState::Running);
        assert!(route.is_program());
    }

    #[test]
    fn failed_encoder_degrades_and_recovery_reenters_grace() {
        let start = Instant::now();
        let mut router = AudioRouter::new(config(), start);

        router.route(start, None, EncoderState::Failed);
        assert_eq!(router.state(), AudioState::Degraded);

        // Fallback content (not forced silence) keeps the chain warm.
        let route = router.route(start + TICK, None, EncoderState::Failed);
        assert!(matches!(
            route,
            Route::Fallback {
                request: FallbackRequest::Preferred,
                ..
            }
        ));

        router.route(start + TICK * 2, None, EncoderState::Running);
        assert_eq!(router.state(), AudioState::SilenceGrace);
    }

    #[test]
    fn amplitude_gate_turns_sustained_silence_into_absence() {
        let start = Instant::now();
        let mut router = AudioRouter::new(
            RouterConfig {
                silence_gate_enabled: true,
                admission_threshold: 1,
                ..config()
            },
            start,
        );

        // Loud input admits immediately.
        let route = router.route(start, Some(pcm_frame()), EncoderState::Running);
        assert!(route.is_program());

        // Silent input inside silence_duration still counts as present.
        let silent_start = start + TICK;
        let route = router.route(silent_start, Some(silent_frame()), EncoderState::Running);
        assert!(route.is_program());

        // After silence_duration, silent frames read as "no input": the
        // loss window starts and eventually demotes.
        let beyond = silent_start + Duration::from_millis(500);
        let route = router.route(beyond, Some(silent_frame()), EncoderState::Running);
        assert!(!route.is_program());
        assert_eq!(router.state(), AudioState::Program); // loss window open

        let route = router.route(
            beyond + Duration::from_millis(500),
            Some(silent_frame()),
            EncoderState::Running,
        );
        assert!(!route.is_program());
        assert_eq!(router.state(), AudioState::SilenceGrace);
    }

    #[test]
    fn malformed_frames_never_route_as_program() {
        let start = Instant::now();
        let mut router = AudioRouter::new(
            RouterConfig {
                admission_threshold: 1,
                ..config()
            },
            start,
        );
        let short = Bytes::from(vec![0x40; 100]);
        let route = router.route(start, Some(short), EncoderState::Running);
        assert!(!route.is_program());
    }

    #[test]
    fn seams_are_flagged_on_source_changes() {
        let start = Instant::now();
        let mut router = AudioRouter::new(
            RouterConfig {
                admission_threshold: 1,
                ..config()
            },
            start,
        );

        // First ever route: no seam.
        let route = router.route(start, None, EncoderState::Running);
        assert!(matches!(route, Route::Fallback { seam: false, .. }));

        // Fallback → program: seam.
        let route = router.route(start + TICK, Some(pcm_frame()), EncoderState::Running);
        assert!(matches!(route, Route::Program { seam: true, .. }));

        // Program → program: no seam.
        let route = router.route(start + TICK * 2, Some(pcm_frame()), EncoderState::Running);
        assert!(matches!(route, Route::Program { seam: false, .. }));

        // Program → fallback: seam.
        let route = router.route(start + TICK * 3, None, EncoderState::Running);
        assert!(matches!(route, Route::Fallback { seam: true, .. }));
    }
}
