//! Core configuration types.
//!
//! Provides the tower configuration ([`Config`] and its nested groups) with
//! startup validation. Configuration is injected at construction of each
//! component; there is no global mutable state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{TowerError, TowerResult};
use crate::protocol_constants::TICK_INTERVAL_MS;

/// Argument tokens accepted as the encoder's frame-size hint.
///
/// The supervisor refuses to start a child whose argv carries none of these:
/// without a fixed bitrate the first MP3 frame may not appear within the
/// startup timeout and the CBR frame-size derivation breaks.
pub const FRAME_SIZE_HINT_FLAGS: &[&str] = &["-b", "--bitrate"];

/// Configuration for the encoder child process and its supervision.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EncoderConfig {
    /// Skip the child entirely and serve locally generated MP3 frames
    /// (OFFLINE_TEST mode).
    pub disabled: bool,

    /// Argument vector for the encoder child. The first element is the
    /// executable. Must include a frame-size hint (`-b`/`--bitrate`).
    pub argv: Vec<String>,

    /// Deadline for the first MP3 frame after spawn (ms).
    pub startup_timeout_ms: u64,

    /// Longest tolerated gap between MP3 output bursts while running (ms).
    /// Encoders batch several frames per write, so this is generous.
    pub stall_threshold_ms: u64,

    /// Restart backoff series (ms). The last entry saturates.
    pub backoff_schedule_ms: Vec<u64>,

    /// Consecutive failed starts before entering DEGRADED.
    pub max_restarts: u32,

    /// Period of the DEGRADED self-heal retry (minutes).
    pub recovery_retry_minutes: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            argv: default_encoder_argv(),
            startup_timeout_ms: 1500,
            stall_threshold_ms: 2000,
            backoff_schedule_ms: vec![1000, 2000, 4000, 8000, 10000],
            max_restarts: 5,
            recovery_retry_minutes: 10,
        }
    }
}

/// Default encoder invocation: lame reading raw s16le stereo 48kHz from
/// stdin, writing 128 kbps CBR MP3 to stdout, no ID3 tag.
fn default_encoder_argv() -> Vec<String> {
    [
        "lame", "-r", "-s", "48", "--signed", "--bitwidth", "16", "--little-endian", "-b", "128",
        "--cbr", "-t", "-", "-",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

impl EncoderConfig {
    /// Returns whether the argv carries a frame-size hint.
    #[must_use]
    pub fn has_frame_size_hint(&self) -> bool {
        self.argv
            .iter()
            .any(|arg| FRAME_SIZE_HINT_FLAGS.contains(&arg.as_str()))
    }
}

/// Configuration for the fallback PCM source.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FallbackConfig {
    /// Use the tone after the grace period; `false` keeps pure silence.
    pub tone_enabled: bool,

    /// Tone frequency in Hz.
    pub tone_freq_hz: f64,

    /// Optional WAV asset (PCM s16le stereo 48kHz) decoded at startup and
    /// looped gaplessly as the fallback program.
    pub loop_path: Option<PathBuf>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            tone_enabled: true,
            tone_freq_hz: 440.0,
            loop_path: None,
        }
    }
}

/// Configuration for the OnAir Tower.
///
/// All fields have sensible defaults; [`Config::validate`] is the single
/// gate for fatal configuration errors at startup.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    // Server
    /// Port to bind the HTTP server to.
    pub bind_port: u16,

    /// Path of the MP3 streaming endpoint.
    pub stream_path: String,

    // PCM ingress
    /// Local address the PCM ingress listener binds to.
    pub pcm_listen_addr: String,

    /// PCM ingress buffer capacity (frames). 100 frames ≈ 2.4s.
    pub pcm_buffer_capacity: usize,

    // MP3 output
    /// MP3 output buffer capacity (frames). 400 frames ≈ 9.6s.
    pub mp3_buffer_capacity: usize,

    // Timing
    /// Pump and broadcaster period (ms). 24ms is the frame duration at
    /// 48kHz; any other value desynchronizes encode and playout rates.
    pub tick_interval_ms: u64,

    /// Delay after program loss before leaving PROGRAM (ms).
    pub loss_window_ms: u64,

    /// Delay in SILENCE_GRACE before switching to the configured fallback
    /// content (ms). Zero disables grace.
    pub grace_period_ms: u64,

    // Admission
    /// Consecutive valid PCM frames required to enter PROGRAM.
    pub admission_threshold: u32,

    /// Gate admission on signal amplitude as well as frame shape.
    pub silence_gate_enabled: bool,

    /// Peak threshold below which a frame counts as silent (dBFS).
    pub silence_amplitude_threshold_db: f64,

    /// How long input must stay below the threshold before it stops
    /// counting toward admission (ms).
    pub silence_duration_ms: u64,

    // Seams
    /// Apply a one-frame PCM crossfade at fallback↔program transitions.
    pub crossfade_enabled: bool,

    // Broadcast
    /// Slow-client drop threshold (ms). A client that cannot absorb this
    /// much buffered audio is disconnected.
    pub client_timeout_ms: u64,

    /// Fallback source configuration.
    pub fallback: FallbackConfig,

    /// Encoder child configuration.
    pub encoder: EncoderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_port: 8014,
            stream_path: "/stream".to_string(),
            pcm_listen_addr: "127.0.0.1:9600".to_string(),
            pcm_buffer_capacity: 100,
            mp3_buffer_capacity: 400,
            tick_interval_ms: TICK_INTERVAL_MS,
            loss_window_ms: 500,
            grace_period_ms: 1500,
            admission_threshold: 15,
            silence_gate_enabled: false,
            silence_amplitude_threshold_db: -60.0,
            silence_duration_ms: 500,
            crossfade_enabled: false,
            client_timeout_ms: 250,
            fallback: FallbackConfig::default(),
            encoder: EncoderConfig::default(),
        }
    }
}

impl Config {
    /// Validates the configuration, returning a clear diagnostic for the
    /// first fatal problem found.
    pub fn validate(&self) -> TowerResult<()> {
        if self.pcm_buffer_capacity == 0 {
            return Err(TowerError::Configuration(
                "pcm_buffer_capacity must be >= 1".to_string(),
            ));
        }
        if self.mp3_buffer_capacity == 0 {
            return Err(TowerError::Configuration(
                "mp3_buffer_capacity must be >= 1".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(TowerError::Configuration(
                "tick_interval_ms must be >= 1".to_string(),
            ));
        }
        if self.admission_threshold == 0 {
            return Err(TowerError::Configuration(
                "admission_threshold must be >= 1".to_string(),
            ));
        }
        if self.client_timeout_ms == 0 {
            return Err(TowerError::Configuration(
                "client_timeout_ms must be >= 1".to_string(),
            ));
        }
        if !self.stream_path.starts_with('/') {
            return Err(TowerError::Configuration(format!(
                "stream_path must start with '/', got '{}'",
                self.stream_path
            )));
        }
        if self.pcm_listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(TowerError::Configuration(format!(
                "pcm_listen_addr is not a valid socket address: '{}'",
                self.pcm_listen_addr
            )));
        }
        if !self.encoder.disabled {
            if self.encoder.argv.is_empty() {
                return Err(TowerError::Configuration(
                    "encoder.argv must name an executable".to_string(),
                ));
            }
            if !self.encoder.has_frame_size_hint() {
                return Err(TowerError::Configuration(format!(
                    "encoder.argv must include a frame-size hint ({})",
                    FRAME_SIZE_HINT_FLAGS.join(" or ")
                )));
            }
            if self.encoder.backoff_schedule_ms.is_empty() {
                return Err(TowerError::Configuration(
                    "encoder.backoff_schedule_ms must not be empty".to_string(),
                ));
            }
            if self.encoder.startup_timeout_ms == 0 {
                return Err(TowerError::Configuration(
                    "encoder.startup_timeout_ms must be >= 1".to_string(),
                ));
            }
            if self.encoder.stall_threshold_ms == 0 {
                return Err(TowerError::Configuration(
                    "encoder.stall_threshold_ms must be >= 1".to_string(),
                ));
            }
        }
        if self.fallback.tone_enabled
            && !(self.fallback.tone_freq_hz.is_finite() && self.fallback.tone_freq_hz > 0.0)
        {
            return Err(TowerError::Configuration(format!(
                "fallback.tone_freq_hz must be positive, got {}",
                self.fallback.tone_freq_hz
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_pcm_capacity_is_rejected() {
        let config = Config {
            pcm_buffer_capacity: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn argv_without_bitrate_hint_is_rejected() {
        let mut config = Config::default();
        config.encoder.argv = vec!["lame".into(), "-r".into(), "-".into(), "-".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("frame-size hint"));
    }

    #[test]
    fn argv_hint_check_is_skipped_when_disabled() {
        let mut config = Config::default();
        config.encoder.disabled = true;
        config.encoder.argv = vec![];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_argv_carries_the_hint() {
        assert!(EncoderConfig::default().has_frame_size_hint());
    }

    #[test]
    fn bad_listen_addr_is_rejected() {
        let config = Config {
            pcm_listen_addr: "not-an-addr".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_stream_path_is_rejected() {
        let config = Config {
            stream_path: "stream".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
