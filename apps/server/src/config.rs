//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! Every recognised option maps onto the core [`onair_core::Config`];
//! unknown keys are rejected so a typo in an option name fails loudly at
//! startup instead of silently running with a default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Port to bind the HTTP server to.
    /// Override: `ONAIR_BIND_PORT`
    pub bind_port: u16,

    /// Path of the MP3 streaming endpoint.
    pub stream_path: String,

    /// Local address the PCM ingress listener binds to.
    /// Override: `ONAIR_PCM_LISTEN_ADDR`
    pub pcm_listen_addr: String,

    /// PCM ingress buffer capacity (frames).
    pub pcm_buffer_capacity: usize,

    /// MP3 output buffer capacity (frames).
    pub mp3_buffer_capacity: usize,

    /// Pump/broadcaster period (ms).
    pub tick_interval_ms: u64,

    /// Delay before program loss demotes to fallback (ms).
    pub loss_window_ms: u64,

    /// Forced-silence window after cold start or loss (ms).
    pub grace_period_ms: u64,

    /// Consecutive valid PCM frames required for PROGRAM.
    pub admission_threshold: u32,

    /// Gate admission on signal amplitude.
    pub silence_gate_enabled: bool,

    /// Peak threshold for the amplitude gate (dBFS).
    pub silence_amplitude_threshold_db: f64,

    /// Sustained-silence duration before input counts as absent (ms).
    pub silence_duration_ms: u64,

    /// One-frame PCM crossfade at fallback↔program seams.
    pub crossfade_enabled: bool,

    /// Slow-client drop threshold (ms).
    pub client_timeout_ms: u64,

    /// Use the tone (vs. pure silence) after the grace period.
    pub fallback_tone_enabled: bool,

    /// Tone frequency (Hz).
    pub fallback_tone_freq_hz: f64,

    /// Optional WAV asset looped as fallback program.
    pub fallback_loop_path: Option<PathBuf>,

    /// Skip the encoder child entirely (OFFLINE_TEST mode).
    /// Override: `ONAIR_ENCODER_DISABLED`
    pub encoder_disabled: bool,

    /// Encoder child argument vector (executable first). Must carry a
    /// bitrate hint; defaults to a lame CBR invocation.
    pub encoder_argv: Vec<String>,

    /// First-MP3-frame deadline after spawn (ms).
    pub startup_timeout_ms: u64,

    /// Encoder output stall threshold (ms).
    pub stall_threshold_ms: u64,

    /// Restart backoff series (ms).
    pub backoff_schedule_ms: Vec<u64>,

    /// Consecutive failed starts before DEGRADED.
    pub max_restarts: u32,

    /// DEGRADED self-heal retry period (minutes).
    pub recovery_retry_minutes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = onair_core::Config::default();
        Self {
            bind_port: core.bind_port,
            stream_path: core.stream_path,
            pcm_listen_addr: core.pcm_listen_addr,
            pcm_buffer_capacity: core.pcm_buffer_capacity,
            mp3_buffer_capacity: core.mp3_buffer_capacity,
            tick_interval_ms: core.tick_interval_ms,
            loss_window_ms: core.loss_window_ms,
            grace_period_ms: core.grace_period_ms,
            admission_threshold: core.admission_threshold,
            silence_gate_enabled: core.silence_gate_enabled,
            silence_amplitude_threshold_db: core.silence_amplitude_threshold_db,
            silence_duration_ms: core.silence_duration_ms,
            crossfade_enabled: core.crossfade_enabled,
            client_timeout_ms: core.client_timeout_ms,
            fallback_tone_enabled: core.fallback.tone_enabled,
            fallback_tone_freq_hz: core.fallback.tone_freq_hz,
            fallback_loop_path: core.fallback.loop_path,
            encoder_disabled: core.encoder.disabled,
            encoder_argv: core.encoder.argv,
            startup_timeout_ms: core.encoder.startup_timeout_ms,
            stall_threshold_ms: core.encoder.stall_threshold_ms,
            backoff_schedule_ms: core.encoder.backoff_schedule_ms,
            max_restarts: core.encoder.max_restarts,
            recovery_retry_minutes: core.encoder.recovery_retry_minutes,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ONAIR_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }

        if let Ok(val) = std::env::var("ONAIR_PCM_LISTEN_ADDR") {
            self.pcm_listen_addr = val;
        }

        if let Ok(val) = std::env::var("ONAIR_ENCODER_DISABLED") {
            if let Ok(disabled) = val.parse() {
                self.encoder_disabled = disabled;
            }
        }
    }

    /// Converts to onair-core's Config type.
    pub fn to_core_config(&self) -> onair_core::Config {
        onair_core::Config {
            bind_port: self.bind_port,
            stream_path: self.stream_path.clone(),
            pcm_listen_addr: self.pcm_listen_addr.clone(),
            pcm_buffer_capacity: self.pcm_buffer_capacity,
            mp3_buffer_capacity: self.mp3_buffer_capacity,
            tick_interval_ms: self.tick_interval_ms,
            loss_window_ms: self.loss_window_ms,
            grace_period_ms: self.grace_period_ms,
            admission_threshold: self.admission_threshold,
            silence_gate_enabled: self.silence_gate_enabled,
            silence_amplitude_threshold_db: self.silence_amplitude_threshold_db,
            silence_duration_ms: self.silence_duration_ms,
            crossfade_enabled: self.crossfade_enabled,
            client_timeout_ms: self.client_timeout_ms,
            fallback: onair_core::FallbackConfig {
                tone_enabled: self.fallback_tone_enabled,
                tone_freq_hz: self.fallback_tone_freq_hz,
                loop_path: self.fallback_loop_path.clone(),
            },
            encoder: onair_core::EncoderConfig {
                disabled: self.encoder_disabled,
                argv: self.encoder_argv.clone(),
                startup_timeout_ms: self.startup_timeout_ms,
                stall_threshold_ms: self.stall_threshold_ms,
                backoff_schedule_ms: self.backoff_schedule_ms.clone(),
                max_restarts: self.max_restarts,
                recovery_retry_minutes: self.recovery_retry_minutes,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_round_trips_to_valid_core_config() {
        let config = ServerConfig::default();
        assert!(config.to_core_config().validate().is_ok());
    }

    #[test]
    fn yaml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "bind_port: 9000\ngrace_period_ms: 0\nfallback_tone_freq_hz: 1000.0"
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.bind_port, 9000);
        assert_eq!(config.grace_period_ms, 0);
        assert_eq!(config.fallback_tone_freq_hz, 1000.0);
        // Untouched keys keep their defaults.
        assert_eq!(config.admission_threshold, 15);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind_prot: 9000").unwrap();
        assert!(ServerConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(ServerConfig::load(Some(Path::new("/nonexistent/onair.yaml"))).is_err());
    }
}
