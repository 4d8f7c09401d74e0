//! On-demand fallback PCM generation.
//!
//! The fallback source is a pure per-call generator: no clock, no thread,
//! no internal pacing. The pump asks for exactly one frame when it needs
//! one, and the only state carried between calls is the tone's phase
//! accumulator and the loop's playback index.
//!
//! Sources in priority order: a pre-decoded loop asset (when configured),
//! the tone, and cached silence. Which one answers a given call is the
//! encoder manager's decision, communicated via [`FallbackRequest`].

use std::path::Path;

use bytes::Bytes;

use crate::error::{TowerError, TowerResult};
use crate::protocol_constants::{
    CHANNELS, PCM_FRAME_BYTES, SAMPLES_PER_FRAME, SAMPLE_RATE,
};
use crate::state::FallbackConfig;

/// Tone amplitude: ~25% of full scale (≈ -12 dBFS), loud enough to be
/// obvious on air and bounded well below clipping.
const TONE_AMPLITUDE: f64 = 0.25 * i16::MAX as f64;

/// What the manager wants from this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackRequest {
    /// Forced silence (grace period).
    Silence,
    /// The configured fallback content: loop, then tone, then silence.
    Preferred,
}

/// A looped PCM asset decoded at startup.
///
/// The playback index wraps modulo the decoded sample count, so the loop
/// seam is sample-accurate: no silence is ever inserted and a frame may
/// straddle the wrap point.
#[derive(Debug)]
struct DecodedLoop {
    /// Interleaved stereo samples.
    samples: Vec<i16>,
    /// Next interleaved sample index to play.
    position: usize,
}

impl DecodedLoop {
    fn next_frame(&mut self) -> Bytes {
        let needed = SAMPLES_PER_FRAME * CHANNELS as usize;
        let mut out = Vec::with_capacity(needed);
        for _ in 0..needed {
            out.push(self.samples[self.position]);
            self.position = (self.position + 1) % self.samples.len();
        }
        Bytes::copy_from_slice(bytemuck::cast_slice(&out))
    }
}

/// Generates one valid 4608-byte PCM frame per call; never fails.
#[derive(Debug)]
pub struct FallbackSource {
    /// Pre-allocated zero frame, cloned (Arc bump) per silence call.
    silence: Bytes,
    tone_enabled: bool,
    /// Phase step per sample: 2π·f / 48000.
    phase_step: f64,
    /// Persistent phase accumulator, wrapped mod 2π so successive frames
    /// join without clicks.
    phase: f64,
    looped: Option<DecodedLoop>,
}

impl FallbackSource {
    /// Builds the source from configuration, decoding the loop asset if
    /// one is configured.
    ///
    /// # Errors
    /// Returns [`TowerError::FallbackAsset`] when the configured loop
    /// file is missing or not PCM s16le stereo 48kHz.
    pub fn from_config(config: &FallbackConfig) -> TowerResult<Self> {
        let looped = match &config.loop_path {
            Some(path) => Some(DecodedLoop {
                samples: decode_wav_file(path)?,
                position: 0,
            }),
            None => None,
        };

        if let Some(ref decoded) = looped {
            log::info!(
                "[Fallback] Loop asset loaded: {} samples ({:.1}s)",
                decoded.samples.len(),
                decoded.samples.len() as f64 / (SAMPLE_RATE as f64 * CHANNELS as f64)
            );
        }

        Ok(Self {
            silence: Bytes::from(vec![0u8; PCM_FRAME_BYTES]),
            tone_enabled: config.tone_enabled,
            phase_step: std::f64::consts::TAU * config.tone_freq_hz / f64::from(SAMPLE_RATE),
            phase: 0.0,
            looped,
        })
    }

    /// Returns exactly one PCM frame. Never fails, never blocks.
    pub fn next(&mut self, request: FallbackRequest) -> Bytes {
        match request {
            FallbackRequest::Silence => self.silence.clone(),
            FallbackRequest::Preferred => {
                if let Some(ref mut looped) = self.looped {
                    looped.next_frame()
                } else if self.tone_enabled {
                    self.tone_frame()
                } else {
                    self.silence.clone()
                }
            }
        }
    }

    fn tone_frame(&mut self) -> Bytes {
        let mut samples = Vec::with_capacity(SAMPLES_PER_FRAME * CHANNELS as usize);
        for _ in 0..SAMPLES_PER_FRAME {
            let value = (self.phase.sin() * TONE_AMPLITUDE) as i16;
            // Same value on both channels.
            samples.push(value);
            samples.push(value);
            self.phase = (self.phase + self.phase_step) % std::f64::consts::TAU;
        }
        Bytes::copy_from_slice(bytemuck::cast_slice(&samples))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WAV Decoding
// ─────────────────────────────────────────────────────────────────────────────

fn decode_wav_file(path: &Path) -> TowerResult<Vec<i16>> {
    let data = std::fs::read(path).map_err(|e| {
        TowerError::FallbackAsset(format!("cannot read {}: {}", path.display(), e))
    })?;
    decode_wav(&data)
        .map_err(|e| TowerError::FallbackAsset(format!("{}: {}", path.display(), e)))
}

/// Decodes a WAV file into interleaved stereo s16le samples.
///
/// Accepts only the format the rest of the pipeline speaks: PCM, 2
/// channels, 48kHz, 16-bit. Chunks other than `fmt ` and `data` are
/// skipped (LIST/INFO blocks are common in edited assets).
fn decode_wav(data: &[u8]) -> Result<Vec<i16>, String> {
    if data.len() < 12 || &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
        return Err("not a RIFF/WAVE file".to_string());
    }

    let mut offset = 12;
    let mut format_ok = false;
    let mut pcm_data: Option<&[u8]> = None;

    while offset + 8 <= data.len() {
        let chunk_id = &data[offset..offset + 4];
        let chunk_len = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]) as usize;
        let body_start = offset + 8;
        let body_end = body_start.checked_add(chunk_len).ok_or("chunk overflow")?;
        if body_end > data.len() {
            return Err("truncated chunk".to_string());
        }
        let body = &data[body_start..body_end];

        match chunk_id {
            b"fmt " => {
                if body.len() < 16 {
                    return Err("fmt chunk too short".to_string());
                }
                let audio_format = u16::from_le_bytes([body[0], body[1]]);
                let channels = u16::from_le_bytes([body[2], body[3]]);
                let sample_rate = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
                let bits = u16::from_le_bytes([body[14], body[15]]);

                if audio_format != 1 {
                    return Err(format!("unsupported WAV format {} (want PCM)", audio_format));
                }
                if channels != CHANNELS {
                    return Err(format!("need {} channels, got {}", CHANNELS, channels));
                }
                if sample_rate != SAMPLE_RATE {
                    return Err(format!("need {}Hz, got {}Hz", SAMPLE_RATE, sample_rate));
                }
                if bits != 16 {
                    return Err(format!("need 16-bit samples, got {}-bit", bits));
                }
                format_ok = true;
            }
            b"data" => pcm_data = Some(body),
            _ => {}
        }

        // Chunks are word-aligned; odd sizes carry a pad byte.
        offset = body_end + (chunk_len & 1);
    }

    if !format_ok {
        return Err("missing fmt chunk".to_string());
    }
    let body = pcm_data.ok_or("missing data chunk")?;
    if body.is_empty() {
        return Err("empty data chunk".to_string());
    }

    let samples: Vec<i16> = body
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(samples)
}
