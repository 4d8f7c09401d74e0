//! Fixed wire-format constants that should NOT be changed.
//!
//! These values are pinned by the PCM ingress contract and the MPEG-1
//! Layer III frame structure; changing them breaks interoperability with
//! the upstream producer and the encoder child.

// ─────────────────────────────────────────────────────────────────────────────
// PCM Wire Format
// ─────────────────────────────────────────────────────────────────────────────

/// Sample rate of all PCM entering or leaving the tower (Hz).
///
/// 48kHz is the broadcast standard and the only rate the encoder child
/// is configured for.
pub const SAMPLE_RATE: u32 = 48_000;

/// Number of interleaved channels (stereo).
pub const CHANNELS: u16 = 2;

/// Bytes per sample (16-bit signed little-endian).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Samples per channel in one PCM frame.
///
/// 1152 matches the MPEG-1 Layer III granule pair, so one PCM frame
/// encodes to exactly one MP3 frame.
pub const SAMPLES_PER_FRAME: usize = 1152;

/// Size of one PCM frame on the wire: 1152 samples × 2 channels × 2 bytes.
pub const PCM_FRAME_BYTES: usize = SAMPLES_PER_FRAME * CHANNELS as usize * BYTES_PER_SAMPLE;

/// Duration of one PCM frame in milliseconds: 1152 / 48000 = 24 ms exactly.
///
/// This is the tower's metronome period. Some older operator notes quote
/// 21.333 ms; that figure is wrong for 1152-sample frames at 48kHz.
pub const TICK_INTERVAL_MS: u64 = 24;

// ─────────────────────────────────────────────────────────────────────────────
// MPEG-1 Layer III
// ─────────────────────────────────────────────────────────────────────────────

/// Minimum bytes needed to parse an MP3 frame header.
pub const MP3_HEADER_BYTES: usize = 4;

/// Frame size of the prebuilt silence MP3 frame (128 kbps CBR at 48kHz,
/// no padding): 144 × 128000 / 48000 = 384 bytes.
pub const SILENCE_MP3_FRAME_BYTES: usize = 384;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Application name used in protocol data (ICY headers, health endpoint).
pub const APP_NAME: &str = "OnAir Tower";

/// Service identifier reported by the health endpoint.
pub const SERVICE_ID: &str = "onair-tower";

// ─────────────────────────────────────────────────────────────────────────────
// Channel Capacities
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity of the supervisor's PCM write channel (frames).
///
/// A few frames of slack: the pump produces one frame per tick and the
/// stdin writer drains continuously, so anything deeper only hides a
/// wedged child.
pub const PCM_WRITE_CHANNEL_CAPACITY: usize = 4;

/// Bytes read from the encoder's stdout per drain iteration.
pub const STDOUT_READ_CHUNK: usize = 8192;

/// Upper bound on bytes of child stderr relayed to the log per encoder
/// generation, to keep a looping child from growing the log without bound.
pub const STDERR_LOG_BYTE_LIMIT: usize = 64 * 1024;
