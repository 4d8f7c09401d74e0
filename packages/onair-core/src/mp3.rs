//! MPEG-1 Layer III frame packetizing.
//!
//! The encoder child writes an arbitrary byte stream on stdout; everything
//! downstream (buffer, broadcaster, clients) deals only in complete MP3
//! frames. [`Mp3Packetizer`] is the boundary: a stateful accumulator that
//! locks onto the first valid header, derives the constant CBR frame size
//! from it, and from then on emits exactly `frame_size` bytes per frame.
//!
//! Partial bytes never leave this module.

use std::sync::OnceLock;

use bytes::{Bytes, BytesMut};

use crate::protocol_constants::{MP3_HEADER_BYTES, SILENCE_MP3_FRAME_BYTES};

/// Bitrate table for MPEG-1 Layer III (kbps), indexed by the 4-bit
/// bitrate field. Index 0 is "free format" and 15 is forbidden; both are
/// rejected.
const BITRATE_KBPS: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];

/// Sample-rate table for MPEG-1 (Hz), indexed by the 2-bit field.
/// Index 3 is reserved.
const SAMPLE_RATE_HZ: [u32; 4] = [44_100, 48_000, 32_000, 0];

/// A parsed MPEG-1 Layer III frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub bitrate_bps: u32,
    pub sample_rate_hz: u32,
    pub padding: bool,
}

impl FrameHeader {
    /// Parses four header bytes, requiring MPEG-1 Layer III with a valid
    /// bitrate and sample rate. Returns `None` for anything else (false
    /// syncs included).
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < MP3_HEADER_BYTES {
            return None;
        }
        if bytes[0] != 0xFF || bytes[1] & 0xE0 != 0xE0 {
            return None;
        }

        let version_bits = (bytes[1] >> 3) & 0b11;
        if version_bits != 0b11 {
            return None; // MPEG-2/2.5 or reserved
        }
        let layer_bits = (bytes[1] >> 1) & 0b11;
        if layer_bits != 0b01 {
            return None; // not Layer III
        }

        let bitrate_index = (bytes[2] >> 4) as usize;
        let bitrate_kbps = BITRATE_KBPS[bitrate_index];
        if bitrate_kbps == 0 {
            return None;
        }

        let sample_rate_index = ((bytes[2] >> 2) & 0b11) as usize;
        let sample_rate_hz = SAMPLE_RATE_HZ[sample_rate_index];
        if sample_rate_hz == 0 {
            return None;
        }

        Some(Self {
            bitrate_bps: bitrate_kbps * 1000,
            sample_rate_hz,
            padding: bytes[2] & 0b10 != 0,
        })
    }

    /// Frame length in bytes: `144 * bitrate / sample_rate (+ padding)`.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        (144 * self.bitrate_bps / self.sample_rate_hz) as usize + usize::from(self.padding)
    }
}

/// Stateful byte-stream to MP3-frame parser.
///
/// Feed it stdout chunks in arrival order; it returns the complete frames
/// they close off. Reset it whenever the encoder child restarts: a new
/// child may negotiate a different frame size and the accumulator holds
/// bytes from the dead one.
pub struct Mp3Packetizer {
    acc: BytesMut,
    frame_size: Option<usize>,
}

impl Mp3Packetizer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            acc: BytesMut::new(),
            frame_size: None,
        }
    }

    /// Returns the locked frame size, once the first header has been seen.
    #[must_use]
    pub fn frame_size(&self) -> Option<usize> {
        self.frame_size
    }

    /// Clears all state: accumulator dropped, frame size forgotten.
    pub fn reset(&mut self) {
        self.acc.clear();
        self.frame_size = None;
    }

    /// Consumes a chunk of encoder output and returns every complete
    /// frame it completes, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Bytes> {
        self.acc.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            let frame_size = match self.frame_size {
                Some(size) => size,
                None => match self.lock_frame_size() {
                    Some(size) => size,
                    None => break,
                },
            };

            // Steady state: the head must sit on a valid header. Garbage
            // here means the stream glitched; resync to the next header.
            if self.acc.len() >= MP3_HEADER_BYTES
                && FrameHeader::parse(&self.acc[..MP3_HEADER_BYTES]).is_none()
            {
                if !self.resync() {
                    break;
                }
                continue;
            }

            if self.acc.len() < frame_size {
                break;
            }
            frames.push(self.acc.split_to(frame_size).freeze());
        }

        frames
    }

    /// Scans for the first valid header, discarding junk before it, and
    /// locks the frame size from it. Returns `None` when no complete
    /// valid header is buffered yet.
    fn lock_frame_size(&mut self) -> Option<usize> {
        loop {
            let Some(start) = self.find_sync() else {
                // Pure junk so far; keep at most a trailing 0xFF that may
                // pair with the next chunk's first byte.
                let keep = usize::from(self.acc.last() == Some(&0xFF));
                let drop = self.acc.len() - keep;
                if drop > 0 {
                    log::debug!("[Packetizer] Discarding {} junk bytes (no sync)", drop);
                    let _ = self.acc.split_to(drop);
                }
                return None;
            };
            if start > 0 {
                log::debug!("[Packetizer] Discarding {} bytes before first sync", start);
                let _ = self.acc.split_to(start);
            }
            if self.acc.len() < MP3_HEADER_BYTES {
                return None; // sync found, header not complete yet
            }
            match FrameHeader::parse(&self.acc[..MP3_HEADER_BYTES]) {
                Some(header) => {
                    let size = header.frame_size();
                    log::info!(
                        "[Packetizer] Locked frame size: {} bytes ({} kbps @ {} Hz)",
                        size,
                        header.bitrate_bps / 1000,
                        header.sample_rate_hz
                    );
                    self.frame_size = Some(size);
                    return Some(size);
                }
                None => {
                    // False sync: step past it and keep scanning.
                    let _ = self.acc.split_to(1);
                }
            }
        }
    }

    /// Drops bytes up to the next sync word after position 0. Returns
    /// whether a sync is now at the head.
    fn resync(&mut self) -> bool {
        // Skip the suspect header byte first, then hunt for a sync.
        let _ = self.acc.split_to(1);
        match self.find_sync() {
            Some(start) => {
                log::debug!("[Packetizer] Resync: dropped {} bytes", start + 1);
                if start > 0 {
                    let _ = self.acc.split_to(start);
                }
                true
            }
            None => {
                // No sync anywhere; keep at most one trailing 0xFF that
                // might pair with the next chunk's first byte.
                let keep = usize::from(self.acc.last() == Some(&0xFF));
                let drop = self.acc.len() - keep;
                let _ = self.acc.split_to(drop);
                false
            }
        }
    }

    /// Returns the offset of the first sync word (`0xFF`, then a byte
    /// with its top three bits set), or `None`.
    fn find_sync(&self) -> Option<usize> {
        self.acc
            .windows(2)
            .position(|w| w[0] == 0xFF && w[1] & 0xE0 == 0xE0)
    }
}

impl Default for Mp3Packetizer {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Prebuilt Silence Frame
// ─────────────────────────────────────────────────────────────────────────────

static SILENCE_FRAME: OnceLock<Bytes> = OnceLock::new();

/// Returns the prebuilt silence MP3 frame: one valid 128 kbps CBR frame at
/// 48kHz (384 bytes) whose payload decodes to digital silence.
///
/// Used by OFFLINE_TEST mode and as the last resort of frame delivery when
/// the buffer is empty and no frame was ever cached. Cloning is an Arc
/// bump, so handing it out per tick costs nothing.
#[must_use]
pub fn silence_frame() -> Bytes {
    SILENCE_FRAME
        .get_or_init(|| {
            let mut frame = vec![0u8; SILENCE_MP3_FRAME_BYTES];
            // MPEG-1 Layer III, no CRC, 128 kbps, 48kHz, no padding, stereo.
            frame[0] = 0xFF;
            frame[1] = 0xFB;
            frame[2] = 0x94;
            frame[3] = 0x00;
            Bytes::from(frame)
        })
        .clone()
}
