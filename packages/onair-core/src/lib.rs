//! OnAir Core - shared library for OnAir Tower.
//!
//! This crate implements a broadcast-grade audio encoding tower: it
//! accepts raw linear PCM from an upstream program source, encodes it to
//! a continuous MP3 stream through a supervised external encoder child,
//! and broadcasts that stream over HTTP to any number of pull-based
//! listeners. The prime directive is **no dead air**: once started,
//! every listener receives a gap-free, frame-aligned MP3 stream for as
//! long as the process lives, whether the program source is live,
//! silent, disconnected, or has never spoken.
//!
//! # Architecture
//!
//! - [`buffer`]: bounded frame queues with explicit overflow policy
//! - [`ingress`]: framed PCM intake from the upstream producer
//! - [`fallback`]: on-demand silence/tone/loop PCM generation
//! - [`mp3`]: MPEG-1 Layer III packetizing
//! - [`encoder`]: child-process supervision, routing state machine,
//!   frame delivery
//! - [`pump`]: the sole 24ms metronome
//! - [`broadcaster`]: frame fan-out to HTTP listeners
//! - [`api`]: the HTTP surface (stream, status, health)
//! - [`bootstrap`]: wiring and lifecycle

#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod broadcaster;
pub mod buffer;
pub mod encoder;
pub mod error;
pub mod fallback;
pub mod ingress;
pub mod mp3;
pub mod pcm;
pub mod protocol_constants;
pub mod pump;
pub mod state;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, ServerError};
pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use broadcaster::Broadcaster;
pub use buffer::{BufferStats, FrameBuffer, OverflowPolicy, PushResult};
pub use encoder::{
    AudioState, EncoderManager, EncoderState, EncoderStats, EncoderSupervisor, FailureKind,
    OperationalMode,
};
pub use error::{TowerError, TowerResult};
pub use fallback::{FallbackRequest, FallbackSource};
pub use ingress::PcmIngress;
pub use mp3::Mp3Packetizer;
pub use state::{Config, EncoderConfig, FallbackConfig};
