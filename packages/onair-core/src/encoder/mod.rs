//! Encoder supervision and operational state.
//!
//! Three layers, separated by ownership:
//!
//! - [`supervisor`]: owns the encoder child process and its pipes; knows
//!   nothing about program vs. fallback.
//! - [`router`]: the pure per-tick routing state machine (admission, loss
//!   window, grace); knows nothing about processes.
//! - [`manager`]: single point of coordination; owns both, plus the MP3
//!   output buffer and the fallback source.

pub mod manager;
pub mod router;
pub mod supervisor;

pub use manager::EncoderManager;
pub use router::{AudioRouter, Route};
pub use supervisor::{EncoderStats, EncoderSupervisor};

use serde::Serialize;

/// Lifecycle of the encoder child, as tracked by the supervisor.
///
/// Internal: components outside this module observe [`OperationalMode`]
/// instead. `EncoderState` only governs whether the child can accept
/// input at all; routing is governed by [`AudioState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    /// No child, no supervision loop.
    Stopped,
    /// Supervision loop launched, child not yet spawned.
    Starting,
    /// Child spawned, first MP3 frame not yet seen.
    Booting,
    /// Child alive and producing frames within the stall threshold.
    Running,
    /// Child lost; waiting out the backoff before the next spawn.
    Restarting,
    /// Consecutive restarts exhausted; periodic self-heal continues.
    Failed,
}

/// Which PCM source feeds the encoder. Authoritative for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioState {
    /// Forced silence after cold start or program loss.
    SilenceGrace,
    /// Configured fallback content (tone or loop) after grace expiry.
    FallbackTone,
    /// Upstream PCM admitted as live program.
    Program,
    /// Encoder failed out; fallback continues without a child to feed.
    Degraded,
}

/// Externally observable mode, derived from encoder and audio state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationalMode {
    ColdStart,
    Booting,
    LiveInput,
    FallbackOnly,
    RestartRecovery,
    OfflineTest,
    Degraded,
}

/// Why an encoder generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The executable could not be spawned at all.
    SpawnFailed,
    /// No MP3 frame within the startup timeout.
    StartupTimeout,
    /// Output stopped for longer than the stall threshold.
    Stalled,
    /// The child exited on its own.
    ChildExited,
    /// A pipe to the child broke mid-write.
    PipeClosed,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SpawnFailed => "spawn failed",
            Self::StartupTimeout => "startup timeout",
            Self::Stalled => "output stalled",
            Self::ChildExited => "child exited",
            Self::PipeClosed => "pipe closed",
        };
        f.write_str(name)
    }
}
