//! The audio pump: sole real-time metronome.
//!
//! Everything that paces audio in this process is this one loop. It
//! holds an absolute tick schedule, calls the manager's `next_frame`
//! exactly once per tick, and makes no routing decisions of its own.
//! When a tick overruns, the schedule resets to now instead of
//! accumulating debt (a burst of catch-up ticks would shove a burst of
//! PCM at the encoder for no benefit).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::encoder::EncoderManager;
use crate::ingress::PcmIngress;

/// Behind-schedule warnings are rate-limited to once per this interval.
const LATE_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Spawns the pump task ticking every `tick`.
pub fn spawn_pump(
    manager: Arc<EncoderManager>,
    ingress: Arc<PcmIngress>,
    tick: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        log::info!("[Pump] Started ({:?} tick)", tick);
        let mut next_tick = Instant::now();
        let mut last_late_warn: Option<Instant> = None;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            manager.next_frame(&ingress).await;

            next_tick += tick;
            let now = Instant::now();
            if now > next_tick {
                let behind = now - next_tick;
                if last_late_warn.map_or(true, |at| now - at >= LATE_WARN_INTERVAL) {
                    log::warn!("[Pump] Behind schedule by {:?}; resyncing", behind);
                    last_late_warn = Some(now);
                }
                next_tick = now;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(next_tick) => {}
            }
        }
        log::info!("[Pump] Stopped");
    })
}
