//! Service bootstrap: builds the pipeline and owns its background tasks.
//!
//! Wiring order matters less than shutdown order; see
//! [`BootstrappedServices::shutdown`] for the teardown sequence.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::broadcaster::{spawn_broadcaster, Broadcaster};
use crate::encoder::EncoderManager;
use crate::error::TowerResult;
use crate::ingress::{spawn_listener, PcmIngress};
use crate::pump::spawn_pump;
use crate::state::Config;

/// How long the supervisor gets to terminate the child and join its
/// tasks before shutdown proceeds without it.
const SUPERVISOR_STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct BackgroundTasks {
    pump: JoinHandle<()>,
    broadcast: JoinHandle<()>,
    ingress_accept: JoinHandle<()>,
}

/// The running pipeline: all services constructed and all background
/// tasks spawned.
pub struct BootstrappedServices {
    pub manager: Arc<EncoderManager>,
    pub ingress: Arc<PcmIngress>,
    pub broadcaster: Broadcaster,
    pub config: Arc<Config>,
    shutdown: CancellationToken,
    tasks: Mutex<Option<BackgroundTasks>>,
}

/// Validates configuration, builds every component and starts the
/// pipeline: ingress listener, encoder supervision, pump and broadcaster.
pub async fn bootstrap_services(config: Config) -> TowerResult<BootstrappedServices> {
    config.validate()?;
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();

    let manager = Arc::new(EncoderManager::new(&config)?);
    let ingress = Arc::new(PcmIngress::new(config.pcm_buffer_capacity));

    let (_, ingress_accept) = spawn_listener(
        Arc::clone(&ingress),
        &config.pcm_listen_addr,
        shutdown.clone(),
    )
    .await?;

    manager.start()?;

    let tick = Duration::from_millis(config.tick_interval_ms);
    let pump = spawn_pump(
        Arc::clone(&manager),
        Arc::clone(&ingress),
        tick,
        shutdown.clone(),
    );
    let (broadcaster, broadcast) = spawn_broadcaster(
        Arc::clone(&manager),
        tick,
        Duration::from_millis(config.client_timeout_ms),
        shutdown.clone(),
    );

    log::info!("[Bootstrap] Pipeline started");

    Ok(BootstrappedServices {
        manager,
        ingress,
        broadcaster,
        config,
        shutdown,
        tasks: Mutex::new(Some(BackgroundTasks {
            pump,
            broadcast,
            ingress_accept,
        })),
    })
}

impl BootstrappedServices {
    /// Builds the HTTP API state over the running services.
    #[must_use]
    pub fn app_state(&self) -> AppState {
        AppState::new(
            Arc::clone(&self.manager),
            Some(Arc::clone(&self.ingress)),
            self.broadcaster.clone(),
            Arc::clone(&self.config),
        )
    }

    /// Graceful teardown: stop the pump first (no PCM may leak into a
    /// stopping supervisor), then the broadcaster, then the supervisor
    /// (child TERM → KILL, drains joined), then the ingress listener.
    /// Buffers are released when the struct drops.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Shutting down");
        self.shutdown.cancel();

        let Some(tasks) = self.tasks.lock().take() else {
            return;
        };
        let _ = tasks.pump.await;
        let _ = tasks.broadcast.await;
        self.manager.stop(SUPERVISOR_STOP_TIMEOUT).await;
        let _ = tasks.ingress_accept.await;

        log::info!("[Bootstrap] Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> Config {
        let mut config = Config::default();
        config.encoder.disabled = true;
        config.pcm_listen_addr = "127.0.0.1:0".to_string();
        config
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bootstrap_and_shutdown_round_trip() {
        let services = bootstrap_services(offline_config()).await.unwrap();

        // The pump runs: offline mode produces MP3 frames by itself.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while services.manager.mp3_stats().pushed == 0
            && std::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(services.manager.mp3_stats().pushed > 0);

        services.shutdown().await;
        // Idempotent: a second call is a no-op.
        services.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_config_refuses_to_bootstrap() {
        let mut config = offline_config();
        config.mp3_buffer_capacity = 0;
        assert!(bootstrap_services(config).await.is_err());
    }
}
