//! HTTP API layer.
//!
//! Thin handlers over the pipeline: the streaming endpoint, the ingress
//! status endpoint and a health probe. All business logic lives in the
//! pipeline components; this module only routes and serializes.

use std::sync::Arc;

use thiserror::Error;

use crate::broadcaster::Broadcaster;
use crate::encoder::EncoderManager;
use crate::ingress::PcmIngress;
use crate::state::Config;

pub mod http;
mod stream;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer.
#[derive(Clone)]
pub struct AppState {
    /// Frame source for the streaming and health endpoints.
    pub manager: Arc<EncoderManager>,
    /// PCM ingress stats for the buffer status endpoint. `None` until
    /// ingress is wired; the endpoint answers 503 in that window.
    pub ingress: Option<Arc<PcmIngress>>,
    /// Live MP3 frame feed that HTTP clients subscribe to.
    pub broadcaster: Broadcaster,
    /// Tower configuration (stream path, ports).
    pub config: Arc<Config>,
}

impl AppState {
    /// Builds the API state over running pipeline services.
    #[must_use]
    pub fn new(
        manager: Arc<EncoderManager>,
        ingress: Option<Arc<PcmIngress>>,
        broadcaster: Broadcaster,
        config: Arc<Config>,
    ) -> Self {
        Self {
            manager,
            ingress,
            broadcaster,
            config,
        }
    }
}

/// Starts the HTTP server on the configured port, serving until the
/// process shuts down.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], state.config.bind_port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("[Server] Listening on http://{}", addr);

    let app = http::create_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}
