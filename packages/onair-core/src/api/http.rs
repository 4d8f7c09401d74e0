//! Router construction and the JSON endpoints.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::error::{TowerError, TowerResult};
use crate::protocol_constants::SERVICE_ID;

use super::stream::stream_audio;
use super::AppState;

/// Builds the tower's HTTP surface.
///
/// The streaming path comes from configuration; `/tower/buffer` and
/// `/health` are stable long-term endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(&state.config.stream_path, get(stream_audio))
        .route("/tower/buffer", get(buffer_status))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /tower/buffer` — PCM ingress fill level.
///
/// Stable public interface: `{"fill": n, "capacity": n, "overflow_count": n}`,
/// or `503` with an error body while ingress is not wired.
async fn buffer_status(State(state): State<AppState>) -> TowerResult<Json<Value>> {
    let ingress = state
        .ingress
        .as_ref()
        .ok_or_else(|| TowerError::IngressUnavailable("ingress not wired".to_string()))?;

    let stats = ingress.stats();
    Ok(Json(json!({
        "fill": stats.len,
        "capacity": stats.capacity,
        "overflow_count": stats.dropped,
    })))
}

/// `GET /health` — liveness probe with the current operational mode.
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": SERVICE_ID,
        "version": env!("CARGO_PKG_VERSION"),
        "mode": state.manager.mode(),
        "listeners": state.broadcaster.client_count(),
        "mp3_buffer": state.manager.mp3_stats(),
        "encoder": state.manager.encoder_stats(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::spawn_broadcaster;
    use crate::encoder::EncoderManager;
    use crate::ingress::PcmIngress;
    use crate::state::Config;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    async fn serve(state: AppState) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state);
        let task = tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .await;
        });
        (addr, task)
    }

    async fn get_response(addr: std::net::SocketAddr, path: &str) -> String {
        let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        socket.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        socket.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).to_string()
    }

    fn test_state(with_ingress: bool) -> (AppState, CancellationToken) {
        let mut config = Config::default();
        config.encoder.disabled = true;
        let manager = Arc::new(EncoderManager::new(&config).unwrap());
        let shutdown = CancellationToken::new();
        let (broadcaster, _task) = spawn_broadcaster(
            Arc::clone(&manager),
            Duration::from_millis(24),
            Duration::from_millis(250),
            shutdown.clone(),
        );
        let ingress = with_ingress.then(|| Arc::new(PcmIngress::new(100)));
        (
            AppState::new(manager, ingress, broadcaster, Arc::new(config)),
            shutdown,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn buffer_status_reports_fill_and_capacity() {
        let (state, shutdown) = test_state(true);
        state
            .ingress
            .as_ref()
            .unwrap()
            .push_frame(bytes::Bytes::from(vec![0u8; 4608]));

        let (addr, server) = serve(state).await;
        let response = get_response(addr, "/tower/buffer").await;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"fill\":1"));
        assert!(response.contains("\"capacity\":100"));
        assert!(response.contains("\"overflow_count\":0"));

        server.abort();
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn buffer_status_is_503_without_ingress() {
        let (state, shutdown) = test_state(false);
        let (addr, server) = serve(state).await;
        let response = get_response(addr, "/tower/buffer").await;

        assert!(response.starts_with("HTTP/1.1 503"));
        assert!(response.contains("\"error\""));

        server.abort();
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_reports_mode() {
        let (state, shutdown) = test_state(true);
        let (addr, server) = serve(state).await;
        let response = get_response(addr, "/health").await;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"mode\":\"OFFLINE_TEST\""));
        assert!(response.contains(&format!("\"service\":\"{SERVICE_ID}\"")));

        server.abort();
        shutdown.cancel();
    }
}
