//! The MP3 streaming handler.
//!
//! Separated from the JSON handlers because of its distinct concerns:
//! chunked audio response, per-client delivery tracking and slow-client
//! teardown. The handler never refuses a connection while the service is
//! up; what the listener hears (program, tone, silence) is decided
//! upstream by the encoder manager.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{connect_info::ConnectInfo, State};
use axum::http::header;
use axum::response::Response;
use futures::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::broadcaster::DeliveryGuard;
use crate::error::{TowerError, TowerResult};
use crate::protocol_constants::APP_NAME;

use super::AppState;

pub(super) async fn stream_audio(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> TowerResult<Response> {
    let rx = state.broadcaster.subscribe();
    let guard = Arc::new(DeliveryGuard::new(remote_addr.ip()));

    let body_stream = BroadcastStream::new(rx).map(move |result| match result {
        Ok(frame) => {
            guard.record_frame(frame.len());
            Ok::<_, std::io::Error>(frame)
        }
        Err(BroadcastStreamRecvError::Lagged(n)) => {
            // The client fell a full timeout's worth of frames behind;
            // ending the body closes its connection.
            let message = format!("client lagged by {} frames", n);
            guard.record_error(&message);
            Err(std::io::Error::other(message))
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("icy-name", APP_NAME)
        .body(Body::from_stream(body_stream))
        .map_err(|e| TowerError::Internal(e.to_string()))
}
