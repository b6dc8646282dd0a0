//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{StatusCode, header},
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::Stream;
use serde::Serialize;

use crate::health::Health;
use crate::service::{BridgeService, HealthSnapshot, Outcome};
use crate::subscribers::Subscriber;
use crate::version::VersionInfo;

pub const SSE_PATH: &str = "/sse";
pub const MESSAGE_PATH: &str = "/message";
pub const HEALTH_PATH: &str = "/health";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BridgeService>,
    pub keep_alive: std::time::Duration,
}

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: Health,
    pub subscribers: usize,
    pub skipped_lines: u64,
    pub version: VersionInfo,
}

impl From<HealthSnapshot> for HealthCheckResponse {
    fn from(snapshot: HealthSnapshot) -> Self {
        Self {
            status: snapshot.status,
            subscribers: snapshot.subscribers,
            skipped_lines: snapshot.skipped_lines,
            version: snapshot.version,
        }
    }
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.service.health().await;
    let code = if snapshot.status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(HealthCheckResponse::from(snapshot)))
}

/// Endpoint event first, then one `message` event per broadcast payload.
fn subscriber_events(subscriber: Subscriber) -> impl Stream<Item = Result<Event, Infallible>> {
    let endpoint = Event::default().event("endpoint").data(MESSAGE_PATH);

    let messages = futures::stream::unfold(subscriber, |mut subscriber| async move {
        let payload = subscriber.recv().await?;
        tracing::debug!(subscriber = %subscriber.id(), bytes = payload.len(), "Streaming message");
        let event = Event::default().event("message").data(&*payload);
        Some((Ok::<_, Infallible>(event), subscriber))
    });

    futures::StreamExt::chain(futures::stream::once(async move { Ok::<_, Infallible>(endpoint) }), messages)
}

async fn sse_stream(State(state): State<AppState>) -> Response {
    let subscriber = match state.service.subscribe() {
        Ok(subscriber) => subscriber,
        Err(e) => {
            tracing::warn!(error = %e, "Rejecting subscriber");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };
    tracing::info!(subscriber = %subscriber.id(), "SSE client connected");

    // The subscriber lives inside the stream; when the client disconnects axum
    // drops the stream and the subscriber unregisters itself.
    let sse = Sse::new(subscriber_events(subscriber))
        .keep_alive(KeepAlive::new().interval(state.keep_alive));

    ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], sse).into_response()
}

async fn submit_message(State(state): State<AppState>, body: Bytes) -> Response {
    match state.service.handle_raw(&body).await {
        Ok(Outcome::Reply(reply)) => (StatusCode::OK, Json(reply)).into_response(),
        Ok(Outcome::Acknowledged) => StatusCode::OK.into_response(),
        Err(failure) => {
            tracing::error!(id = ?failure.id, error = %failure.error, "Error handling message");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(failure.envelope())).into_response()
        }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(SSE_PATH, get(sse_stream))
        .route(MESSAGE_PATH, post(submit_message))
        .route(HEALTH_PATH, get(health_check))
        .with_state(state)
}
