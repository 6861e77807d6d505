//! HTTP transport: JSON-over-HTTP appends and SSE subscriptions.
//!
//! Only available with the `server` feature. The transport is a thin
//! mapping onto the core:
//!
//! - `POST /agents/<path>` with an `EventInput` body appends one event and
//!   responds `{"offset": "<offset>"}`. Malformed JSON is a 400; storage
//!   failure is a 500.
//! - `GET /agents/<path>?offset=<o>&live=sse` streams the log as
//!   Server-Sent Events forever (historical tail, then live). Without
//!   `live=sse` it returns the historical prefix as a JSON array and
//!   closes. `offset` is an exclusive lower bound: `-1` (the default) means
//!   everything, `now` means only subsequent events.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;

use crate::agentstream::config::RuntimeConfig;
use crate::agentstream::event::EventInput;
use crate::agentstream::manager::StreamManager;
use crate::agentstream::offset::Offset;
use crate::agentstream::storage::ReadRange;

#[derive(Deserialize, Default)]
struct SubscribeQuery {
    offset: Option<String>,
    live: Option<String>,
}

/// Build the transport router over a stream manager.
pub fn router(manager: Arc<StreamManager>) -> Router {
    Router::new()
        .route("/agents/{*path}", post(append_event).get(read_or_subscribe))
        .with_state(manager)
}

/// Bind and serve until the process stops.
pub async fn serve(
    manager: Arc<StreamManager>,
    config: &RuntimeConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    log::info!("agentstream listening on port {}", config.port);
    axum::serve(listener, router(manager)).await?;
    Ok(())
}

async fn append_event(
    State(manager): State<Arc<StreamManager>>,
    Path(path): Path<String>,
    Json(input): Json<EventInput>,
) -> impl IntoResponse {
    let stream = manager.open(&path).await;
    match stream.append(input).await {
        Ok(event) => (
            StatusCode::OK,
            Json(json!({ "offset": event.offset.to_string() })),
        ),
        Err(e) => {
            log::error!("append to '{}' failed: {}", path, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn read_or_subscribe(
    State(manager): State<Arc<StreamManager>>,
    Path(path): Path<String>,
    Query(query): Query<SubscribeQuery>,
) -> axum::response::Response {
    let stream = manager.open(&path).await;

    let from = match query.offset.as_deref() {
        None | Some("-1") | Some("") => None,
        Some("now") => match stream.read(ReadRange::default()).await {
            Ok(events) => events.last().map(|e| e.offset),
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": e.to_string() })),
                )
                    .into_response()
            }
        },
        Some(other) => match Offset::parse_lower_bound(other) {
            Ok(from) => from,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": e.to_string() })),
                )
                    .into_response()
            }
        },
    };

    if query.live.as_deref() == Some("sse") {
        match stream.subscribe(from).await {
            Ok(subscription) => Sse::new(sse_frames(subscription.into_stream()))
                .keep_alive(KeepAlive::default())
                .into_response(),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response(),
        }
    } else {
        match stream.read(ReadRange::after(from)).await {
            Ok(events) => (StatusCode::OK, Json(events)).into_response(),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response(),
        }
    }
}

fn sse_frames(
    events: impl Stream<Item = Result<crate::agentstream::event::Event, crate::agentstream::error::StreamError>>
        + Send
        + 'static,
) -> impl Stream<Item = Result<SseEvent, Infallible>> + Send + 'static {
    events.filter_map(|item| async move {
        match item {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(data) => Some(Ok(SseEvent::default().data(data))),
                Err(e) => {
                    log::error!("failed to serialize event for SSE: {}", e);
                    None
                }
            },
            // A backpressure drop ends the SSE stream; the client
            // reconnects from its last seen offset.
            Err(e) => {
                log::warn!("sse subscription ended: {}", e);
                None
            }
        }
    })
}
