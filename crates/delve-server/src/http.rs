use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use delve_core::{DelveError, FrameStream, ResumeOutcome, StartRunRequest};
use delve_types::EngineEvent;

use crate::AppState;

/// Authenticated principal, set by the fronting auth layer.
pub const PRINCIPAL_HEADER: &str = "x-delve-user-id";
pub const STREAM_ID_HEADER: &str = "x-delve-stream-id";
pub const MESSAGE_ID_HEADER: &str = "x-delve-message-id";

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let reaper = tokio::spawn(crate::run_stream_reaper(state.clone()));
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("delve server listening on {}", addr);
    let result = axum::serve(listener, app).await;
    reaper.abort();
    result?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/global/health", get(global_health))
        .route("/global/event", get(events))
        .route("/provider", get(list_providers))
        .route("/api/deep-search", post(start_deep_search))
        .route("/api/chat/{session_id}/stream", get(resume_stream))
        .route("/api/session", get(list_sessions))
        .route(
            "/api/session/{session_id}",
            get(get_session).patch(rename_session).delete(delete_session),
        )
        .layer(cors)
        .with_state(state)
}

async fn global_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeMs": crate::now_ms().saturating_sub(state.started_at_ms),
    }))
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_bus.subscribe();
    let initial = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&EngineEvent::new("server.connected", json!({}))).unwrap_or_default(),
    )));
    let live = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(event) => serde_json::to_string(&event)
            .ok()
            .map(|payload| Ok(Event::default().data(payload))),
        Err(_) => None,
    });
    Sse::new(initial.chain(live)).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "all": state.providers.list().await }))
}

async fn start_deep_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let principal = match principal(&headers) {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    // Unreadable bodies are reported like missing fields.
    let request = serde_json::from_slice::<StartRunRequest>(&body).unwrap_or_default();
    match state.service.start_run(&principal, request).await {
        Ok(handle) => (
            [
                (STREAM_ID_HEADER, handle.stream_id.clone()),
                (MESSAGE_ID_HEADER, handle.message_id.clone()),
            ],
            frame_events(handle.frames),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResumeQuery {
    cursor: Option<u64>,
}

async fn resume_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ResumeQuery>,
    headers: HeaderMap,
) -> Response {
    let principal = match principal(&headers) {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    let cursor = last_event_id(&headers)
        .map(|seen| seen.saturating_add(1))
        .or(query.cursor)
        .unwrap_or(0);
    match state.service.resume(&principal, &session_id, cursor).await {
        Ok(ResumeOutcome::Streaming { stream_id, frames }) => {
            ([(STREAM_ID_HEADER, stream_id)], frame_events(frames)).into_response()
        }
        Ok(ResumeOutcome::NoActiveStream) => StatusCode::NO_CONTENT.into_response(),
        Err(err @ DelveError::Authorization(_)) => error_response(err),
        Err(err) => {
            tracing::error!(session_id = %session_id, "stream reattach failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn list_sessions(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let principal = match principal(&headers) {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    match state.service.list_sessions(&principal).await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let principal = match principal(&headers) {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    match state.service.get_session(&principal, &session_id).await {
        Ok(session) => Json(session).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct RenameSessionInput {
    title: String,
}

async fn rename_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(input): Json<RenameSessionInput>,
) -> Response {
    let principal = match principal(&headers) {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    match state
        .service
        .rename_session(&principal, &session_id, &input.title)
        .await
    {
        Ok(session) => Json(session).into_response(),
        Err(err) => error_response(err),
    }
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let principal = match principal(&headers) {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    match state.service.delete_session(&principal, &session_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

fn frame_events(frames: FrameStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = frames.map(|frame| {
        Ok(Event::default()
            .id(frame.seq.to_string())
            .data(frame.payload.as_ref()))
    });
    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

fn principal(headers: &HeaderMap) -> Result<String, Response> {
    headers
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Unauthorized" })),
            )
                .into_response()
        })
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn error_response(err: DelveError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match err {
        DelveError::Validation(message) => (StatusCode::BAD_REQUEST, message).into_response(),
        DelveError::Conflict { active_stream_id } => (
            status,
            Json(json!({
                "error": "Session already has an active stream",
                "activeStreamId": active_stream_id,
            })),
        )
            .into_response(),
        other => {
            if status.is_server_error() {
                tracing::error!(code = other.code(), "request failed: {}", other);
            }
            (status, Json(json!({ "error": other.to_string() }))).into_response()
        }
    }
}
