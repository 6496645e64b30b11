//! HTTP endpoints of the relay
//!
//! - `GET /stream`: the live stream, reattached on every state change
//! - `GET /message-stream/{id}`: one message, served from the audio cache
//! - `GET /health`: liveness and what is on air
//! - `GET /events`: client events over SSE, current state first
//! - `GET /api/radio/*`: state, sources, messages, schedule, listeners
//! - `POST /api/control/*`: operator commands

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::error::Error;
use crate::events::RadioEvent;
use crate::models::{Message, SourceKind};
use crate::multiplexer::chunked;
use crate::player::PlaybackOutcome;
use crate::relay::RadioRelay;
use crate::state::BroadcastSnapshot;
use crate::station::SwitchResult;

const DEFAULT_UPCOMING: usize = 20;

/// Error answered as `{ "error": ... }` with a status matching its kind
pub struct AppError(pub Error);

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::UnknownSource(_) | Error::MessageNotFound(_) => StatusCode::NOT_FOUND,
            Error::Rejected(_) => StatusCode::CONFLICT,
            Error::Http(_)
            | Error::Io(_)
            | Error::UpstreamStatus { .. }
            | Error::Extractor { .. }
            | Error::Repository(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), "Request failed: {}", self.0);
        } else {
            debug!(status = status.as_u16(), "Request refused: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, AppError>;

/// Routes of the relay, mounted at the server root
pub fn radio_router(relay: Arc<RadioRelay>) -> Router {
    Router::new()
        .route("/stream", get(live_stream))
        .route("/message-stream/{id}", get(message_stream))
        .route("/health", get(health))
        .route("/events", get(events))
        .route("/api/radio/state", get(radio_state))
        .route("/api/radio/sources", get(radio_sources))
        .route("/api/radio/messages", get(radio_messages))
        .route("/api/radio/schedule", get(radio_schedule))
        .route("/api/radio/listeners", get(radio_listeners))
        .route("/api/control/switch/{key}", post(control_switch))
        .route("/api/control/message", post(control_message))
        .route("/api/control/sequence", post(control_sequence))
        .route("/api/control/resume", post(control_resume))
        .route("/api/control/reconnect", post(control_reconnect))
        .route("/api/control/refresh", post(control_refresh))
        .with_state(relay)
}

fn audio_response(content_type: &str, body: Body) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("audio/mpeg")),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// `GET /stream`
async fn live_stream(State(relay): State<Arc<RadioRelay>>) -> ApiResult<Response> {
    let attachment = relay.multiplexer().attach().await?;
    Ok(audio_response(
        &attachment.content_type,
        Body::from_stream(attachment.body),
    ))
}

/// `GET /message-stream/{id}`
async fn message_stream(
    State(relay): State<Arc<RadioRelay>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let on_air = relay.station().snapshot().message_id() == Some(id.as_str());
    if !on_air && relay.catalog().get(&id).is_none() {
        return Err(Error::MessageNotFound(id).into());
    }
    let bytes = relay.multiplexer().audio_cache().get_or_fetch(&id).await?;
    Ok(audio_response("audio/mpeg", Body::from_stream(chunked(bytes))))
}

/// `GET /health`
async fn health(State(relay): State<Arc<RadioRelay>>) -> impl IntoResponse {
    Json(relay.health())
}

/// `GET /events`
async fn events(
    State(relay): State<Arc<RadioRelay>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before reading the announcement so no change falls between.
    let rx = relay.station().events().subscribe();
    let current = relay.station().announcement();

    let live = BroadcastStream::new(rx).filter_map(|item| async move { item.ok() });
    let stream = stream::once(async move { current })
        .chain(live)
        .map(|event| Ok::<_, Infallible>(to_sse(&event)))
        .take_until(relay.token().clone().cancelled_owned());

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse(event: &RadioEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.payload().to_string())
}

#[derive(Debug, Serialize)]
struct StateView {
    #[serde(flatten)]
    snapshot: BroadcastSnapshot,
    label: String,
    deferred_switch: Option<String>,
    message: Option<Message>,
    listeners: usize,
}

/// `GET /api/radio/state`
async fn radio_state(State(relay): State<Arc<RadioRelay>>) -> impl IntoResponse {
    let station = relay.station();
    Json(StateView {
        snapshot: station.snapshot(),
        label: station.current_label(),
        deferred_switch: station.deferred_switch(),
        message: station.on_air_message(),
        listeners: relay.multiplexer().active_listeners(),
    })
}

#[derive(Debug, Serialize)]
struct SourceView {
    key: String,
    label: String,
    kind: SourceKind,
    uri: String,
    on_air: bool,
}

/// `GET /api/radio/sources`
async fn radio_sources(State(relay): State<Arc<RadioRelay>>) -> impl IntoResponse {
    let snapshot = relay.station().snapshot();
    let sources: Vec<SourceView> = relay
        .station()
        .registry()
        .iter()
        .map(|s| SourceView {
            key: s.key.clone(),
            label: s.label.clone(),
            kind: s.kind,
            uri: s.uri.clone(),
            on_air: snapshot.normal_source() == Some(s.key.as_str()),
        })
        .collect();
    Json(sources)
}

/// `GET /api/radio/messages`
async fn radio_messages(State(relay): State<Arc<RadioRelay>>) -> impl IntoResponse {
    let catalog = relay.catalog();
    Json(serde_json::json!({
        "count": catalog.len(),
        "last_refresh": catalog.last_refresh(),
        "messages": catalog.snapshot().as_ref(),
    }))
}

#[derive(Debug, Deserialize)]
struct ScheduleQuery {
    count: Option<usize>,
}

/// `GET /api/radio/schedule?count=n`
async fn radio_schedule(
    State(relay): State<Arc<RadioRelay>>,
    Query(query): Query<ScheduleQuery>,
) -> impl IntoResponse {
    let now = relay.scheduler().clock().now();
    Json(
        relay
            .scheduler()
            .upcoming(now, query.count.unwrap_or(DEFAULT_UPCOMING)),
    )
}

/// `GET /api/radio/listeners`
async fn radio_listeners(State(relay): State<Arc<RadioRelay>>) -> impl IntoResponse {
    Json(relay.multiplexer().listeners())
}

/// `POST /api/control/switch/{key}`
async fn control_switch(
    State(relay): State<Arc<RadioRelay>>,
    Path(key): Path<String>,
) -> ApiResult<Json<SwitchResult>> {
    Ok(Json(relay.station().switch_source(&key)?))
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct Accepted {
    status: &'static str,
    message: Option<String>,
}

/// `POST /api/control/message?id=...`: one message, random when no id
async fn control_message(
    State(relay): State<Arc<RadioRelay>>,
    Query(query): Query<MessageQuery>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    refuse_during_override(&relay)?;
    let message = match query.id {
        Some(id) => relay
            .catalog()
            .get(&id)
            .ok_or(Error::MessageNotFound(id))?,
        None => relay
            .catalog()
            .random()
            .ok_or_else(|| Error::MessageNotFound("catalog is empty".into()))?,
    };

    let name = message.display_name.clone();
    let player = relay.player().clone();
    let deadline = relay.scheduler().deadline_instant();
    tokio::spawn(async move {
        log_outcome(player.play_one(message, deadline).await);
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            status: "started",
            message: Some(name),
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct SequenceQuery {
    limit: Option<usize>,
    #[serde(default)]
    shuffle: bool,
}

/// `POST /api/control/sequence?limit=n&shuffle=true`
async fn control_sequence(
    State(relay): State<Arc<RadioRelay>>,
    Query(query): Query<SequenceQuery>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    refuse_during_override(&relay)?;
    if relay.catalog().is_empty() {
        return Err(Error::MessageNotFound("catalog is empty".into()).into());
    }

    let player = relay.player().clone();
    let deadline = relay.scheduler().deadline_instant();
    tokio::spawn(async move {
        log_outcome(
            player
                .play_sequence(query.limit, query.shuffle, deadline)
                .await,
        );
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            status: "started",
            message: None,
        }),
    ))
}

fn refuse_during_override(relay: &RadioRelay) -> Result<(), AppError> {
    match relay.station().snapshot().message_id() {
        Some(active) => Err(Error::Rejected(crate::state::TransitionRejected::NestedOverride {
            active: active.to_string(),
        })
        .into()),
        None => Ok(()),
    }
}

fn log_outcome(outcome: PlaybackOutcome) {
    debug!(?outcome, "Operator playback finished");
}

/// `POST /api/control/resume`: ends the message on air
async fn control_resume(State(relay): State<Arc<RadioRelay>>) -> impl IntoResponse {
    Json(serde_json::json!({ "ended": relay.player().force_end() }))
}

/// `POST /api/control/reconnect`: forces every listener to reconnect
async fn control_reconnect(State(relay): State<Arc<RadioRelay>>) -> impl IntoResponse {
    Json(serde_json::json!({ "disconnected": relay.multiplexer().disconnect_all() }))
}

/// `POST /api/control/refresh`: re-lists the message repository now
async fn control_refresh(State(relay): State<Arc<RadioRelay>>) -> ApiResult<Json<serde_json::Value>> {
    let count = relay.catalog().refresh().await?;
    Ok(Json(serde_json::json!({
        "count": count,
        "at": Utc::now(),
    })))
}
