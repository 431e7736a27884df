use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::models::{Identity, NewRequest, QueueEntry, Request};
use crate::radio::{HistoryPage, ListenerReport, Station, SubmitOutcome};
use crate::services::events::NowPlaying;
use crate::services::listeners::ListenerInfo;
use crate::services::queue::BufferedTrack;

pub fn router(station: Station) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/stream", get(stream))
        .route("/events", get(events))
        .route("/listeners", get(listeners))
        .route("/listeners/tune-out", post(tune_out))
        .route("/listeners/identity", post(change_identity))
        .route("/song/current", get(current_song))
        .route("/song/next", get(next_song))
        .route("/song/history", get(history))
        .route("/song/submit", post(submit))
        .route("/admin/listeners", get(admin_listeners))
        .route("/admin/queue/user", get(admin_requests).post(admin_replace_requests))
        .route("/admin/queue/suggestion", get(admin_suggestions).post(admin_replace_suggestions))
        .route("/admin/queue/audio", get(admin_buffer).post(admin_reorder_buffer))
        .route("/admin/skip", post(admin_skip))
        .with_state(station)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    playing: bool,
    downloading: bool,
    listeners: usize,
}

async fn health(State(station): State<Station>) -> Json<Health> {
    Json(Health {
        status: "ok",
        playing: station.is_playing(),
        downloading: station.is_downloading(),
        listeners: station.listener_counts().total,
    })
}

#[derive(Deserialize)]
struct StreamParams {
    handle: Option<String>,
}

async fn stream(State(station): State<Station>, Query(params): Query<StreamParams>) -> Result<Response> {
    let identity = match params.handle.as_deref() {
        Some(handle) => Identity::from_handle(handle).ok_or_else(|| AppError::BadRequest("invalid handle".into()))?,
        None => Identity::anonymous(),
    };

    let (id, chunks) = station.connect(identity.clone());
    info!("Listener {} connected as {}", id, identity);

    Ok((
        [
            (header::CONTENT_TYPE, "audio/mpeg"),
            (header::CACHE_CONTROL, "no-cache, no-store"),
        ],
        Body::from_stream(chunks),
    )
        .into_response())
}

async fn events(State(station): State<Station>) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(station.subscribe()).filter_map(|received| match received {
        Ok(event) => match Event::default().event(event.name()).json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                warn!("Could not encode {} event: {}", event.name(), e);
                None
            }
        },
        Err(e) => {
            debug!("Event subscriber lagged: {}", e);
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn listeners(State(station): State<Station>) -> Json<ListenerReport> {
    Json(station.listener_report())
}

#[derive(Deserialize)]
struct TuneOut {
    handle: String,
}

#[derive(Serialize)]
struct Affected {
    connections: usize,
}

async fn tune_out(State(station): State<Station>, Json(body): Json<TuneOut>) -> Result<Json<Affected>> {
    let identity = parse_handle(&body.handle)?;
    let connections = station.tune_out(&identity);
    Ok(Json(Affected { connections }))
}

#[derive(Deserialize)]
struct IdentityChange {
    old_handle: String,
    new_handle: String,
}

async fn change_identity(State(station): State<Station>, Json(body): Json<IdentityChange>) -> Result<Json<Affected>> {
    let old = parse_handle(&body.old_handle)?;
    let new = parse_handle(&body.new_handle)?;
    let connections = station.change_identity(&old, new);
    Ok(Json(Affected { connections }))
}

async fn current_song(State(station): State<Station>) -> Json<Option<NowPlaying>> {
    Json(station.now_playing())
}

async fn next_song(State(station): State<Station>) -> Json<Option<BufferedTrack>> {
    Json(station.next_up())
}

#[derive(Deserialize)]
struct HistoryParams {
    page: Option<usize>,
}

async fn history(State(station): State<Station>, Query(params): Query<HistoryParams>) -> Result<Json<HistoryPage>> {
    Ok(Json(station.history(params.page.unwrap_or(1)).await?))
}

#[derive(Deserialize)]
struct Submission {
    query: String,
    handle: String,
}

async fn submit(State(station): State<Station>, Json(body): Json<Submission>) -> Result<(StatusCode, Json<SubmitOutcome>)> {
    let identity = parse_handle(&body.handle)?;
    if identity.is_anonymous() {
        return Err(AppError::Unauthorized);
    }

    let outcome = station.submit(&body.query, identity.handle()).await?;
    Ok((submit_status(&outcome), Json(outcome)))
}

fn submit_status(outcome: &SubmitOutcome) -> StatusCode {
    match outcome {
        SubmitOutcome::Queued { .. } => StatusCode::CREATED,
        SubmitOutcome::SearchResults { .. } => StatusCode::OK,
        SubmitOutcome::InvalidQuery => StatusCode::BAD_REQUEST,
        SubmitOutcome::NotFound => StatusCode::NOT_FOUND,
        SubmitOutcome::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        SubmitOutcome::QueueFull | SubmitOutcome::AlreadyQueued | SubmitOutcome::PlayedTooRecently => {
            StatusCode::CONFLICT
        }
    }
}

fn parse_handle(handle: &str) -> Result<Identity> {
    Identity::from_handle(handle).ok_or_else(|| AppError::BadRequest("invalid handle".into()))
}

/// Bearer token check. Admin routes are closed when no token is configured.
fn authorize(station: &Station, headers: &HeaderMap) -> Result<()> {
    let Some(expected) = station.config().admin_token.as_deref() else {
        return Err(AppError::Unauthorized);
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => Ok(()),
        _ => {
            warn!("Rejected admin call with missing or wrong token");
            Err(AppError::Unauthorized)
        }
    }
}

async fn admin_listeners(State(station): State<Station>, headers: HeaderMap) -> Result<Json<Vec<ListenerInfo>>> {
    authorize(&station, &headers)?;
    Ok(Json(station.listener_list()))
}

async fn admin_requests(State(station): State<Station>, headers: HeaderMap) -> Result<Json<Vec<Request>>> {
    authorize(&station, &headers)?;
    Ok(Json(station.queue_snapshot().await?.requests))
}

async fn admin_replace_requests(
    State(station): State<Station>,
    headers: HeaderMap,
    Json(requests): Json<Vec<NewRequest>>,
) -> Result<StatusCode> {
    authorize(&station, &headers)?;
    station.replace_requests(requests).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn admin_suggestions(State(station): State<Station>, headers: HeaderMap) -> Result<Json<Vec<QueueEntry>>> {
    authorize(&station, &headers)?;
    Ok(Json(station.queue_snapshot().await?.suggestions))
}

#[derive(Serialize)]
struct Replaced {
    kept: usize,
}

async fn admin_replace_suggestions(
    State(station): State<Station>,
    headers: HeaderMap,
    Json(track_ids): Json<Vec<String>>,
) -> Result<Json<Replaced>> {
    authorize(&station, &headers)?;
    let kept = station.replace_suggestions(track_ids);
    Ok(Json(Replaced { kept }))
}

async fn admin_buffer(State(station): State<Station>, headers: HeaderMap) -> Result<Json<Vec<BufferedTrack>>> {
    authorize(&station, &headers)?;
    Ok(Json(station.queue_snapshot().await?.buffer))
}

#[derive(Serialize)]
struct Reordered {
    removed: usize,
}

async fn admin_reorder_buffer(
    State(station): State<Station>,
    headers: HeaderMap,
    Json(track_ids): Json<Vec<String>>,
) -> Result<Json<Reordered>> {
    authorize(&station, &headers)?;
    let removed = station.reorder_buffer(track_ids).await;
    Ok(Json(Reordered { removed }))
}

#[derive(Serialize)]
struct Skipped {
    skipped: bool,
}

async fn admin_skip(State(station): State<Station>, headers: HeaderMap) -> Result<Json<Skipped>> {
    authorize(&station, &headers)?;
    Ok(Json(Skipped { skipped: station.skip() }))
}
