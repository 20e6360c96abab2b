//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to services. Session resolution
//! happens here (signed cookie), so services only ever see session ids.

use std::collections::HashMap;
use std::convert::Infallible;
use std::path::Path as FsPath;
use std::sync::Arc;

use async_stream::stream;
use axum::{
    extract::{Form, Query, State},
    http::{header, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::SignedCookieJar;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;

use crate::api::response::{api_error, api_ok, api_success};
use crate::api::session::{clear_session, ensure_session, touch_session};
use crate::api::AppState;
use crate::error::{PartymicError, PartymicResult};

/// Minimal landing page; the real UI is served by the out-of-scope asset
/// pipeline in production deployments.
const LANDING_HTML: &str = concat!(
    "<!DOCTYPE html><html><head><meta charset=\"utf-8\">",
    "<title>Partymic</title></head>",
    "<body><h1>Partymic</h1>",
    "<p>Karaoke session controller is running.</p>",
    "</body></html>"
);

// ─────────────────────────────────────────────────────────────────────────────
// Request Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct JoinRequest {
    #[serde(default = "default_room")]
    room: String,
    #[serde(default)]
    name: String,
    delay: Option<i64>,
}

fn default_room() -> String {
    "lobby".to_string()
}

#[derive(Deserialize)]
struct LeaveRequest {
    name: Option<String>,
}

#[derive(Deserialize)]
struct CapacityRequest {
    room: Option<String>,
    limit: Option<i64>,
    capacity: Option<HashMap<String, i64>>,
}

#[derive(Deserialize)]
struct ApiForm {
    action: String,
    offer: Option<String>,
}

#[derive(Deserialize)]
struct DelayRequest {
    delay: Option<i64>,
}

#[derive(Deserialize)]
struct AuthRequest {
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
struct AcquireRequest {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct KeystrokeRequest {
    key: Option<String>,
}

#[derive(Deserialize)]
struct TextRequest {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Deserialize)]
struct PreviewQuery {
    id: Option<u32>,
}

#[derive(Deserialize)]
struct PlaylistEditRequest {
    id: Option<u32>,
    #[serde(default = "default_action")]
    action: String,
}

fn default_action() -> String {
    "add".to_string()
}

#[derive(Deserialize)]
struct ToggleRequest {
    #[serde(default)]
    enabled: bool,
    countdown_seconds: Option<u64>,
}

#[derive(Deserialize)]
struct NextRequest {
    countdown_seconds: Option<u64>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/rooms", get(rooms_list))
        .route("/rooms/stream", get(rooms_stream))
        .route("/rooms/join", post(rooms_join))
        .route("/rooms/leave", post(rooms_leave))
        .route("/rooms/capacity", get(capacity_get).post(capacity_set))
        .route("/api", post(api_action))
        .route("/api/disconnect", post(api_disconnect))
        .route("/player/delay", post(player_delay))
        .route("/control/status", get(control_status))
        .route("/control/auth", post(control_auth))
        .route("/control/acquire", post(control_acquire))
        .route("/control/release", post(control_release))
        .route("/control/keystroke", post(control_keystroke))
        .route("/control/text", post(control_text))
        .route("/songs/index", get(songs_index))
        .route("/songs/search", get(songs_search))
        .route("/songs/add_to_upl", post(songs_add_to_upl))
        .route("/songs/preview", get(songs_preview))
        .route("/playlist/status", get(playlist_status))
        .route("/playlist/toggle", post(playlist_toggle))
        .route("/playlist/next", post(playlist_next))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Landing and status
// ─────────────────────────────────────────────────────────────────────────────

async fn index(State(state): State<AppState>, jar: SignedCookieJar) -> Response {
    let (_, jar) = ensure_session(jar, &state.registry);
    (jar, Html(LANDING_HTML)).into_response()
}

/// Merged rooms/control snapshot; every call is a session heartbeat.
async fn status(State(state): State<AppState>, jar: SignedCookieJar) -> Response {
    let sid = touch_session(&jar, &state.registry);
    let session = sid.and_then(|sid| state.registry.get(sid));
    let snapshot = state.rooms.snapshot();
    api_success(json!({
        "success": true,
        "rooms": snapshot["rooms"],
        "capacity": snapshot["capacity"],
        "audio_enabled": !state.config.control_only,
        "control_only": state.config.control_only,
        "control": state.control.status(sid),
        "you": {
            "session_id": sid,
            "name": session.as_ref().and_then(|s| s.name.clone()),
            "room": session.as_ref().and_then(|s| s.room.clone()),
        },
    }))
    .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Rooms
// ─────────────────────────────────────────────────────────────────────────────

async fn rooms_list(State(state): State<AppState>, jar: SignedCookieJar) -> Response {
    touch_session(&jar, &state.registry);
    let snapshot = state.rooms.snapshot();
    api_success(json!({
        "success": true,
        "rooms": snapshot["rooms"],
        "capacity": snapshot["capacity"],
    }))
    .into_response()
}

/// SSE stream of `{rooms, capacity}` snapshots; the initial snapshot is
/// sent on connect.
async fn rooms_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let initial = state.rooms.snapshot().to_string();
    let mut rx = state.hub.subscribe();
    let stream = stream! {
        yield Ok(Event::default().data(initial));
        while let Some(payload) = rx.recv().await {
            yield Ok(Event::default().data(payload));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn rooms_join(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Json(payload): Json<JoinRequest>,
) -> Response {
    let (sid, jar) = ensure_session(jar, &state.registry);
    match state
        .rooms
        .join(sid, &payload.room, &payload.name, payload.delay)
        .await
    {
        Ok(outcome) => (
            jar,
            Json(json!({
                "success": true,
                "room": outcome.room,
                "name": outcome.name,
                "rooms": outcome.rooms,
                "capacity": outcome.capacity,
            })),
        )
            .into_response(),
        Err(e) => (jar, e).into_response(),
    }
}

async fn rooms_leave(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Json(payload): Json<LeaveRequest>,
) -> Response {
    let sid = touch_session(&jar, &state.registry);
    match state.rooms.leave(sid, payload.name.as_deref()) {
        Ok(snapshot) => api_success(json!({
            "success": true,
            "rooms": snapshot["rooms"],
            "capacity": snapshot["capacity"],
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn capacity_get(State(state): State<AppState>) -> Response {
    let snapshot = state.rooms.snapshot();
    api_success(json!({ "success": true, "capacity": snapshot["capacity"] })).into_response()
}

async fn capacity_set(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Json(payload): Json<CapacityRequest>,
) -> Response {
    let result: PartymicResult<Response> = (|| {
        let sid = touch_session(&jar, &state.registry).ok_or(PartymicError::ControlRequired)?;
        state.control.require_lock(sid)?;
        let updates = match payload.capacity {
            Some(updates) => updates,
            None => match (payload.room, payload.limit) {
                (Some(room), Some(limit)) => HashMap::from([(room, limit)]),
                _ => {
                    return Err(PartymicError::InvalidInput(
                        "No capacity updates provided".into(),
                    ))
                }
            },
        };
        let capacity = state.rooms.set_capacity(&updates)?;
        Ok(api_success(json!({ "success": true, "capacity": capacity })).into_response())
    })();
    result.unwrap_or_else(|e| e.into_response())
}

// ─────────────────────────────────────────────────────────────────────────────
// Audio ingress
// ─────────────────────────────────────────────────────────────────────────────

/// Form-encoded action endpoint; `start_webrtc` negotiates the ingress.
async fn api_action(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Form(payload): Form<ApiForm>,
) -> Response {
    if payload.action != "start_webrtc" {
        return api_error(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            format!("Invalid action: {}", payload.action),
        )
        .into_response();
    }
    let Some(ingress) = state.ingress.clone() else {
        return PartymicError::ControlOnly.into_response();
    };
    let Some(offer) = payload.offer.filter(|o| !o.is_empty()) else {
        return api_error(StatusCode::BAD_REQUEST, "invalid_input", "Missing offer")
            .into_response();
    };
    let (sid, jar) = ensure_session(jar, &state.registry);

    let answer = match Arc::clone(&ingress).start(sid, &offer).await {
        Ok(answer) => answer,
        Err(e) => return (jar, e).into_response(),
    };

    // Wire to the session's current sink; port discovery re-links to the
    // lobby sink once it completes.
    let sink_index = state
        .registry
        .get(sid)
        .map(|session| session.sink_index)
        .unwrap_or(0);
    if let Err(e) = ingress.connect_to_sink(sid, sink_index).await {
        log::debug!("[Api] Early sink connect for session {} failed: {}", sid, e);
    }

    (
        jar,
        Json(json!({
            "success": true,
            "answer": answer.sdp,
            "player_id": sid,
        })),
    )
        .into_response()
}

/// Page-close cleanup: tears down the ingress and drops the cookie.
async fn api_disconnect(State(state): State<AppState>, jar: SignedCookieJar) -> Response {
    let Some(sid) = touch_session(&jar, &state.registry) else {
        return api_error(StatusCode::OK, "invalid_input", "No session").into_response();
    };
    if let Some(ingress) = &state.ingress {
        ingress.remove(sid).await;
    }
    let jar = clear_session(jar);
    (jar, api_ok()).into_response()
}

async fn player_delay(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Json(payload): Json<DelayRequest>,
) -> Response {
    let Some(delay) = payload.delay else {
        return api_error(StatusCode::BAD_REQUEST, "invalid_input", "Missing delay")
            .into_response();
    };
    let (sid, jar) = ensure_session(jar, &state.registry);
    let delay = delay.max(0);
    state.registry.set_delay(sid, delay);
    state.rooms.update_game_config();
    (jar, Json(json!({ "success": true, "delay": delay }))).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Control surface
// ─────────────────────────────────────────────────────────────────────────────

async fn control_status(State(state): State<AppState>, jar: SignedCookieJar) -> Response {
    let sid = touch_session(&jar, &state.registry);
    api_success(state.control.status(sid)).into_response()
}

async fn control_auth(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Json(payload): Json<AuthRequest>,
) -> Response {
    let (sid, jar) = ensure_session(jar, &state.registry);
    match state.control.authenticate(sid, &payload.password) {
        Ok(body) => (jar, Json(body)).into_response(),
        Err(e) => (jar, e).into_response(),
    }
}

async fn control_acquire(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Json(payload): Json<AcquireRequest>,
) -> Response {
    let (sid, jar) = ensure_session(jar, &state.registry);
    match state.control.acquire(sid, &payload.name) {
        Ok(body) => (jar, Json(body)).into_response(),
        Err(e) => (jar, e).into_response(),
    }
}

async fn control_release(State(state): State<AppState>, jar: SignedCookieJar) -> Response {
    let result: PartymicResult<()> = (|| {
        let sid = touch_session(&jar, &state.registry).ok_or(PartymicError::NotOwner)?;
        state.control.release(sid)
    })();
    match result {
        Ok(()) => api_ok().into_response(),
        Err(e) => e.into_response(),
    }
}

async fn control_keystroke(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Json(payload): Json<KeystrokeRequest>,
) -> Response {
    let sid = match touch_session(&jar, &state.registry) {
        Some(sid) => sid,
        None => return PartymicError::NotOwner.into_response(),
    };
    let Some(key) = payload.key.filter(|k| !k.is_empty()) else {
        return api_error(StatusCode::BAD_REQUEST, "invalid_input", "Missing key")
            .into_response();
    };
    match state.control.keystroke(sid, &key).await {
        Ok(()) => api_ok().into_response(),
        Err(e @ PartymicError::Automation(_)) => {
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "input_failed", e).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn control_text(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Json(payload): Json<TextRequest>,
) -> Response {
    let sid = match touch_session(&jar, &state.registry) {
        Some(sid) => sid,
        None => return PartymicError::NotOwner.into_response(),
    };
    match state.control.type_text(sid, &payload.text).await {
        Ok(()) => api_ok().into_response(),
        Err(e @ PartymicError::Automation(_)) => {
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "input_failed", e).into_response()
        }
        Err(e) => e.into_response(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Songs
// ─────────────────────────────────────────────────────────────────────────────

async fn songs_index(State(state): State<AppState>) -> Response {
    let items = state.songs.all();
    api_success(json!({ "success": true, "count": items.len(), "items": items }))
        .into_response()
}

async fn songs_search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(50).clamp(1, 500);
    let (total, items) = state.songs.search(query.q.trim(), page, per_page);
    api_success(json!({
        "success": true,
        "q": query.q.trim(),
        "page": page,
        "per_page": per_page,
        "total": total,
        "items": items,
    }))
    .into_response()
}

async fn songs_add_to_upl(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Json(payload): Json<PlaylistEditRequest>,
) -> Response {
    touch_session(&jar, &state.registry);
    let result: PartymicResult<Response> = (|| {
        let id = payload
            .id
            .ok_or_else(|| PartymicError::InvalidInput("Missing id".into()))?;
        let entry = state
            .songs
            .get(id)
            .ok_or_else(|| PartymicError::NotFound(format!("song {id}")))?;
        let label = state.songs.label_for(id).ok_or_else(|| {
            PartymicError::Internal("Unable to derive playlist label".into())
        })?;
        let (lines, in_playlist) = match payload.action.as_str() {
            "add" => (state.playlist.append_unique(&label)?, true),
            "remove" => (state.playlist.remove_matching(&label)?, false),
            other => {
                return Err(PartymicError::InvalidInput(format!(
                    "Unknown action: {other}"
                )))
            }
        };
        state.songs.set_in_playlist(id, in_playlist);
        state.automation.refresh_next_song(&lines);
        Ok(api_success(json!({
            "success": true,
            "id": entry.id,
            "upl": in_playlist,
            "line": label,
        }))
        .into_response())
    })();
    result.unwrap_or_else(|e| e.into_response())
}

fn audio_content_type(path: &FsPath) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    }
}

/// Serves a song's audio file, path-escaped to the songs root.
async fn songs_preview(
    State(state): State<AppState>,
    Query(query): Query<PreviewQuery>,
) -> Response {
    let Some(id) = query.id else {
        return api_error(StatusCode::BAD_REQUEST, "invalid_input", "Missing id")
            .into_response();
    };
    let Some(entry) = state.songs.get(id) else {
        return PartymicError::NotFound(format!("song {id}")).into_response();
    };
    let allowed_root = match state.config.songs_root().canonicalize() {
        Ok(root) => root,
        Err(_) => return PartymicError::Forbidden.into_response(),
    };
    let candidate = match entry.audio.canonicalize() {
        Ok(path) => path,
        Err(_) => {
            return PartymicError::NotFound(entry.audio.display().to_string()).into_response()
        }
    };
    if !candidate.starts_with(&allowed_root) {
        log::warn!(
            "[Api] Preview outside songs root rejected: {}",
            candidate.display()
        );
        return PartymicError::Forbidden.into_response();
    }
    match tokio::fs::read(&candidate).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, audio_content_type(&candidate))],
            bytes,
        )
            .into_response(),
        Err(_) => PartymicError::NotFound(candidate.display().to_string()).into_response(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Playlist automation
// ─────────────────────────────────────────────────────────────────────────────

async fn playlist_status(State(state): State<AppState>) -> Response {
    let mut payload = state.automation.status_payload();
    payload["success"] = json!(true);
    api_success(payload).into_response()
}

async fn playlist_toggle(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Json(payload): Json<ToggleRequest>,
) -> Response {
    let (sid, jar) = ensure_session(jar, &state.registry);

    if payload.enabled {
        if let Err(e) = state.control.require_lock(sid) {
            return (jar, e).into_response();
        }
    } else {
        if let Err(e) = state.control.ensure_password(sid) {
            return (jar, e).into_response();
        }
        // Disabling without the lock is tolerated but noted.
        if state.control.require_owner(sid).is_err() {
            log::warn!(
                "[Api] Playlist disable requested by session {} without the control lock",
                sid
            );
        }
    }

    let mut status = match state
        .automation
        .set_enabled(payload.enabled, payload.countdown_seconds)
    {
        Ok(status) => status,
        Err(e) => return (jar, e).into_response(),
    };
    if payload.enabled {
        if let Err(e) = state
            .automation
            .trigger_immediately(payload.countdown_seconds)
            .await
        {
            log::warn!("[Api] Failed to start playlist sequence: {}", e);
        }
        status = state.automation.status_payload();
    }
    (jar, Json(json!({ "success": true, "state": status }))).into_response()
}

async fn playlist_next(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Json(payload): Json<NextRequest>,
) -> Response {
    let result: PartymicResult<Response> = async {
        let sid =
            touch_session(&jar, &state.registry).ok_or(PartymicError::ControlRequired)?;
        state.control.require_lock(sid)?;
        let token = state
            .automation
            .request_countdown(payload.countdown_seconds)
            .await?;
        Ok(api_success(json!({
            "success": true,
            "countdown_token": token,
            "state": state.automation.status_payload(),
        }))
        .into_response())
    }
    .await;
    result.unwrap_or_else(|e| e.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_content_types_cover_common_formats() {
        assert_eq!(audio_content_type(FsPath::new("a.m4a")), "audio/mp4");
        assert_eq!(audio_content_type(FsPath::new("a.mp3")), "audio/mpeg");
        assert_eq!(
            audio_content_type(FsPath::new("a.flac")),
            "application/octet-stream"
        );
    }
}
