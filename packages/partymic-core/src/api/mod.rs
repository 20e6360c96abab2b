//! HTTP/SSE API layer.
//!
//! This module contains thin handlers that delegate to services. It
//! provides the router construction and server startup functionality.

use std::sync::Arc;

use axum::extract::FromRef;
use axum_extra::extract::cookie::Key;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::audio::IngressManager;
use crate::events::EventHub;
use crate::services::{
    ControlService, PlaylistAutomation, RoomCoordinator, SessionRegistry,
};
use crate::songs::{PlaylistFile, SongIndex};
use crate::state::Config;

pub mod http;
pub mod response;
pub mod session;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer.
///
/// This is a thin wrapper that holds references to services. All business
/// logic lives in the services themselves.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Session ids, names, delays and heartbeats.
    pub registry: Arc<SessionRegistry>,
    /// Room table and capacity rules.
    pub rooms: Arc<RoomCoordinator>,
    /// Snapshot fan-out to SSE subscribers.
    pub hub: Arc<EventHub>,
    /// Operator control lock and keystroke surface.
    pub control: Arc<ControlService>,
    /// Playlist automation state machine.
    pub automation: Arc<PlaylistAutomation>,
    /// Scanned song library.
    pub songs: Arc<SongIndex>,
    /// The playlist file manager.
    pub playlist: Arc<PlaylistFile>,
    /// Ingress coordination; `None` in control-only mode.
    pub ingress: Option<Arc<IngressManager>>,
    /// Key signing the session cookie.
    cookie_key: Key,
}

impl AppState {
    /// Assembles the state. `cookie_secret` shorter than 64 bytes falls
    /// back to a per-run random key.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        registry: Arc<SessionRegistry>,
        rooms: Arc<RoomCoordinator>,
        hub: Arc<EventHub>,
        control: Arc<ControlService>,
        automation: Arc<PlaylistAutomation>,
        songs: Arc<SongIndex>,
        playlist: Arc<PlaylistFile>,
        ingress: Option<Arc<IngressManager>>,
    ) -> Self {
        let cookie_key = if config.cookie_secret.len() >= 64 {
            Key::from(config.cookie_secret.as_bytes())
        } else {
            if !config.cookie_secret.is_empty() {
                log::warn!(
                    "[Server] Cookie secret shorter than 64 bytes; using a per-run random key"
                );
            }
            Key::generate()
        };
        Self {
            config,
            registry,
            rooms,
            hub,
            control,
            automation,
            songs,
            playlist,
            ingress,
            cookie_key,
        }
    }
}

impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Key {
        state.cookie_key.clone()
    }
}

/// Starts the HTTP server on the given port and serves until the task is
/// cancelled.
pub async fn start_server(state: AppState, port: u16) -> Result<(), ServerError> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Server listening on http://0.0.0.0:{}", port);
    let app = http::create_router(state).layer(TraceLayer::new_for_http());
    axum::serve(listener, app).await?;
    Ok(())
}
