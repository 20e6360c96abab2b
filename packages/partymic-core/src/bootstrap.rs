//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where all
//! services are instantiated and wired together. Global mutable state
//! (rooms, ingress map, playlist state, control lock, song index) is
//! intentional for a single-tenant local controller; it lives behind the
//! typed references handed out here rather than in module-level statics.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::audio::{sink_name, IngressManager};
use crate::error::{PartymicError, PartymicResult};
use crate::events::EventHub;
use crate::game::{GameConfig, LogTailer};
use crate::services::registry::{STALE_THRESHOLD, SWEEP_INTERVAL};
use crate::services::{
    ControlService, CountdownOverlay, InputDriver, PlaylistAutomation, RoomCoordinator,
    SessionRegistry, XdotoolInput,
};
use crate::songs::{PlaylistFile, SongIndex};
use crate::state::Config;

/// Container for all bootstrapped services.
#[derive(Clone)]
pub struct BootstrappedServices {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Session registry.
    pub registry: Arc<SessionRegistry>,
    /// Room coordinator.
    pub rooms: Arc<RoomCoordinator>,
    /// Event hub for SSE subscribers.
    pub hub: Arc<EventHub>,
    /// Control lock service.
    pub control: Arc<ControlService>,
    /// Playlist automation.
    pub automation: Arc<PlaylistAutomation>,
    /// Song index.
    pub songs: Arc<SongIndex>,
    /// Playlist file manager.
    pub playlist: Arc<PlaylistFile>,
    /// Game config writer.
    pub game_config: Arc<GameConfig>,
    /// Overlay handle.
    pub overlay: Arc<CountdownOverlay>,
    /// Ingress manager; absent in control-only mode.
    pub ingress: Option<Arc<IngressManager>>,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
}

impl BootstrappedServices {
    /// Builds the API state from the wired services.
    pub fn app_state(&self) -> AppState {
        AppState::new(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(&self.rooms),
            Arc::clone(&self.hub),
            Arc::clone(&self.control),
            Arc::clone(&self.automation),
            Arc::clone(&self.songs),
            Arc::clone(&self.playlist),
            self.ingress.clone(),
        )
    }

    /// Starts the background loops: ingress liveness, stale-session
    /// sweeping and the playlist automation tick.
    pub fn start_background_tasks(&self) {
        if let Some(ingress) = &self.ingress {
            Arc::clone(ingress).spawn_liveness_loop();
            spawn_stale_sweeper(
                Arc::clone(&self.registry),
                Arc::clone(&self.rooms),
                Arc::clone(&self.control),
                Arc::clone(&self.hub),
                Arc::clone(ingress),
                self.cancel_token.clone(),
            );
        }
        let tailer = LogTailer::new(&self.config.game_dir, self.config.game_log_file.as_deref());
        Arc::clone(&self.automation).spawn_loop(tailer);
    }

    /// Initiates graceful shutdown of all services.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.cancel_token.cancel();
        self.overlay.stop();
        if let Some(ingress) = &self.ingress {
            ingress.stop_all().await;
        }
        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Bootstraps all application services with their dependencies.
///
/// Wiring order follows the dependency graph: song index and playlist
/// file first, then the audio stack, then the coordinators that fan out
/// to everything else.
///
/// # Errors
///
/// Returns an error when the data directory cannot be created or the
/// audio graph refuses to create the virtual sinks.
pub async fn bootstrap_services(config: Config) -> PartymicResult<BootstrappedServices> {
    let config = Arc::new(config);

    std::fs::create_dir_all(&config.data_dir)
        .map_err(|e| PartymicError::Internal(format!("Failed to create data dir: {e}")))?;

    // Song library: fresh scan unless skipped, else the persisted index.
    let songs = Arc::new(SongIndex::new(
        config.song_index_path(),
        config.audio_format.clone(),
    ));
    if config.skip_song_scan {
        match songs.load() {
            Ok(count) => log::info!("[Bootstrap] Loaded persisted song index ({} songs)", count),
            Err(e) => log::warn!("[Bootstrap] No usable song index: {}", e),
        }
    } else if let Err(e) = songs.scan(&config.game_dir) {
        log::warn!("[Bootstrap] Song scan failed: {}", e);
    }

    // Each run starts from an empty playlist.
    let playlist = Arc::new(PlaylistFile::new(config.playlist_path()));
    if let Err(e) = playlist.reset() {
        log::warn!("[Bootstrap] Failed to initialize playlist file: {}", e);
    }

    let registry = Arc::new(SessionRegistry::new());
    let hub = Arc::new(EventHub::new());
    let game_config = Arc::new(GameConfig::new(config.game_config_path()));
    let input: Arc<dyn InputDriver> =
        Arc::new(XdotoolInput::new(config.game_window_title.clone()));
    let overlay = Arc::new(CountdownOverlay::new(config.overlay_command.clone()));

    let ingress = if config.control_only {
        log::info!("[Bootstrap] Control-only mode: audio ingress disabled");
        None
    } else {
        let manager = Arc::new(IngressManager::new(config.ingress_binary.clone()));
        manager.initialize().await?;
        log::info!(
            "[Bootstrap] Audio graph ready ({} sinks, lobby = {})",
            crate::audio::SINK_COUNT,
            sink_name(0)
        );
        Some(manager)
    };

    let rooms = Arc::new(RoomCoordinator::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&hub),
        Arc::clone(&game_config),
        ingress.clone(),
    ));
    let control = Arc::new(ControlService::new(
        config.control_password.clone(),
        Arc::clone(&registry),
        Arc::clone(&input),
    ));
    let automation = Arc::new(PlaylistAutomation::new(
        Arc::clone(&playlist),
        Arc::clone(&songs),
        input,
        Arc::clone(&overlay),
        config.countdown_seconds,
    ));

    Ok(BootstrappedServices {
        config,
        registry,
        rooms,
        hub,
        control,
        automation,
        songs,
        playlist,
        game_config,
        overlay,
        ingress,
        cancel_token: CancellationToken::new(),
    })
}

/// Evicts sessions that stopped sending heartbeats. A session whose
/// ingress is still alive is kept: the phone may be silent while its
/// audio still flows.
fn spawn_stale_sweeper(
    registry: Arc<SessionRegistry>,
    rooms: Arc<RoomCoordinator>,
    control: Arc<ControlService>,
    hub: Arc<EventHub>,
    ingress: Arc<IngressManager>,
    cancel_token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = interval.tick() => {}
            }
            for sid in registry.stale_ids(STALE_THRESHOLD) {
                if ingress.is_alive(sid).await {
                    log::debug!("[Sweeper] Session {} silent but ingress alive; keeping", sid);
                    continue;
                }
                log::info!("[Sweeper] Stale session {}; evicting", sid);
                ingress.remove(sid).await;
                let session = registry.remove(sid);
                if let Some(name) = session.and_then(|s| s.name) {
                    rooms.purge_name(&name);
                }
                if control.release_if_owned_by(sid) {
                    hub.broadcast(&rooms.snapshot());
                }
            }
        }
    });
}
