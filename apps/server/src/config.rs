//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP server to.
    /// Override: `PARTYMIC_PORT`
    pub port: u16,

    /// Path to the UltraStar Deluxe directory.
    /// Override: `PARTYMIC_USDX_DIR`
    pub usdx_dir: PathBuf,

    /// Playlist filename inside `<usdx_dir>/playlists/`.
    pub playlist_name: String,

    /// Audio extension of the song library.
    pub audio_format: String,

    /// Explicit game log file path (candidates are probed when unset).
    pub usdx_log_file: Option<PathBuf>,

    /// Default countdown seconds for playlist automation.
    pub countdown: u64,

    /// Skip the song scan at startup.
    pub skip_scan_songs: bool,

    /// Passphrase gating the control surface.
    /// Override: `PARTYMIC_CONTROL_PASSWORD`
    pub control_password: Option<String>,

    /// Control-only mode: no ingress or audio-graph operations.
    pub control_only: bool,

    /// Maximum bytes of a player display name.
    pub max_name_length: usize,

    /// Directory for persistent data (capacity store, song index).
    /// Override: `PARTYMIC_DATA_DIR`
    pub data_dir: PathBuf,

    /// Path to the audio-ingress child binary.
    pub ingress_binary: PathBuf,

    /// Command launched for the fullscreen countdown overlay.
    pub overlay_command: Option<PathBuf>,

    /// Substring identifying the game window for input synthesis.
    pub game_window_title: String,

    /// Secret signing the session cookie (64+ bytes; random per run when
    /// unset). Override: `PARTYMIC_COOKIE_SECRET`
    pub cookie_secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = partymic_core::Config::default();
        Self {
            port: 5000,
            usdx_dir: core.game_dir,
            playlist_name: core.playlist_name,
            audio_format: core.audio_format,
            usdx_log_file: None,
            countdown: core.countdown_seconds,
            skip_scan_songs: false,
            control_password: None,
            control_only: false,
            max_name_length: core.max_name_length,
            data_dir: core.data_dir,
            ingress_binary: core.ingress_binary,
            overlay_command: None,
            game_window_title: core.game_window_title,
            cookie_secret: String::new(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("PARTYMIC_PORT") {
            if let Ok(port) = val.parse() {
                self.port = port;
            }
        }
        if let Ok(val) = std::env::var("PARTYMIC_USDX_DIR") {
            self.usdx_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("PARTYMIC_DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("PARTYMIC_CONTROL_PASSWORD") {
            self.control_password = Some(val);
        }
        if let Ok(val) = std::env::var("PARTYMIC_COOKIE_SECRET") {
            self.cookie_secret = val;
        }
    }

    /// Converts to partymic-core's Config type.
    pub fn to_core_config(&self) -> partymic_core::Config {
        partymic_core::Config {
            game_dir: self.usdx_dir.clone(),
            playlist_name: self.playlist_name.clone(),
            audio_format: self.audio_format.clone(),
            game_log_file: self.usdx_log_file.clone(),
            game_window_title: self.game_window_title.clone(),
            data_dir: self.data_dir.clone(),
            skip_song_scan: self.skip_scan_songs,
            control_password: self.control_password.clone(),
            control_only: self.control_only,
            max_name_length: self.max_name_length.max(1),
            countdown_seconds: self.countdown.max(1),
            ingress_binary: self.ingress_binary.clone(),
            overlay_command: self.overlay_command.clone(),
            cookie_secret: self.cookie_secret.clone(),
        }
    }
}
