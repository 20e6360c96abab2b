//! Core application configuration.
//!
//! Provides [`Config`], the single configuration record consumed by every
//! service. The server binary builds it from its CLI/YAML surface; tests
//! build it directly with [`Config::default`] plus field overrides.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for the Partymic session controller.
///
/// All fields have sensible defaults; paths default to a layout where the
/// game directory sits next to the server (`../usdx`).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    // Game integration
    /// Path to the UltraStar Deluxe installation directory.
    pub game_dir: PathBuf,

    /// Playlist filename inside `<game_dir>/playlists/`.
    pub playlist_name: String,

    /// Audio file extension of the song library (e.g. "m4a", "mp3").
    pub audio_format: String,

    /// Explicit path to the game's log file. When unset, well-known
    /// candidates under `game_dir` are probed.
    pub game_log_file: Option<PathBuf>,

    /// Substring used to locate the game window for input synthesis.
    pub game_window_title: String,

    // Server behavior
    /// Directory for persistent data (capacity store, song index).
    pub data_dir: PathBuf,

    /// Skip the song scan at startup and reuse the persisted index.
    pub skip_song_scan: bool,

    /// Optional passphrase required before any control operation.
    pub control_password: Option<String>,

    /// Control-only mode: no ingress or audio-graph operations.
    pub control_only: bool,

    /// Maximum bytes kept of a player display name.
    pub max_name_length: usize,

    /// Default countdown duration for playlist automation (seconds).
    pub countdown_seconds: u64,

    // External tools
    /// Path to the audio-ingress child binary.
    pub ingress_binary: PathBuf,

    /// Command launched to display the fullscreen countdown overlay.
    /// The remaining seconds are appended as the single argument.
    pub overlay_command: Option<PathBuf>,

    /// Secret used to sign the session cookie. Regenerated per run when
    /// empty, which invalidates cookies across restarts.
    pub cookie_secret: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            game_dir: PathBuf::from("../usdx"),
            playlist_name: "PartymicSession.upl".to_string(),
            audio_format: "m4a".to_string(),
            game_log_file: None,
            game_window_title: "UltraStar".to_string(),
            data_dir: PathBuf::from("data"),
            skip_song_scan: false,
            control_password: None,
            control_only: false,
            max_name_length: 16,
            countdown_seconds: 15,
            ingress_binary: PathBuf::from("./pulse-receive/pulse-receive"),
            overlay_command: None,
            cookie_secret: String::new(),
        }
    }
}

impl Config {
    /// Absolute path of the playlist file.
    pub fn playlist_path(&self) -> PathBuf {
        self.game_dir.join("playlists").join(&self.playlist_name)
    }

    /// Path of the game's `config.ini`.
    pub fn game_config_path(&self) -> PathBuf {
        self.game_dir.join("config.ini")
    }

    /// Root directory song previews may be served from.
    pub fn songs_root(&self) -> PathBuf {
        self.game_dir.join("songs")
    }

    /// Path of the persisted song index.
    pub fn song_index_path(&self) -> PathBuf {
        self.data_dir.join("songs_index.json")
    }

    /// Path of the persisted room-capacity store.
    pub fn capacity_store_path(&self) -> PathBuf {
        self.data_dir.join("room_capacity.json")
    }

    /// Builds a test configuration rooted in a temporary directory.
    #[cfg(test)]
    pub fn for_test(root: &std::path::Path) -> Self {
        Self {
            game_dir: root.join("usdx"),
            data_dir: root.join("data"),
            ..Self::default()
        }
    }

    /// Normalizes a display name: truncate to `max_name_length` bytes on a
    /// character boundary, falling back to `user-<id>` when empty.
    pub fn normalize_name(&self, raw: &str, session_id: u64) -> String {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return format!("user-{session_id}");
        }
        let mut end = trimmed.len().min(self.max_name_length);
        while end > 0 && !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        trimmed[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_name_truncates_to_max_bytes() {
        let config = Config::default();
        let long = "abcdefghijklmnopqrstuvwxyz";
        assert_eq!(config.normalize_name(long, 1), "abcdefghijklmnop");
        assert_eq!(config.normalize_name("Ada", 1), "Ada");
    }

    #[test]
    fn normalize_name_respects_char_boundaries() {
        let config = Config {
            max_name_length: 5,
            ..Config::default()
        };
        // 'ü' is two bytes; truncation must not split it.
        let name = config.normalize_name("müller", 1);
        assert!(name.len() <= 5);
        assert!(name.is_char_boundary(name.len()));
    }

    #[test]
    fn normalize_name_falls_back_for_empty() {
        let config = Config::default();
        assert_eq!(config.normalize_name("  ", 42), "user-42");
    }

    #[test]
    fn playlist_path_is_under_game_dir() {
        let config = Config::default();
        assert!(config
            .playlist_path()
            .to_string_lossy()
            .contains("playlists"));
    }
}
