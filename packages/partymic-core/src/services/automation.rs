//! Playlist automation: drives the game to unattended playback.
//!
//! A 250ms loop advances a phase state machine. Countdowns synthesize the
//! next confirmation key when they expire; song start and song end are
//! detected from the game's log (decoder lines, status markers, video
//! playback). Every countdown carries a token; timer expirations that
//! observe a stale token are discarded, which makes re-activation safe
//! under contention.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::error::{PartymicError, PartymicResult};
use crate::game::LogTailer;
use crate::songs::{PlaylistFile, SongIndex};

use super::input::InputDriver;
use super::overlay::CountdownOverlay;

/// Tick interval of the automation loop.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Bound on waiting for the game to actually start a song.
const SONG_START_TIMEOUT: Duration = Duration::from_secs(120);

/// Decoder events within one `singing` phase that signal the song ended.
const SCORE_EVENT_COUNT: u32 = 3;

/// Gap between consecutive decoder events that signals the song ended.
const SCORE_EVENT_GAP: Duration = Duration::from_secs(5);

/// Pause between synthesized events of a key sequence.
const SEQUENCE_KEY_DELAY: Duration = Duration::from_millis(50);

static DECODER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"Using decoder FFmpeg_Decoder for "(?P<path>[^"]+)""#).unwrap()
});
static STATUS_END_ONSHOW_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)STATUS:\s*End\s*\[OnShow\]").unwrap());
static VIDEO_PLAYING_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(Playing\s+video|Video\s*:|Start\s+video)").unwrap());

/// Automation phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    PreOpenCountdown,
    PlayerSelectionCountdown,
    AwaitingSongStart,
    Singing,
    ScoresCountdown,
    HighscoreCountdown,
    AwaitingSongList,
    NextSongCountdown,
}

impl Phase {
    /// Wire name of the phase.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PreOpenCountdown => "pre_open_countdown",
            Self::PlayerSelectionCountdown => "player_selection_countdown",
            Self::AwaitingSongStart => "awaiting_song_start",
            Self::Singing => "singing",
            Self::ScoresCountdown => "scores_countdown",
            Self::HighscoreCountdown => "highscore_countdown",
            Self::AwaitingSongList => "awaiting_song_list",
            Self::NextSongCountdown => "next_song_countdown",
        }
    }
}

struct AutomationState {
    enabled: bool,
    status: &'static str,
    countdown_seconds: u64,
    countdown_deadline: Option<Instant>,
    countdown_token: u64,
    phase: Phase,
    phase_timeout: Option<Instant>,
    current_index: usize,
    current_song: Option<String>,
    next_song: Option<String>,
    pending_index: Option<usize>,
    pending_song: Option<String>,
    last_decoder_path: Option<PathBuf>,
    auto_added: u64,
    last_error: Option<String>,
    playlist_initialized: bool,
    decoder_event_count: u32,
    decoder_last_at: Option<Instant>,
    decoder_last_label: Option<String>,
    decoder_score_triggered: bool,
}

impl AutomationState {
    fn new(countdown_seconds: u64) -> Self {
        Self {
            enabled: false,
            status: "disabled",
            countdown_seconds,
            countdown_deadline: None,
            countdown_token: 0,
            phase: Phase::Idle,
            phase_timeout: None,
            current_index: 0,
            current_song: None,
            next_song: None,
            pending_index: None,
            pending_song: None,
            last_decoder_path: None,
            auto_added: 0,
            last_error: None,
            playlist_initialized: false,
            decoder_event_count: 0,
            decoder_last_at: None,
            decoder_last_label: None,
            decoder_score_triggered: false,
        }
    }

    fn reset_decoder_tracking(&mut self) {
        self.decoder_event_count = 0;
        self.decoder_last_at = None;
        self.decoder_last_label = None;
        self.decoder_score_triggered = false;
    }
}

/// Human status line per status value.
fn status_text(status: &str) -> &'static str {
    match status {
        "disabled" => "Playlist mode disabled",
        "idle" => "Idle — ready for next song",
        "pre_open_countdown" => "Preparing playlist…",
        "next_song_countdown" => "Next song countdown",
        "player_selection_countdown" => "Player selection countdown",
        "awaiting_song_start" => "Waiting for song to start…",
        "singing" => "Song in progress",
        "scores_countdown" => "Review scores in…",
        "highscore_countdown" => "Highscore countdown",
        "awaiting_song_list" => "Waiting for song list…",
        "error" => "Error",
        _ => "Idle",
    }
}

/// The log-driven automation service.
pub struct PlaylistAutomation {
    state: Mutex<AutomationState>,
    playlist: Arc<PlaylistFile>,
    songs: Arc<SongIndex>,
    input: Arc<dyn InputDriver>,
    overlay: Arc<CountdownOverlay>,
}

impl PlaylistAutomation {
    /// Creates the automation service (initially disabled).
    pub fn new(
        playlist: Arc<PlaylistFile>,
        songs: Arc<SongIndex>,
        input: Arc<dyn InputDriver>,
        overlay: Arc<CountdownOverlay>,
        default_countdown: u64,
    ) -> Self {
        Self {
            state: Mutex::new(AutomationState::new(default_countdown.max(1))),
            playlist,
            songs,
            input,
            overlay,
        }
    }

    /// Current phase (for tests and diagnostics).
    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Whether any countdown deadline is currently scheduled.
    pub fn countdown_scheduled(&self) -> bool {
        self.state.lock().countdown_deadline.is_some()
    }

    fn countdown_duration(&self, custom: Option<u64>) -> u64 {
        match custom {
            Some(seconds) if seconds > 0 => seconds,
            _ => {
                let state = self.state.lock();
                state.countdown_seconds.max(1)
            }
        }
    }

    // ── Status ──────────────────────────────────────────────────────────

    /// Snapshot payload for `/playlist/status` and toggle responses.
    pub fn status_payload(&self) -> Value {
        let lines = self.playlist.read();
        let state = self.state.lock();
        let now = Instant::now();
        let countdown_remaining = state
            .countdown_deadline
            .map(|deadline| deadline.saturating_duration_since(now).as_secs())
            .unwrap_or(0);
        let countdown_active = state.countdown_deadline.is_some() && countdown_remaining > 0;
        json!({
            "enabled": state.enabled,
            "status": state.status,
            "automation_phase": state.phase.as_str(),
            "status_text": status_text(state.status),
            "current_index": state.current_index,
            "current_song": state.current_song,
            "next_song": state.next_song,
            "playlist_length": lines.len(),
            "countdown_seconds": state.countdown_seconds,
            "countdown_remaining": countdown_remaining,
            "countdown_active": countdown_active,
            "last_decoder_path": state.last_decoder_path.as_ref().map(|p| p.display().to_string()),
            "auto_added": state.auto_added,
            "lock_controls": state.enabled,
            "last_error": state.last_error,
        })
    }

    // ── Enable / disable ────────────────────────────────────────────────

    /// Enables or disables automation. Enabling seeds the playlist to at
    /// least two entries and resets the state machine; disabling clears
    /// the overlay and every scheduled deadline.
    pub fn set_enabled(
        &self,
        enabled: bool,
        countdown_seconds: Option<u64>,
    ) -> PartymicResult<Value> {
        let (lines, auto_seeded) = if enabled {
            let (lines, added) = self.playlist.ensure_at_least(2, &self.songs);
            if !added.is_empty() {
                log::info!(
                    "[Playlist] Auto-seeded with {} before enabling",
                    added.join(", ")
                );
            }
            if lines.len() < 2 {
                return Err(PartymicError::Automation(
                    "Playlist is empty and no songs could be auto-added".into(),
                ));
            }
            (lines, added.len() as u64)
        } else {
            (self.playlist.read(), 0)
        };

        {
            let mut state = self.state.lock();
            state.enabled = enabled;
            if let Some(seconds) = countdown_seconds {
                state.countdown_seconds = seconds.max(1);
            }
            state.countdown_deadline = None;
            state.countdown_token += 1;
            state.last_error = None;
            state.phase = Phase::Idle;
            state.phase_timeout = None;
            state.playlist_initialized = false;
            state.pending_song = None;
            state.pending_index = None;
            state.reset_decoder_tracking();
            if enabled {
                state.status = "idle";
                state.current_index = 0;
                state.current_song = None;
                state.next_song = lines.first().cloned();
                state.auto_added = auto_seeded;
            } else {
                state.status = "disabled";
                state.current_song = None;
                state.next_song = None;
                state.auto_added = 0;
            }
        }
        if !enabled {
            self.overlay.stop();
        }
        log::info!("[Playlist] Automation {}", if enabled { "enabled" } else { "disabled" });
        Ok(self.status_payload())
    }

    /// Starts the opening sequence right away (used when the operator
    /// enables automation).
    pub async fn trigger_immediately(&self, custom_seconds: Option<u64>) -> PartymicResult<()> {
        let duration = self.countdown_duration(custom_seconds);
        self.state.lock().countdown_seconds = duration;
        self.begin_initial_sequence(duration).await
    }

    /// Operator "next" request: from `idle`/`awaiting_song_list` either
    /// runs the opening sequence (first time) or advances the selection.
    /// Returns the countdown token.
    pub async fn request_countdown(&self, custom_seconds: Option<u64>) -> PartymicResult<u64> {
        let duration = self.countdown_duration(custom_seconds);
        {
            let mut state = self.state.lock();
            if !state.enabled {
                return Err(PartymicError::Automation(
                    "Playlist mode is not enabled".into(),
                ));
            }
            if !matches!(state.phase, Phase::Idle | Phase::AwaitingSongList) {
                return Err(PartymicError::Automation(
                    "Playlist automation is busy".into(),
                ));
            }
            state.countdown_seconds = duration;
        }
        self.playlist.ensure_at_least(2, &self.songs);

        let initialized = self.state.lock().playlist_initialized;
        if initialized {
            self.select_next_with_countdown(duration).await?;
        } else {
            self.begin_initial_sequence(duration).await?;
        }
        let token = self.state.lock().countdown_token;
        log::info!(
            "[Playlist] Countdown started for {}s (token={})",
            duration,
            token
        );
        Ok(token)
    }

    // ── Sequences ───────────────────────────────────────────────────────

    async fn run_sequence(&self, keys: &[&str]) -> PartymicResult<()> {
        for key in keys {
            self.input
                .key(key)
                .await
                .map_err(|e| PartymicError::Automation(e.to_string()))?;
            tokio::time::sleep(SEQUENCE_KEY_DELAY).await;
        }
        Ok(())
    }

    /// Escapes back to the main menu and opens the playlist: ten Escape,
    /// then Return, p, Return, p, Return, Down, Down, Return.
    async fn send_open_sequence(&self) -> PartymicResult<()> {
        let mut keys = vec!["Escape"; 10];
        keys.extend([
            "Return", "p", "Return", "p", "Return", "Down", "Down", "Return",
        ]);
        self.run_sequence(&keys).await
    }

    async fn send_confirm(&self) -> PartymicResult<()> {
        self.run_sequence(&["Return"]).await
    }

    async fn send_select_next(&self) -> PartymicResult<()> {
        self.run_sequence(&["Down"]).await
    }

    // ── Phase plumbing ──────────────────────────────────────────────────

    fn activate_countdown(&self, phase: Phase, duration: Option<u64>) -> (u64, u64) {
        let duration = self.countdown_duration(duration);
        let token;
        {
            let mut state = self.state.lock();
            state.phase = phase;
            state.status = phase.as_str();
            state.countdown_deadline = Some(Instant::now() + Duration::from_secs(duration));
            state.countdown_token += 1;
            state.phase_timeout = None;
            token = state.countdown_token;
        }
        self.overlay.launch(duration);
        (token, duration)
    }

    fn activate_phase(&self, phase: Phase, timeout: Option<Duration>) {
        let mut state = self.state.lock();
        state.phase = phase;
        state.status = phase.as_str();
        state.countdown_deadline = None;
        state.phase_timeout = timeout.map(|t| Instant::now() + t);
        if phase == Phase::AwaitingSongStart {
            state.reset_decoder_tracking();
        }
    }

    fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.state.lock();
        state.status = "error";
        state.phase = Phase::Idle;
        state.countdown_deadline = None;
        state.phase_timeout = None;
        state.reset_decoder_tracking();
        state.last_error = Some(message.clone());
        drop(state);
        log::error!("[Playlist] Automation error: {}", message);
    }

    /// Resolves the playlist entry to start next and records it as
    /// pending. Appends random entries when the index runs past the end,
    /// and one more when the entry is the last line.
    fn prepare_pending_entry(&self) -> PartymicResult<()> {
        let target = self.state.lock().current_index;
        let (pending, lines) = self
            .playlist
            .prepare_pending(target, &self.songs)
            .map_err(PartymicError::Automation)?;
        let mut state = self.state.lock();
        state.pending_index = Some(pending.index);
        state.pending_song = Some(pending.label.clone());
        state.next_song = Some(pending.label.clone());
        state.phase_timeout = None;
        state.auto_added += pending.auto_added as u64;
        log::info!(
            "[Playlist] Prepared pending entry index={} label={} (playlist len {})",
            pending.index,
            pending.label,
            lines.len()
        );
        Ok(())
    }

    async fn begin_initial_sequence(&self, duration: u64) -> PartymicResult<()> {
        self.prepare_pending_entry()?;
        self.send_open_sequence().await?;
        {
            let mut state = self.state.lock();
            state.playlist_initialized = true;
        }
        self.activate_countdown(Phase::NextSongCountdown, Some(duration));
        log::info!("[Playlist] Opening sequence sent; next-song countdown running");
        Ok(())
    }

    async fn select_next_with_countdown(&self, duration: u64) -> PartymicResult<()> {
        self.send_select_next().await?;
        self.activate_countdown(Phase::NextSongCountdown, Some(duration));
        log::info!("[Playlist] Advanced selection; next-song countdown running");
        Ok(())
    }

    // ── Countdown expirations ───────────────────────────────────────────

    fn token_still_current(&self, expected: u64) -> bool {
        let mut state = self.state.lock();
        if state.countdown_token != expected {
            log::debug!(
                "[Playlist] Ignoring stale countdown token {} (current {})",
                expected,
                state.countdown_token
            );
            return false;
        }
        state.countdown_deadline = None;
        true
    }

    pub(crate) async fn on_next_song_expired(&self, expected_token: u64) {
        if !self.token_still_current(expected_token) {
            return;
        }
        if let Err(e) = self.send_confirm().await {
            self.set_error(format!("Failed to confirm song selection: {e}"));
            return;
        }
        self.activate_countdown(Phase::PlayerSelectionCountdown, None);
        log::info!("[Playlist] Song confirmed; player selection countdown running");
    }

    pub(crate) async fn on_player_selection_expired(&self, expected_token: u64) {
        if !self.token_still_current(expected_token) {
            return;
        }
        if let Err(e) = self.send_confirm().await {
            self.set_error(format!("Failed to confirm players: {e}"));
            return;
        }
        self.activate_phase(Phase::AwaitingSongStart, Some(SONG_START_TIMEOUT));
        log::info!("[Playlist] Players confirmed; awaiting song start");
    }

    pub(crate) async fn on_scores_expired(&self, expected_token: u64) {
        if !self.token_still_current(expected_token) {
            return;
        }
        if let Err(e) = self.prepare_pending_entry() {
            self.set_error(format!("Failed to prepare next playlist entry: {e}"));
            return;
        }
        if let Err(e) = self.send_confirm().await {
            self.set_error(format!("Failed to confirm scores: {e}"));
            return;
        }
        self.activate_countdown(Phase::HighscoreCountdown, None);
        log::info!("[Playlist] Scores confirmed; highscore countdown running");
    }

    pub(crate) async fn on_highscore_expired(&self, expected_token: u64) {
        if !self.token_still_current(expected_token) {
            return;
        }
        if let Err(e) = self.send_confirm().await {
            self.set_error(format!("Failed to confirm highscore screen: {e}"));
            return;
        }
        let duration = self.countdown_duration(None);
        if let Err(e) = self.select_next_with_countdown(duration).await {
            self.set_error(format!("Failed to queue next song: {e}"));
            return;
        }
        log::info!("[Playlist] Highscore confirmed; next selection queued");
    }

    /// One countdown/timeout tick.
    pub(crate) async fn process_countdown(&self) {
        let now = Instant::now();
        let (enabled, deadline, token, phase, phase_timeout) = {
            let state = self.state.lock();
            (
                state.enabled,
                state.countdown_deadline,
                state.countdown_token,
                state.phase,
                state.phase_timeout,
            )
        };
        if !enabled {
            return;
        }
        if let Some(deadline) = deadline {
            if now >= deadline {
                match phase {
                    Phase::NextSongCountdown => self.on_next_song_expired(token).await,
                    Phase::PlayerSelectionCountdown => {
                        self.on_player_selection_expired(token).await
                    }
                    Phase::ScoresCountdown => self.on_scores_expired(token).await,
                    Phase::HighscoreCountdown => self.on_highscore_expired(token).await,
                    _ => {
                        self.state.lock().countdown_deadline = None;
                    }
                }
            }
            return;
        }
        if let Some(timeout) = phase_timeout {
            if now >= timeout {
                log::warn!(
                    "[Playlist] Phase {} timed out; entering error state",
                    phase.as_str()
                );
                self.set_error(format!(
                    "Automation timeout while waiting for {}",
                    phase.as_str()
                ));
            }
        }
    }

    // ── Log-driven transitions ──────────────────────────────────────────

    /// Marks the song as started: transition `awaiting_song_start` →
    /// `singing` and advance `current_index` past the started entry.
    fn handle_song_started(
        &self,
        label: Option<String>,
        index: Option<usize>,
        lines: &[String],
    ) {
        let mut state = self.state.lock();
        if state.phase != Phase::AwaitingSongStart {
            return;
        }
        let label = label
            .or_else(|| state.pending_song.clone())
            .or_else(|| state.current_song.clone());
        let index = index.or(state.pending_index).unwrap_or(state.current_index);
        state.phase = Phase::Singing;
        state.status = Phase::Singing.as_str();
        state.countdown_deadline = None;
        state.phase_timeout = None;
        state.reset_decoder_tracking();
        state.decoder_last_label = label.clone();
        state.current_song = label.clone();
        state.current_index = index + 1;
        let next_index = state.current_index;
        state.next_song = lines.get(next_index).cloned();
        state.pending_song = None;
        state.pending_index = None;
        state.last_error = None;
        drop(state);
        log::info!(
            "[Playlist] Song playback detected; now singing \"{}\"",
            label.as_deref().unwrap_or("unknown")
        );
    }

    /// One-shot transition to the scores countdown; returns whether it
    /// fired.
    fn trigger_scores_countdown(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Singing || state.decoder_score_triggered {
                return false;
            }
            state.decoder_score_triggered = true;
            state.phase_timeout = None;
        }
        self.activate_countdown(Phase::ScoresCountdown, None);
        true
    }

    /// Decoder log line: either the awaited song start, end-of-song
    /// evidence while singing, or a current-song correction.
    fn process_decoder_path(&self, raw_path: &str) {
        let normalized = PathBuf::from(raw_path)
            .canonicalize()
            .unwrap_or_else(|_| PathBuf::from(raw_path));
        let entry = self.songs.get_by_audio(&normalized);
        let label = entry.and_then(|e| self.songs.label_for(e.id));
        let lines = self.playlist.read();
        let now = Instant::now();

        let (phase, current_song, pending_song, pending_index, start_hint) = {
            let mut state = self.state.lock();
            state.last_decoder_path = Some(normalized.clone());
            (
                state.phase,
                state.current_song.clone(),
                state.pending_song.clone(),
                state.pending_index,
                state.current_index.saturating_sub(3),
            )
        };

        let active_label = label.or(if phase == Phase::AwaitingSongStart {
            pending_song
        } else {
            current_song.clone()
        });
        let index = active_label
            .as_deref()
            .and_then(|l| find_label_index(l, &lines, start_hint))
            .or(if phase == Phase::AwaitingSongStart {
                pending_index
            } else {
                Some(start_hint)
            });

        match phase {
            Phase::AwaitingSongStart => {
                self.handle_song_started(active_label.clone(), index, &lines);
                let mut state = self.state.lock();
                state.decoder_event_count = 1;
                state.decoder_last_at = Some(now);
                state.decoder_last_label = active_label.clone();
                drop(state);
                log::info!(
                    "[Playlist] Song started: {} (decoder={})",
                    active_label.as_deref().unwrap_or("unknown"),
                    normalized.display()
                );
            }
            Phase::Singing => {
                let mut relabeled = false;
                let mut should_trigger = false;
                let mut event_count = 0;
                {
                    let mut state = self.state.lock();
                    let matches_current = match &active_label {
                        Some(label) => Some(label) == state.current_song.as_ref(),
                        None => true,
                    };
                    if !matches_current {
                        // A different song's decoder line while singing
                        // relabels instead of counting toward the trigger.
                        state.current_song = active_label.clone();
                        let next_index = state.current_index;
                        state.next_song = lines.get(next_index).cloned();
                        state.decoder_event_count = 1;
                        state.decoder_last_at = Some(now);
                        state.decoder_last_label = active_label.clone();
                        relabeled = true;
                    } else {
                        let delta = state.decoder_last_at.map(|t| now - t);
                        state.decoder_event_count += 1;
                        event_count = state.decoder_event_count;
                        state.decoder_last_at = Some(now);
                        if state.decoder_last_label.is_none() {
                            state.decoder_last_label = active_label.clone();
                        }
                        if !state.decoder_score_triggered
                            && (event_count >= SCORE_EVENT_COUNT
                                || delta.is_some_and(|d| d >= SCORE_EVENT_GAP))
                        {
                            should_trigger = true;
                        }
                    }
                }
                if relabeled {
                    log::info!(
                        "[Playlist] Updated current song to {} from decoder log",
                        active_label.as_deref().unwrap_or("unknown")
                    );
                    return;
                }
                if should_trigger && self.trigger_scores_countdown() {
                    log::info!(
                        "[Playlist] Decoder replay detected (count={}); scores countdown running",
                        event_count
                    );
                }
            }
            _ => {}
        }
    }

    /// Routes one game-log line through the recognizers.
    pub(crate) fn process_log_line(&self, line: &str) {
        if STATUS_END_ONSHOW_REGEX.is_match(line) {
            let lines = self.playlist.read();
            self.handle_song_started(None, None, &lines);
            return;
        }
        if let Some(captures) = DECODER_REGEX.captures(line) {
            if let Some(path) = captures.name("path") {
                log::debug!("[Playlist] Decoder log entry: {}", path.as_str());
                self.process_decoder_path(path.as_str());
            }
            return;
        }
        if VIDEO_PLAYING_REGEX.is_match(line) && self.trigger_scores_countdown() {
            log::info!("[Playlist] Post-song video detected; scores countdown running");
        }
    }

    /// Re-derives `next_song` after an external playlist edit.
    pub fn refresh_next_song(&self, lines: &[String]) {
        let mut state = self.state.lock();
        let index = state.current_index;
        state.next_song = lines.get(index).cloned();
    }

    /// Spawns the automation loop: countdown processing plus log tailing.
    pub fn spawn_loop(self: Arc<Self>, mut tailer: LogTailer) {
        let automation = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                automation.process_countdown().await;
                for line in tailer.read_new_lines() {
                    automation.process_log_line(&line);
                }
            }
        });
    }
}

/// Finds `label` in the playlist, preferring matches at or after
/// `start_at` and wrapping around to the front.
fn find_label_index(label: &str, lines: &[String], start_at: usize) -> Option<usize> {
    if lines.is_empty() {
        return None;
    }
    let start = start_at.min(lines.len());
    lines[start..]
        .iter()
        .position(|l| l == label)
        .map(|i| i + start)
        .or_else(|| lines[..start].iter().position(|l| l == label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::input::testing::RecordingInput;
    use tempfile::TempDir;

    struct Fixture {
        automation: Arc<PlaylistAutomation>,
        input: Arc<RecordingInput>,
        playlist: Arc<PlaylistFile>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let songs_dir = dir.path().join("usdx").join("songs").join("lib");
        std::fs::create_dir_all(&songs_dir).unwrap();
        for i in 0..6 {
            std::fs::write(
                songs_dir.join(format!("Song_{i}.txt")),
                format!("#ARTIST:Artist{i}\n#TITLE:Title{i}\n"),
            )
            .unwrap();
        }
        let songs = Arc::new(SongIndex::new(
            dir.path().join("songs_index.json"),
            "m4a".into(),
        ));
        songs.scan(&dir.path().join("usdx")).unwrap();
        let playlist = Arc::new(PlaylistFile::new(
            dir.path().join("playlists").join("s.upl"),
        ));
        let input = RecordingInput::shared();
        let automation = Arc::new(PlaylistAutomation::new(
            Arc::clone(&playlist),
            songs,
            Arc::clone(&input) as Arc<dyn InputDriver>,
            Arc::new(CountdownOverlay::new(None)),
            15,
        ));
        Fixture {
            automation,
            input,
            playlist,
            _dir: dir,
        }
    }

    async fn enable_and_open(fx: &Fixture, countdown: u64) {
        fx.automation.set_enabled(true, Some(countdown)).unwrap();
        fx.automation.trigger_immediately(None).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn enabling_seeds_playlist_and_sends_opening_sequence() {
        let fx = fixture();
        enable_and_open(&fx, 2).await;

        assert_eq!(fx.automation.phase(), Phase::NextSongCountdown);
        assert!(fx.playlist.read().len() >= 2);

        let events = fx.input.taken();
        assert_eq!(events.len(), 18);
        assert!(events[..10].iter().all(|e| e == "key:Escape"));
        assert_eq!(
            &events[10..],
            &[
                "key:Return",
                "key:p",
                "key:Return",
                "key:p",
                "key:Return",
                "key:Down",
                "key:Down",
                "key:Return"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_expiry_walks_to_awaiting_song_start() {
        let fx = fixture();
        enable_and_open(&fx, 2).await;
        fx.input.taken();

        tokio::time::advance(Duration::from_secs(3)).await;
        fx.automation.process_countdown().await;
        assert_eq!(fx.automation.phase(), Phase::PlayerSelectionCountdown);

        tokio::time::advance(Duration::from_secs(3)).await;
        fx.automation.process_countdown().await;
        assert_eq!(fx.automation.phase(), Phase::AwaitingSongStart);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_token_does_not_refire() {
        let fx = fixture();
        enable_and_open(&fx, 2).await;
        let stale = fx.automation.state.lock().countdown_token;

        // A re-activation bumps the token.
        fx.automation
            .activate_countdown(Phase::NextSongCountdown, Some(5));
        fx.input.taken();
        fx.automation.on_next_song_expired(stale).await;

        assert_eq!(fx.automation.phase(), Phase::NextSongCountdown);
        assert!(fx.input.taken().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn decoder_events_drive_singing_and_scores_once() {
        let fx = fixture();
        enable_and_open(&fx, 1).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        fx.automation.process_countdown().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        fx.automation.process_countdown().await;
        assert_eq!(fx.automation.phase(), Phase::AwaitingSongStart);

        let line = r#"Using decoder FFmpeg_Decoder for "/songs/unknown.m4a""#;
        fx.automation.process_log_line(line);
        assert_eq!(fx.automation.phase(), Phase::Singing);
        assert_eq!(fx.automation.state.lock().current_index, 1);

        // Two more events reach the trigger threshold exactly once.
        fx.automation.process_log_line(line);
        fx.automation.process_log_line(line);
        assert_eq!(fx.automation.phase(), Phase::ScoresCountdown);
        let token = fx.automation.state.lock().countdown_token;
        fx.automation.process_log_line(line);
        fx.automation.process_log_line(line);
        assert_eq!(fx.automation.state.lock().countdown_token, token);
    }

    #[tokio::test(start_paused = true)]
    async fn status_end_marker_also_starts_the_song() {
        let fx = fixture();
        enable_and_open(&fx, 1).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        fx.automation.process_countdown().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        fx.automation.process_countdown().await;

        fx.automation.process_log_line("STATUS:  End [OnShow]");
        assert_eq!(fx.automation.phase(), Phase::Singing);
    }

    #[tokio::test(start_paused = true)]
    async fn video_line_triggers_scores_while_singing() {
        let fx = fixture();
        enable_and_open(&fx, 1).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        fx.automation.process_countdown().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        fx.automation.process_countdown().await;
        fx.automation.process_log_line("STATUS: End [OnShow]");

        fx.automation.process_log_line("Playing video now");
        assert_eq!(fx.automation.phase(), Phase::ScoresCountdown);
    }

    #[tokio::test(start_paused = true)]
    async fn song_start_timeout_enters_error_state() {
        let fx = fixture();
        enable_and_open(&fx, 1).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        fx.automation.process_countdown().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        fx.automation.process_countdown().await;
        assert_eq!(fx.automation.phase(), Phase::AwaitingSongStart);

        tokio::time::advance(Duration::from_secs(121)).await;
        fx.automation.process_countdown().await;
        let payload = fx.automation.status_payload();
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["automation_phase"], "idle");
    }

    #[tokio::test(start_paused = true)]
    async fn disable_clears_deadlines() {
        let fx = fixture();
        enable_and_open(&fx, 5).await;
        assert!(fx.automation.countdown_scheduled());
        fx.automation.set_enabled(false, None).unwrap();
        assert!(!fx.automation.countdown_scheduled());
        let payload = fx.automation.status_payload();
        assert_eq!(payload["status"], "disabled");
        assert_eq!(payload["enabled"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_input_moves_to_error_state() {
        let fx = fixture();
        enable_and_open(&fx, 1).await;
        fx.input.set_failing(true);
        tokio::time::advance(Duration::from_secs(2)).await;
        fx.automation.process_countdown().await;
        let payload = fx.automation.status_payload();
        assert_eq!(payload["status"], "error");
        assert!(payload["last_error"].as_str().unwrap().contains("confirm"));
    }

    #[tokio::test]
    async fn request_countdown_requires_enabled_and_idle() {
        let fx = fixture();
        let err = fx.automation.request_countdown(None).await.unwrap_err();
        assert_eq!(err.code(), "automation_error");

        enable_and_open(&fx, 5).await;
        let err = fx.automation.request_countdown(None).await.unwrap_err();
        assert!(err.to_string().contains("busy"));
    }

    #[test]
    fn label_index_prefers_start_hint_then_wraps() {
        let lines: Vec<String> = ["A", "B", "A", "C"].iter().map(|s| s.to_string()).collect();
        assert_eq!(find_label_index("A", &lines, 1), Some(2));
        assert_eq!(find_label_index("A", &lines, 3), Some(0));
        assert_eq!(find_label_index("Z", &lines, 0), None);
    }
}
