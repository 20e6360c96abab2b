//! In-memory song index built by scanning the game's song library.
//!
//! Each song is a notation `.txt` with a sibling audio file. The index
//! assigns dense 1-based ids, persists itself as JSON under the data
//! directory, and derives the playlist label (`"<Artist> : <Title>"`)
//! lazily from the notation headers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One scanned song.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SongEntry {
    /// Dense 1-based id.
    pub id: u32,
    /// Path of the karaoke notation file.
    pub txt: PathBuf,
    /// Path of the paired audio file.
    pub audio: PathBuf,
    /// Cosmetic label derived from the filename.
    pub display: String,
    /// Whether the song is currently in the playlist file.
    #[serde(default)]
    pub in_playlist: bool,
    /// Cached playlist label; derived on first use.
    #[serde(skip)]
    label: Option<String>,
}

#[derive(Default)]
struct IndexInner {
    entries: Vec<SongEntry>,
    by_id: HashMap<u32, usize>,
    by_audio: HashMap<PathBuf, usize>,
}

impl IndexInner {
    fn rebuild_maps(&mut self) {
        self.by_id.clear();
        self.by_audio.clear();
        for (pos, entry) in self.entries.iter().enumerate() {
            self.by_id.insert(entry.id, pos);
            self.by_audio.insert(canonical(&entry.audio), pos);
        }
    }
}

/// Scanned song library with id and audio-path lookups.
pub struct SongIndex {
    index_path: PathBuf,
    audio_format: String,
    inner: RwLock<IndexInner>,
}

impl SongIndex {
    /// Creates an empty index persisting to `index_path`.
    pub fn new(index_path: PathBuf, audio_format: String) -> Self {
        Self {
            index_path,
            audio_format,
            inner: RwLock::new(IndexInner::default()),
        }
    }

    /// Number of indexed songs.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recursively scans `game_dir` for notation files under any `songs`
    /// directory, rebuilds the index and persists it.
    pub fn scan(&self, game_dir: &Path) -> std::io::Result<usize> {
        let mut txt_files = Vec::new();
        collect_song_txts(game_dir, false, &mut txt_files);
        txt_files.sort();

        let entries: Vec<SongEntry> = txt_files
            .into_iter()
            .enumerate()
            .map(|(i, txt)| {
                let audio = txt.with_extension(&self.audio_format);
                let display = txt
                    .file_stem()
                    .map(|s| s.to_string_lossy().replace('_', " "))
                    .unwrap_or_default();
                SongEntry {
                    id: (i + 1) as u32,
                    txt,
                    audio,
                    display,
                    in_playlist: false,
                    label: None,
                }
            })
            .collect();
        let count = entries.len();

        {
            let mut inner = self.inner.write();
            inner.entries = entries;
            inner.rebuild_maps();
        }
        self.persist()?;
        log::info!(
            "[Songs] Indexed {} songs under {}",
            count,
            game_dir.display()
        );
        Ok(count)
    }

    /// Writes the index JSON to disk.
    pub fn persist(&self) -> std::io::Result<()> {
        if let Some(parent) = self.index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let inner = self.inner.read();
        let json = serde_json::to_string_pretty(&inner.entries)?;
        std::fs::write(&self.index_path, json)
    }

    /// Loads the persisted index JSON, replacing the in-memory state.
    pub fn load(&self) -> std::io::Result<usize> {
        let text = std::fs::read_to_string(&self.index_path)?;
        let entries: Vec<SongEntry> = serde_json::from_str(&text)?;
        let count = entries.len();
        let mut inner = self.inner.write();
        inner.entries = entries;
        inner.rebuild_maps();
        Ok(count)
    }

    /// All entries, cloned.
    pub fn all(&self) -> Vec<SongEntry> {
        self.inner.read().entries.clone()
    }

    /// Entry by id.
    pub fn get(&self, id: u32) -> Option<SongEntry> {
        let inner = self.inner.read();
        inner.by_id.get(&id).map(|&pos| inner.entries[pos].clone())
    }

    /// Entry whose audio file matches `path` after canonicalization.
    pub fn get_by_audio(&self, path: &Path) -> Option<SongEntry> {
        let key = canonical(path);
        let inner = self.inner.read();
        inner
            .by_audio
            .get(&key)
            .map(|&pos| inner.entries[pos].clone())
    }

    /// Case-insensitive substring search over display labels, paged.
    pub fn search(&self, query: &str, page: usize, per_page: usize) -> (usize, Vec<SongEntry>) {
        let needle = query.to_lowercase();
        let inner = self.inner.read();
        let matches: Vec<&SongEntry> = inner
            .entries
            .iter()
            .filter(|e| needle.is_empty() || e.display.to_lowercase().contains(&needle))
            .collect();
        let total = matches.len();
        let page = page.max(1);
        let start = (page - 1).saturating_mul(per_page);
        let items = matches
            .into_iter()
            .skip(start)
            .take(per_page)
            .cloned()
            .collect();
        (total, items)
    }

    /// Flips the `in_playlist` flag and re-persists the index.
    pub fn set_in_playlist(&self, id: u32, value: bool) {
        {
            let mut inner = self.inner.write();
            if let Some(&pos) = inner.by_id.get(&id) {
                inner.entries[pos].in_playlist = value;
            }
        }
        if let Err(e) = self.persist() {
            log::warn!("[Songs] Failed to persist index after playlist flip: {}", e);
        }
    }

    /// The playlist label of a song: the cached value, else
    /// `#ARTIST`/`#TITLE` parsed from the notation file, else the display
    /// fallback, normalized.
    pub fn label_for(&self, id: u32) -> Option<String> {
        {
            let inner = self.inner.read();
            let &pos = inner.by_id.get(&id)?;
            if let Some(cached) = &inner.entries[pos].label {
                return Some(cached.clone());
            }
        }
        let entry = self.get(id)?;
        let raw = parse_artist_title(&entry.txt)
            .or_else(|| (!entry.display.is_empty()).then(|| entry.display.clone()))
            .or_else(|| {
                entry
                    .txt
                    .file_stem()
                    .map(|s| s.to_string_lossy().replace('_', " "))
            })?;
        let label = normalize_playlist_label(&raw)?;
        let mut inner = self.inner.write();
        if let Some(&pos) = inner.by_id.get(&id) {
            inner.entries[pos].label = Some(label.clone());
        }
        Some(label)
    }

    /// Picks a random song whose label is not in `present`.
    ///
    /// Tries up to 64 distinct candidates; returns the id and label.
    pub fn random_song_not_in(&self, present: &[String]) -> Option<(u32, String)> {
        let ids: Vec<u32> = {
            let inner = self.inner.read();
            inner.entries.iter().map(|e| e.id).collect()
        };
        if ids.is_empty() {
            return None;
        }
        let mut attempts = ids.len().min(64);
        let mut seen = Vec::new();
        while attempts > 0 {
            let id = ids[fastrand::usize(..ids.len())];
            if seen.contains(&id) {
                attempts -= 1;
                continue;
            }
            seen.push(id);
            match self.label_for(id) {
                Some(label) if !present.contains(&label) => return Some((id, label)),
                _ => attempts -= 1,
            }
        }
        None
    }
}

/// Collapses a raw label into the canonical `"<a> : <b>"` form.
///
/// Labels already containing `" : "` are re-joined around the first `:`;
/// `" - "` separators are converted to `" : "`. Anything else passes
/// through trimmed.
pub fn normalize_playlist_label(raw: &str) -> Option<String> {
    let label = raw.trim();
    if label.is_empty() {
        return None;
    }
    if label.contains(" : ") {
        if let Some((artist, title)) = label.split_once(':') {
            return Some(format!("{} : {}", artist.trim(), title.trim()));
        }
    }
    if label.contains(" - ") {
        if let Some((artist, title)) = label.split_once('-') {
            let artist = artist.trim();
            let title = title.trim();
            if !artist.is_empty() && !title.is_empty() {
                return Some(format!("{artist} : {title}"));
            }
        }
    }
    Some(label.to_string())
}

/// Reads `#ARTIST:` / `#TITLE:` headers (case-insensitive, first
/// occurrence each) from a notation file.
fn parse_artist_title(txt: &Path) -> Option<String> {
    let text = std::fs::read_to_string(txt).ok()?;
    let mut artist: Option<String> = None;
    let mut title: Option<String> = None;
    for line in text.lines() {
        let s = line.trim();
        if s.is_empty() {
            continue;
        }
        let upper = s.to_uppercase();
        if upper.starts_with("#ARTIST") && artist.is_none() {
            artist = s.split_once(':').map(|(_, v)| v.trim().to_string());
        } else if upper.starts_with("#TITLE") && title.is_none() {
            title = s.split_once(':').map(|(_, v)| v.trim().to_string());
        }
        if artist.is_some() && title.is_some() {
            break;
        }
    }
    match (artist, title) {
        (Some(a), Some(t)) => Some(format!("{a} : {t}")),
        (Some(a), None) => Some(a),
        (None, Some(t)) => Some(t),
        (None, None) => None,
    }
}

/// Recursive walk collecting `.txt` files that sit below a `songs`
/// directory component.
fn collect_song_txts(dir: &Path, under_songs: bool, out: &mut Vec<PathBuf>) {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let in_songs = under_songs || entry.file_name() == "songs";
            collect_song_txts(&path, in_songs, out);
        } else if under_songs && path.extension().is_some_and(|ext| ext == "txt") {
            out.push(path);
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_library(dir: &TempDir) -> PathBuf {
        let songs = dir.path().join("usdx").join("songs").join("Artist - Song");
        std::fs::create_dir_all(&songs).unwrap();
        std::fs::write(
            songs.join("Queen_Bohemian.txt"),
            "#ARTIST:Queen\n#TITLE:Bohemian Rhapsody\n: 0 4 0 Some\n",
        )
        .unwrap();
        std::fs::write(songs.join("Untagged_Song.txt"), ": 0 4 0 hm\n").unwrap();
        // Not under songs/: must be ignored.
        std::fs::write(dir.path().join("usdx").join("readme.txt"), "no").unwrap();
        dir.path().join("usdx")
    }

    fn index_in(dir: &TempDir) -> SongIndex {
        SongIndex::new(dir.path().join("data").join("songs_index.json"), "m4a".into())
    }

    #[test]
    fn scan_assigns_dense_ids_and_audio_paths() {
        let dir = TempDir::new().unwrap();
        let game_dir = build_library(&dir);
        let index = index_in(&dir);
        assert_eq!(index.scan(&game_dir).unwrap(), 2);

        let first = index.get(1).unwrap();
        assert_eq!(first.audio.extension().unwrap(), "m4a");
        assert!(first.display.contains(' ') || !first.display.contains('_'));
        assert!(index.get(3).is_none());
    }

    #[test]
    fn scan_persist_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let game_dir = build_library(&dir);
        let index = index_in(&dir);
        index.scan(&game_dir).unwrap();
        let serialized = std::fs::read_to_string(dir.path().join("data/songs_index.json")).unwrap();

        let reloaded = index_in(&dir);
        assert_eq!(reloaded.load().unwrap(), 2);
        reloaded.persist().unwrap();
        let reserialized =
            std::fs::read_to_string(dir.path().join("data/songs_index.json")).unwrap();
        assert_eq!(serialized, reserialized);
    }

    #[test]
    fn label_prefers_notation_headers() {
        let dir = TempDir::new().unwrap();
        let game_dir = build_library(&dir);
        let index = index_in(&dir);
        index.scan(&game_dir).unwrap();

        let tagged = index
            .all()
            .into_iter()
            .find(|e| e.display.contains("Bohemian"))
            .unwrap();
        assert_eq!(
            index.label_for(tagged.id).unwrap(),
            "Queen : Bohemian Rhapsody"
        );

        let untagged = index
            .all()
            .into_iter()
            .find(|e| e.display.contains("Untagged"))
            .unwrap();
        assert_eq!(index.label_for(untagged.id).unwrap(), "Untagged Song");
    }

    #[test]
    fn normalize_converts_dash_form() {
        assert_eq!(
            normalize_playlist_label("ABBA - Waterloo").unwrap(),
            "ABBA : Waterloo"
        );
        assert_eq!(
            normalize_playlist_label(" Queen :  Bohemian ").unwrap(),
            "Queen : Bohemian"
        );
        assert_eq!(normalize_playlist_label("Solo").unwrap(), "Solo");
        assert!(normalize_playlist_label("   ").is_none());
    }

    #[test]
    fn search_pages_matches() {
        let dir = TempDir::new().unwrap();
        let game_dir = build_library(&dir);
        let index = index_in(&dir);
        index.scan(&game_dir).unwrap();

        let (total, items) = index.search("bohemian", 1, 10);
        assert_eq!(total, 1);
        assert_eq!(items.len(), 1);

        let (total, items) = index.search("", 2, 1);
        assert_eq!(total, 2);
        assert_eq!(items.len(), 1);

        let (total, _) = index.search("no-such-song", 1, 10);
        assert_eq!(total, 0);
    }

    #[test]
    fn random_pick_skips_present_labels() {
        let dir = TempDir::new().unwrap();
        let game_dir = build_library(&dir);
        let index = index_in(&dir);
        index.scan(&game_dir).unwrap();

        let present = vec!["Queen : Bohemian Rhapsody".to_string()];
        for _ in 0..10 {
            if let Some((_, label)) = index.random_song_not_in(&present) {
                assert_ne!(label, present[0]);
            }
        }
        let all: Vec<String> = index
            .all()
            .iter()
            .filter_map(|e| index.label_for(e.id))
            .collect();
        assert!(index.random_song_not_in(&all).is_none());
    }
}
