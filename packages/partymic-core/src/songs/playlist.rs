//! The playlist file: one label per line, serialized behind one lock.
//!
//! The file belongs to the game (it reads it as a playlist), so every
//! mutation is a full read-modify-write under the mutex.

use std::path::PathBuf;

use parking_lot::Mutex;

use super::index::SongIndex;

/// The playlist entry prepared for the next automation cycle.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    /// Index of the entry inside the playlist file.
    pub index: usize,
    /// The playlist label at that index.
    pub label: String,
    /// How many random entries were auto-appended while preparing.
    pub auto_added: usize,
}

/// Serialized manager of the playlist file.
pub struct PlaylistFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PlaylistFile {
    /// Creates a manager for the given playlist path.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn read_unlocked(&self) -> Vec<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                log::error!("[Playlist] Failed to read {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    fn write_unlocked(&self, lines: &[String]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut text = String::new();
        for line in lines {
            if !line.is_empty() {
                text.push_str(line);
                text.push('\n');
            }
        }
        std::fs::write(&self.path, text)
    }

    /// Current playlist lines (trimmed, nonempty).
    pub fn read(&self) -> Vec<String> {
        let _guard = self.lock.lock();
        self.read_unlocked()
    }

    /// Replaces the playlist content.
    pub fn write(&self, lines: &[String]) -> std::io::Result<()> {
        let _guard = self.lock.lock();
        self.write_unlocked(lines)
    }

    /// Creates the file (and parents) and truncates it.
    pub fn reset(&self) -> std::io::Result<()> {
        let _guard = self.lock.lock();
        self.write_unlocked(&[])
    }

    /// Appends `label` unless an identical line is already present.
    /// Returns the resulting lines.
    pub fn append_unique(&self, label: &str) -> std::io::Result<Vec<String>> {
        let _guard = self.lock.lock();
        let mut lines = self.read_unlocked();
        if !lines.iter().any(|l| l == label) {
            lines.push(label.to_string());
            self.write_unlocked(&lines)?;
        }
        Ok(lines)
    }

    /// Removes every line equal to `label`. Returns the resulting lines.
    pub fn remove_matching(&self, label: &str) -> std::io::Result<Vec<String>> {
        let _guard = self.lock.lock();
        let lines = self.read_unlocked();
        let filtered: Vec<String> = lines.iter().filter(|l| *l != label).cloned().collect();
        if filtered.len() != lines.len() {
            self.write_unlocked(&filtered)?;
        }
        Ok(filtered)
    }

    fn append_random_unlocked(
        &self,
        lines: &mut Vec<String>,
        index: &SongIndex,
    ) -> Option<String> {
        let (id, label) = index.random_song_not_in(lines)?;
        lines.push(label.clone());
        if let Err(e) = self.write_unlocked(lines) {
            log::error!("[Playlist] Failed to append random song: {}", e);
            lines.pop();
            return None;
        }
        index.set_in_playlist(id, true);
        Some(label)
    }

    /// Appends one random song from the index; `None` when the pool is
    /// exhausted.
    pub fn append_random(&self, index: &SongIndex) -> Option<String> {
        let _guard = self.lock.lock();
        let mut lines = self.read_unlocked();
        self.append_random_unlocked(&mut lines, index)
    }

    /// Appends random songs until the playlist holds at least
    /// `min_entries` lines or the pool is exhausted. Returns the lines and
    /// the labels that were added.
    pub fn ensure_at_least(
        &self,
        min_entries: usize,
        index: &SongIndex,
    ) -> (Vec<String>, Vec<String>) {
        let min_required = min_entries.max(1);
        let _guard = self.lock.lock();
        let mut lines = self.read_unlocked();
        let mut added = Vec::new();
        while lines.len() < min_required {
            match self.append_random_unlocked(&mut lines, index) {
                Some(label) => added.push(label),
                None => break,
            }
        }
        (lines, added)
    }

    /// Resolves the entry the automation should start next.
    ///
    /// Reads the playlist; if `target_index` is past the end a random
    /// entry is appended first. If the resolved entry is the last line,
    /// another random entry is appended so the game always sees a
    /// successor.
    pub fn prepare_pending(
        &self,
        target_index: usize,
        index: &SongIndex,
    ) -> Result<(PendingEntry, Vec<String>), String> {
        let _guard = self.lock.lock();
        let mut lines = self.read_unlocked();
        let mut auto_added = 0;
        let mut target = target_index;

        if target >= lines.len() && self.append_random_unlocked(&mut lines, index).is_some() {
            auto_added += 1;
        }
        if lines.is_empty() {
            return Err("Playlist is empty".to_string());
        }
        if target >= lines.len() {
            target = lines.len() - 1;
        }
        let label = lines[target].clone();
        if target + 1 >= lines.len() && self.append_random_unlocked(&mut lines, index).is_some() {
            auto_added += 1;
        }
        Ok((
            PendingEntry {
                index: target,
                label,
                auto_added,
            },
            lines,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn playlist_in(dir: &TempDir) -> PlaylistFile {
        PlaylistFile::new(dir.path().join("playlists").join("Session.upl"))
    }

    fn empty_index(dir: &TempDir) -> SongIndex {
        SongIndex::new(dir.path().join("songs_index.json"), "m4a".into())
    }

    fn library_index(dir: &TempDir) -> SongIndex {
        let songs = dir.path().join("usdx").join("songs").join("x");
        std::fs::create_dir_all(&songs).unwrap();
        for i in 0..4 {
            std::fs::write(
                songs.join(format!("Song_{i}.txt")),
                format!("#ARTIST:Artist{i}\n#TITLE:Title{i}\n"),
            )
            .unwrap();
        }
        let index = empty_index(dir);
        index.scan(&dir.path().join("usdx")).unwrap();
        index
    }

    #[test]
    fn append_unique_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let playlist = playlist_in(&dir);
        playlist.append_unique("A : B").unwrap();
        let lines = playlist.append_unique("A : B").unwrap();
        assert_eq!(lines, vec!["A : B"]);
        assert_eq!(playlist.read(), vec!["A : B"]);
    }

    #[test]
    fn remove_matching_deletes_the_line() {
        let dir = TempDir::new().unwrap();
        let playlist = playlist_in(&dir);
        playlist.append_unique("A : B").unwrap();
        playlist.append_unique("C : D").unwrap();
        let lines = playlist.remove_matching("A : B").unwrap();
        assert_eq!(lines, vec!["C : D"]);
    }

    #[test]
    fn reset_truncates() {
        let dir = TempDir::new().unwrap();
        let playlist = playlist_in(&dir);
        playlist.append_unique("A : B").unwrap();
        playlist.reset().unwrap();
        assert!(playlist.read().is_empty());
    }

    #[test]
    fn ensure_at_least_fills_from_the_pool() {
        let dir = TempDir::new().unwrap();
        let playlist = playlist_in(&dir);
        let index = library_index(&dir);
        let (lines, added) = playlist.ensure_at_least(2, &index);
        assert_eq!(lines.len(), 2);
        assert_eq!(added.len(), 2);
        // Added songs are flagged in the index.
        assert_eq!(index.all().iter().filter(|e| e.in_playlist).count(), 2);
    }

    #[test]
    fn ensure_at_least_stops_on_exhausted_pool() {
        let dir = TempDir::new().unwrap();
        let playlist = playlist_in(&dir);
        let index = empty_index(&dir);
        let (lines, added) = playlist.ensure_at_least(2, &index);
        assert!(lines.is_empty());
        assert!(added.is_empty());
    }

    #[test]
    fn prepare_pending_appends_a_successor_for_the_last_entry() {
        let dir = TempDir::new().unwrap();
        let playlist = playlist_in(&dir);
        let index = library_index(&dir);
        playlist.append_unique("Artist0 : Title0").unwrap();

        let (pending, lines) = playlist.prepare_pending(0, &index).unwrap();
        assert_eq!(pending.index, 0);
        assert_eq!(pending.label, "Artist0 : Title0");
        assert_eq!(pending.auto_added, 1);
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn prepare_pending_fails_on_empty_pool_and_playlist() {
        let dir = TempDir::new().unwrap();
        let playlist = playlist_in(&dir);
        let index = empty_index(&dir);
        assert!(playlist.prepare_pending(0, &index).is_err());
    }
}
