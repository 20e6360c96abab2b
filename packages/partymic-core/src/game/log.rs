//! Tailing of the game's log file.
//!
//! The log may not exist yet when the server boots, may be rotated or
//! truncated by the game, and may disappear entirely. The tailer tracks a
//! byte position per file and hands back only the lines appended since
//! the previous read.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Incremental reader over the game's log file.
pub struct LogTailer {
    candidates: Vec<PathBuf>,
    current: Option<PathBuf>,
    position: u64,
}

impl LogTailer {
    /// Builds a tailer probing, in order: the explicit override, the log
    /// inside the game directory, and the conventional home location.
    pub fn new(game_dir: &Path, custom: Option<&Path>) -> Self {
        let mut candidates = Vec::new();
        let mut add = |path: PathBuf| {
            if !candidates.contains(&path) {
                candidates.push(path);
            }
        };
        if let Some(custom) = custom {
            add(custom.to_path_buf());
        }
        add(game_dir.join("Error.log"));
        if let Ok(home) = std::env::var("HOME") {
            add(Path::new(&home).join("usdx").join("Error.log"));
        }

        let mut tailer = Self {
            candidates,
            current: None,
            position: 0,
        };
        if let Some(existing) = tailer.candidates.iter().find(|p| p.exists()).cloned() {
            log::info!("[LogTail] Monitoring game log: {}", existing.display());
            tailer.adopt(existing, true);
        } else if let Some(first) = tailer.candidates.first().cloned() {
            log::warn!(
                "[LogTail] Game log not found yet; will monitor once available ({} candidates)",
                tailer.candidates.len()
            );
            tailer.adopt(first, true);
        }
        tailer
    }

    /// Starts tracking `path`. With `seek_end` the existing content is
    /// skipped so only future lines are reported.
    fn adopt(&mut self, path: PathBuf, seek_end: bool) {
        self.position = if seek_end {
            std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };
        self.current = Some(path);
    }

    /// Re-resolves the tracked file if it vanished; returns whether a
    /// readable file is being tracked.
    fn ensure_file(&mut self) -> bool {
        if let Some(current) = &self.current {
            if current.exists() {
                return true;
            }
        }
        let found = self.candidates.iter().find(|p| p.exists()).cloned();
        match found {
            Some(path) => {
                if self.current.as_ref() != Some(&path) {
                    log::info!("[LogTail] Switching to game log {}", path.display());
                }
                self.adopt(path, true);
                true
            }
            None => false,
        }
    }

    /// Returns the lines appended since the previous call.
    ///
    /// A shrunken file (rotation/truncation) restarts from the beginning;
    /// a vanished file drops the tracked path so the next call re-probes
    /// the candidates.
    pub fn read_new_lines(&mut self) -> Vec<String> {
        if !self.ensure_file() {
            return Vec::new();
        }
        let path = self.current.clone().expect("ensured above");
        let mut file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(_) => {
                log::debug!("[LogTail] {} disappeared; will retry", path.display());
                self.current = None;
                self.position = 0;
                return Vec::new();
            }
        };
        let size = match file.seek(SeekFrom::End(0)) {
            Ok(size) => size,
            Err(_) => return Vec::new(),
        };
        if self.position > size {
            self.position = 0;
        }
        if file.seek(SeekFrom::Start(self.position)).is_err() {
            return Vec::new();
        }
        let mut tail = String::new();
        if file.read_to_string(&mut tail).is_err() {
            return Vec::new();
        }
        self.position = size;
        tail.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn existing_content_is_skipped_on_adoption() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("Error.log");
        append(&log, "old line\n");
        let mut tailer = LogTailer::new(dir.path(), None);
        assert!(tailer.read_new_lines().is_empty());

        append(&log, "fresh line\n");
        assert_eq!(tailer.read_new_lines(), vec!["fresh line"]);
    }

    #[test]
    fn truncation_restarts_from_zero() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("Error.log");
        append(&log, "aaaa\nbbbb\n");
        let mut tailer = LogTailer::new(dir.path(), None);
        assert!(tailer.read_new_lines().is_empty());

        std::fs::write(&log, "cc\n").unwrap();
        assert_eq!(tailer.read_new_lines(), vec!["cc"]);
    }

    #[test]
    fn appearing_file_is_picked_up_later() {
        let dir = TempDir::new().unwrap();
        let mut tailer = LogTailer::new(dir.path(), None);
        assert!(tailer.read_new_lines().is_empty());

        // The candidate was adopted while absent, so reading starts at the
        // beginning once it appears.
        let log = dir.path().join("Error.log");
        append(&log, "first\n");
        assert_eq!(tailer.read_new_lines(), vec!["first"]);
        append(&log, "second\n");
        assert_eq!(tailer.read_new_lines(), vec!["second"]);
    }

    #[test]
    fn explicit_override_wins() {
        let dir = TempDir::new().unwrap();
        let custom = dir.path().join("custom.log");
        append(&custom, "seed\n");
        let mut tailer = LogTailer::new(dir.path(), Some(&custom));
        append(&custom, "tracked\n");
        assert_eq!(tailer.read_new_lines(), vec!["tracked"]);
    }
}
