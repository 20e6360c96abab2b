//! Atomic rewriting of the game's `config.ini`.
//!
//! The game's parser is whitespace-sensitive: keys keep their case and
//! `=` carries no surrounding spaces. The document model preserves the
//! order of sections and keys so a rewrite only changes what it must.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

/// Errors from game-config rewriting.
#[derive(Debug, Error)]
pub enum GameConfigError {
    /// The referenced config file does not exist.
    #[error("config file not found: {0}")]
    Missing(PathBuf),

    /// Read/write failure.
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One `[Section]` with its ordered key/value entries.
#[derive(Debug, Clone, Default)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }
}

/// An order- and case-preserving config document.
#[derive(Debug, Clone, Default)]
struct IniDocument {
    sections: Vec<Section>,
}

impl IniDocument {
    fn parse(text: &str) -> Self {
        let mut doc = Self::default();
        let mut current: Option<Section> = None;
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
                continue;
            }
            if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                if let Some(section) = current.take() {
                    doc.sections.push(section);
                }
                current = Some(Section {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                continue;
            }
            if let Some((key, value)) = trimmed.split_once('=') {
                if let Some(section) = current.as_mut() {
                    section
                        .entries
                        .push((key.trim().to_string(), value.trim().to_string()));
                }
            }
        }
        if let Some(section) = current {
            doc.sections.push(section);
        }
        doc
    }

    fn section_mut(&mut self, name: &str) -> &mut Section {
        if let Some(pos) = self.sections.iter().position(|s| s.name == name) {
            return &mut self.sections[pos];
        }
        self.sections.push(Section {
            name: name.to_string(),
            entries: Vec::new(),
        });
        self.sections.last_mut().unwrap()
    }

    fn set(&mut self, section: &str, key: &str, value: &str) {
        self.section_mut(section).set(key, value);
    }

    fn remove_keys_with_prefixes(&mut self, section: &str, prefixes: &[&str]) {
        if let Some(section) = self.sections.iter_mut().find(|s| s.name == section) {
            section
                .entries
                .retain(|(k, _)| !prefixes.iter().any(|p| k.starts_with(p)));
        }
    }

    /// Serializes with no whitespace around `=`, one blank line after each
    /// section.
    fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            let _ = writeln!(out, "[{}]", section.name);
            for (key, value) in &section.entries {
                let _ = writeln!(out, "{key}={value}");
            }
            out.push('\n');
        }
        out
    }

    #[cfg(test)]
    fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.name == section)?
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Roster of one numbered mic room as the game config sees it.
#[derive(Debug, Clone, Default)]
pub struct MicSlot {
    /// Display names of the members, insertion-ordered.
    pub names: Vec<String>,
    /// Mean audio delay of the members in milliseconds.
    pub mean_delay_ms: i64,
}

/// Writer for the game's `config.ini`.
///
/// All rewrites go through a mutex and land atomically (`.tmp` + rename).
pub struct GameConfig {
    path: PathBuf,
    lock: Mutex<()>,
}

impl GameConfig {
    /// Creates a writer for the given config path.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn rewrite(&self, mutate: impl FnOnce(&mut IniDocument)) -> Result<(), GameConfigError> {
        let _guard = self.lock.lock();
        if !self.path.exists() {
            return Err(GameConfigError::Missing(self.path.clone()));
        }
        let text = std::fs::read_to_string(&self.path)?;
        let mut doc = IniDocument::parse(&text);
        mutate(&mut doc);
        let tmp = tmp_path(&self.path);
        let result = std::fs::write(&tmp, doc.render())
            .and_then(|()| std::fs::rename(&tmp, &self.path));
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result.map_err(Into::into)
    }

    /// Rewrites `[Name]`, `[PlayerDelay]` and `[Game].Players` from the
    /// current mic rosters.
    pub fn update_players(&self, slots: &[MicSlot; 6]) -> Result<(), GameConfigError> {
        let names: Vec<String> = slots
            .iter()
            .map(|slot| {
                if slot.names.is_empty() {
                    "None".to_string()
                } else {
                    slot.names.join(" & ")
                }
            })
            .collect();
        let highest = names.iter().rposition(|n| n != "None").map_or(0, |i| i + 1);
        let players = players_value(highest);

        self.rewrite(|doc| {
            for (i, name) in names.iter().enumerate() {
                doc.set("Name", &format!("P{}", i + 1), name);
            }
            for (i, slot) in slots.iter().enumerate() {
                let delay = if slot.names.is_empty() {
                    0
                } else {
                    slot.mean_delay_ms
                };
                doc.set("PlayerDelay", &format!("P{}", i + 1), &delay.to_string());
            }
            doc.set("Game", "Players", players);
        })?;
        log::info!(
            "[GameConfig] Updated players: P1..P6={:?} Players={}",
            names,
            players
        );
        Ok(())
    }

    /// Rewrites the `[Record]` section to point at the virtual sinks.
    ///
    /// Drops every existing device/input/latency/channel key first.
    pub fn initialize_record_section(
        &self,
        sink_name: impl Fn(usize) -> String,
    ) -> Result<(), GameConfigError> {
        self.rewrite(|doc| {
            doc.remove_keys_with_prefixes(
                "Record",
                &["DeviceName", "Input", "Latency", "Channel1", "Channel2"],
            );
            // The section must exist even when it had no keys to drop.
            doc.section_mut("Record");
            for i in 1..6 {
                let sink = sink_name(i);
                doc.set(
                    "Record",
                    &format!("DeviceName[{i}]"),
                    &format!("{sink} Audio/Source/Virtual sink"),
                );
                doc.set("Record", &format!("Input[{i}]"), "0");
                doc.set("Record", &format!("Latency[{i}]"), "-1");
                doc.set("Record", &format!("Channel1[{i}]"), &i.to_string());
            }
        })?;
        log::info!("[GameConfig] Initialized [Record] section for virtual sinks");
        Ok(())
    }
}

/// The game's `Players` value from the highest occupied mic index.
///
/// `0 -> 1`, `1..=4 -> H`, `5..=6 -> 6`. The 5-to-6 jump is a quirk of the
/// game's player-count screen; it is intentional.
fn players_value(highest: usize) -> &'static str {
    match highest {
        0 => "1",
        1 => "1",
        2 => "2",
        3 => "3",
        4 => "4",
        _ => "6",
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "\
[Game]\nLanguage=English\nPlayers=1\n\n[Name]\nP1=Player1\n\n[Record]\nDeviceName[1]=old device\nInput[1]=1\n";

    fn write_sample(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("config.ini");
        std::fs::write(&path, SAMPLE).unwrap();
        path
    }

    fn slots(occupied: &[(usize, &[&str], i64)]) -> [MicSlot; 6] {
        let mut slots: [MicSlot; 6] = Default::default();
        for &(index, names, delay) in occupied {
            slots[index] = MicSlot {
                names: names.iter().map(|s| s.to_string()).collect(),
                mean_delay_ms: delay,
            };
        }
        slots
    }

    #[test]
    fn players_mapping_follows_highest_mic() {
        assert_eq!(players_value(0), "1");
        assert_eq!(players_value(1), "1");
        assert_eq!(players_value(3), "3");
        assert_eq!(players_value(4), "4");
        assert_eq!(players_value(5), "6");
        assert_eq!(players_value(6), "6");
    }

    #[test]
    fn render_has_no_spaces_around_equals() {
        let doc = IniDocument::parse(SAMPLE);
        let rendered = doc.render();
        assert!(rendered.contains("Language=English"));
        assert!(!rendered.contains(" = "));
        // Round trip is stable.
        assert_eq!(IniDocument::parse(&rendered).render(), rendered);
    }

    #[test]
    fn update_players_writes_roster_and_count() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let config = GameConfig::new(path.clone());

        config
            .update_players(&slots(&[(1, &["Ada", "Bob"], 120), (4, &["Eve"], 0)]))
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let doc = IniDocument::parse(&text);
        assert_eq!(doc.get("Name", "P2"), Some("Ada & Bob"));
        assert_eq!(doc.get("Name", "P1"), Some("None"));
        assert_eq!(doc.get("PlayerDelay", "P2"), Some("120"));
        assert_eq!(doc.get("PlayerDelay", "P1"), Some("0"));
        // Highest occupied mic is 5 -> Players jumps to 6... here mic5 is
        // index 4 (P5), so Players=6.
        assert_eq!(doc.get("Game", "Players"), Some("6"));
        assert!(!path.with_extension("ini.tmp").exists());
    }

    #[test]
    fn update_players_empty_roster_defaults_to_one() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let config = GameConfig::new(path.clone());
        config.update_players(&slots(&[])).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Players=1"));
    }

    #[test]
    fn record_section_replaces_previous_devices() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let config = GameConfig::new(path.clone());
        config
            .initialize_record_section(|i| format!("partymic-mic-{i}-sink"))
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("old device"));
        assert!(text.contains("DeviceName[1]=partymic-mic-1-sink Audio/Source/Virtual sink"));
        assert!(text.contains("Latency[5]=-1"));
        assert!(!text.contains("DeviceName[6]"));
    }

    #[test]
    fn missing_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config = GameConfig::new(dir.path().join("absent.ini"));
        assert!(matches!(
            config.update_players(&slots(&[])),
            Err(GameConfigError::Missing(_))
        ));
    }
}
