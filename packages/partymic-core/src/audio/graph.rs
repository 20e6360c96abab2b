//! Narrow facade over the external audio-graph tooling.
//!
//! Virtual sinks are managed with `pactl`; port discovery and wiring use
//! `pw-link`. Every operation shells out, captures the tool's output, and
//! converts failures into [`GraphError`]. A missing tool is a returned
//! error, never a panic.

use std::collections::BTreeMap;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

use super::Channel;

/// Errors from the audio-graph tools.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The tool binary could not be executed at all.
    #[error("{0} not available")]
    ToolUnavailable(String),

    /// The tool ran but reported a failure.
    #[error("{tool} failed: {detail}")]
    CommandFailed { tool: String, detail: String },

    /// I/O error while talking to the tool.
    #[error("audio graph io error: {0}")]
    Io(String),
}

/// Result alias for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// Facade over `pactl` / `pw-link`.
///
/// Stateless: the global port table lives in the audio daemon, so every
/// call re-reads it.
#[derive(Debug, Default, Clone)]
pub struct AudioGraph;

impl AudioGraph {
    /// Creates the adapter.
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, tool: &str, args: &[&str]) -> GraphResult<String> {
        let output = Command::new(tool)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    GraphError::ToolUnavailable(tool.to_string())
                } else {
                    GraphError::Io(e.to_string())
                }
            })?;
        if !output.status.success() {
            return Err(GraphError::CommandFailed {
                tool: tool.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Ensures each named virtual source-class sink exists.
    ///
    /// Idempotent: sinks already present in `pactl list short sinks` are
    /// not recreated.
    pub async fn ensure_sinks(&self, names: &[String]) -> GraphResult<()> {
        let existing = self.run("pactl", &["list", "short", "sinks"]).await?;
        for name in names {
            if existing.contains(name.as_str()) {
                log::debug!("[Graph] Virtual sink '{}' already exists", name);
                continue;
            }
            log::debug!("[Graph] Creating virtual sink '{}'", name);
            let sink_arg = format!("sink_name={name}");
            self.run(
                "pactl",
                &[
                    "load-module",
                    "module-null-sink",
                    "media.class=Audio/Source/Virtual",
                    &sink_arg,
                    "channel_map=front-left,front-right",
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Unloads every loaded `module-null-sink` module.
    ///
    /// Startup cleanup: removes leftover sinks from prior runs. Individual
    /// unload failures are logged and skipped.
    pub async fn unload_all_null_sinks(&self) -> GraphResult<()> {
        let listing = self.run("pactl", &["list", "short", "modules"]).await?;
        for module_id in parse_null_sink_modules(&listing) {
            match self.run("pactl", &["unload-module", &module_id]).await {
                Ok(_) => log::debug!("[Graph] Unloaded null-sink module {}", module_id),
                Err(e) => log::warn!("[Graph] Failed to unload module {}: {}", module_id, e),
            }
        }
        Ok(())
    }

    /// Lists output ports whose name contains `substr` (case-insensitive),
    /// keyed by numeric port id.
    pub async fn list_output_ports(&self, substr: &str) -> GraphResult<BTreeMap<u32, String>> {
        let listing = self.run("pw-link", &["-I", "-o"]).await?;
        Ok(parse_output_ports(&listing, substr))
    }

    /// Links a numeric source port to `<sink>:input_<channel>`.
    ///
    /// Uses the blocking form (`-w`) so the link is established before the
    /// call returns.
    pub async fn link(&self, port_id: u32, sink: &str, channel: Channel) -> GraphResult<()> {
        let source = port_id.to_string();
        let target = format!("{sink}:input_{}", channel.as_str());
        log::debug!("[Graph] pw-link -w {} {}", source, target);
        self.run("pw-link", &["-w", &source, &target]).await?;
        Ok(())
    }

    /// Links a source port by name to `<sink>:input_<channel>`.
    ///
    /// Fallback path for when numeric port ids were never discovered.
    pub async fn link_named(
        &self,
        source_port: &str,
        sink: &str,
        channel: Channel,
    ) -> GraphResult<()> {
        let target = format!("{sink}:input_{}", channel.as_str());
        log::debug!("[Graph] pw-link -w {} {}", source_port, target);
        self.run("pw-link", &["-w", source_port, &target]).await?;
        Ok(())
    }

    /// Removes every connection currently attached to `port_id`.
    ///
    /// Reads the full link listing, finds the block for the owning port
    /// (identified by `owner_substr` in its name), and deletes each peer
    /// link id found in the connection lines below it.
    pub async fn unlink(&self, port_id: u32, owner_substr: &str) -> GraphResult<usize> {
        let listing = self.run("pw-link", &["-I", "-l"]).await?;
        let peers = parse_connected_peers(&listing, port_id, owner_substr);
        if peers.is_empty() {
            log::debug!("[Graph] No connected peers for port {}", port_id);
            return Ok(0);
        }
        let mut removed = 0;
        for peer in peers {
            let id = peer.to_string();
            match self.run("pw-link", &["-d", &id]).await {
                Ok(_) => removed += 1,
                Err(e) => log::warn!("[Graph] pw-link -d {} failed: {}", id, e),
            }
        }
        Ok(removed)
    }
}

/// Extracts module ids of loaded `module-null-sink` rows from
/// `pactl list short modules` output.
fn parse_null_sink_modules(listing: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for line in listing.lines() {
        if !line.contains("module-null-sink") {
            continue;
        }
        let mut parts = line.split_whitespace();
        if let Some(id) = parts.next() {
            if parts.next().is_some() && id.chars().all(|c| c.is_ascii_digit()) {
                ids.push(id.to_string());
            }
        }
    }
    ids
}

/// Parses `pw-link -I -o` output into `port_id -> port_name` for names
/// containing `substr` (case-insensitive).
fn parse_output_ports(listing: &str, substr: &str) -> BTreeMap<u32, String> {
    let needle = substr.to_lowercase();
    let mut ports = BTreeMap::new();
    for line in listing.lines() {
        let trimmed = line.trim_start();
        let Some((id_str, name)) = trimmed.split_once(char::is_whitespace) else {
            continue;
        };
        let Ok(id) = id_str.parse::<u32>() else {
            continue;
        };
        let name = name.trim();
        if name.to_lowercase().contains(&needle) {
            ports.insert(id, name.to_string());
        }
    }
    ports
}

/// Finds the peer link ids connected to `port_id` in `pw-link -I -l` output.
///
/// The listing shows each port followed by indented `|->` / `|<-` rows for
/// its connections; the leading number on those rows is the link id to
/// pass to `pw-link -d`.
fn parse_connected_peers(listing: &str, port_id: u32, owner_substr: &str) -> Vec<u32> {
    let lines: Vec<&str> = listing.lines().collect();
    let needle = owner_substr.to_lowercase();
    let port_prefix = port_id.to_string();

    let mut start = None;
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        let is_port_line = trimmed
            .strip_prefix(&port_prefix)
            .is_some_and(|rest| rest.starts_with(char::is_whitespace));
        if is_port_line && trimmed.to_lowercase().contains(&needle) {
            start = Some(i);
            break;
        }
    }
    let Some(start) = start else {
        return Vec::new();
    };

    let mut peers = Vec::new();
    for line in &lines[start + 1..] {
        if !line.contains("|->") && !line.contains("|<-") {
            break;
        }
        let trimmed = line.trim_start();
        let id_str: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(id) = id_str.parse::<u32>() {
            if !peers.contains(&id) {
                peers.push(id);
            }
        }
    }
    peers
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORT_LISTING: &str = "\
 131  alsa_output.pci:playback_FL\n\
 132  ingress-42:output_FR\n\
 133  ingress-42:output_FL\n\
 140  ingress-7:output_FL\n";

    #[test]
    fn output_ports_filter_by_substring() {
        let ports = parse_output_ports(PORT_LISTING, "ingress-42");
        assert_eq!(ports.len(), 2);
        assert_eq!(ports.get(&133).map(String::as_str), Some("ingress-42:output_FL"));
        assert!(!ports.contains_key(&140));
    }

    #[test]
    fn output_ports_match_case_insensitively() {
        let ports = parse_output_ports(PORT_LISTING, "INGRESS-7");
        assert_eq!(ports.len(), 1);
        assert!(ports.contains_key(&140));
    }

    #[test]
    fn null_sink_modules_are_extracted() {
        let listing = "\
12\tmodule-null-sink\tsink_name=partymic-mic-0-sink\n\
13\tmodule-native-protocol-unix\t\n\
19\tmodule-null-sink\tsink_name=partymic-mic-1-sink\n";
        assert_eq!(parse_null_sink_modules(listing), vec!["12", "19"]);
    }

    #[test]
    fn connected_peers_are_scanned_below_the_port_line() {
        let listing = "\
 133  ingress-42:output_FL\n\
  201 |-> partymic-mic-2-sink:input_FL\n\
  202 |-> partymic-mic-0-sink:input_FL\n\
 132  ingress-42:output_FR\n\
  205 |-> partymic-mic-2-sink:input_FR\n";
        assert_eq!(parse_connected_peers(listing, 133, "ingress-42"), vec![201, 202]);
        assert_eq!(parse_connected_peers(listing, 132, "ingress-42"), vec![205]);
    }

    #[test]
    fn connected_peers_empty_when_port_missing() {
        assert!(parse_connected_peers("", 99, "ingress-99").is_empty());
    }

    #[test]
    fn connected_peers_stop_at_next_port_block() {
        let listing = "\
 133  ingress-42:output_FL\n\
 134  something-else:output_FL\n\
  300 |-> partymic-mic-1-sink:input_FL\n";
        assert!(parse_connected_peers(listing, 133, "ingress-42").is_empty());
    }
}
