//! Lifecycle of one audio-ingress child process for a session.
//!
//! The child consumes the client's WebRTC media stream and exposes its
//! audio as output ports in the external graph. The SDP handshake runs
//! over the child's stdin/stdout in base64-encoded JSON; the child emits
//! the answer split across multiple stdout lines, so nonempty lines after
//! the connection marker are concatenated and repeatedly attempted as a
//! base64 decode until one parses.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use super::graph::AudioGraph;
use super::Channel;

/// Marker the child prints before it starts emitting the base64 answer.
const ANSWER_MARKER: &str = "Connection State has changed checking";

/// Port discovery retry schedule: 300 attempts at 50ms (~15s).
const DISCOVERY_ATTEMPTS: u32 = 300;
const DISCOVERY_INTERVAL: Duration = Duration::from_millis(50);

/// Errors from ingress supervision.
#[derive(Debug, Error)]
pub enum IngressError {
    /// The client supplied an empty SDP offer.
    #[error("Offer must not be empty")]
    EmptyOffer,

    /// The ingress binary is not present or not executable.
    #[error("ingress binary not available: {0}")]
    BinaryMissing(String),

    /// Spawning the child failed.
    #[error("failed to start ingress child: {0}")]
    Spawn(String),

    /// The offer could not be delivered or no answer was produced.
    #[error("ingress handshake failed: {0}")]
    Handshake(String),

    /// The child exited before completing the handshake.
    #[error("ingress child exited: {0}")]
    ChildExited(String),
}

/// The negotiated SDP answer, in both decoded and wire form.
#[derive(Debug, Clone)]
pub struct IngressAnswer {
    /// Decoded SDP payload.
    pub sdp: String,
    /// The base64 wire form as emitted by the child.
    pub encoded: String,
}

/// Supervisor for exactly one ingress child process.
pub struct IngressSupervisor {
    session_id: u64,
    link_name: String,
    binary: PathBuf,
    graph: AudioGraph,
    child: Mutex<Option<Child>>,
    ports: RwLock<HashMap<Channel, Vec<u32>>>,
    started_at: Mutex<Option<Instant>>,
}

impl IngressSupervisor {
    /// Creates a supervisor for the session. Nothing is spawned until
    /// [`IngressSupervisor::start`].
    pub fn new(session_id: u64, binary: PathBuf, graph: AudioGraph) -> Self {
        Self {
            session_id,
            link_name: format!("ingress-{session_id}"),
            binary,
            graph,
            child: Mutex::new(None),
            ports: RwLock::new(HashMap::new()),
            started_at: Mutex::new(None),
        }
    }

    /// Stable label identifying this ingress's ports in the graph.
    pub fn link_name(&self) -> &str {
        &self.link_name
    }

    /// Session this ingress belongs to.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Discovered ports per channel. Empty until discovery completes.
    pub fn ports(&self) -> HashMap<Channel, Vec<u32>> {
        self.ports.read().clone()
    }

    /// When the child was spawned; `None` before the first start.
    pub fn started_at(&self) -> Option<Instant> {
        *self.started_at.lock()
    }

    /// Spawns the child, performs the offer/answer handshake and returns
    /// the answer together with a snapshot of the graph ports that existed
    /// before the child created its own.
    ///
    /// Port discovery is NOT run here; the caller schedules
    /// [`IngressSupervisor::discover_ports`] on a background task so the
    /// answer can be returned to the client immediately.
    pub async fn start(
        &self,
        offer: &str,
    ) -> Result<(IngressAnswer, BTreeMap<u32, String>), IngressError> {
        if offer.trim().is_empty() {
            return Err(IngressError::EmptyOffer);
        }
        if !self.binary.exists() {
            return Err(IngressError::BinaryMissing(
                self.binary.display().to_string(),
            ));
        }

        log::debug!(
            "[Ingress {}] Launching {} --link-name {}",
            self.session_id,
            self.binary.display(),
            self.link_name
        );
        let mut child = Command::new(&self.binary)
            .arg("--pulse-buf")
            .arg("20ms")
            .arg("--link-name")
            .arg(&self.link_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| IngressError::Spawn(e.to_string()))?;

        *self.started_at.lock() = Some(Instant::now());

        // Snapshot ports before the child enumerates its own, so discovery
        // can diff against them.
        let existing = self
            .graph
            .list_output_ports(&self.link_name)
            .await
            .unwrap_or_default();

        // Stream the child's stderr to the server log verbatim.
        if let Some(stderr) = child.stderr.take() {
            let session_id = self.session_id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("[Ingress {}][stderr] {}", session_id, line);
                }
            });
        }

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| IngressError::Spawn("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IngressError::Spawn("child stdout unavailable".into()))?;

        *self.child.lock() = Some(child);

        // The child expects the offer as one base64 line of {"sdp", "type"}.
        let offer_json = json!({ "sdp": offer, "type": "offer" }).to_string();
        let offer_b64 = base64::engine::general_purpose::STANDARD.encode(offer_json);
        let write_result = async {
            stdin.write_all(offer_b64.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        drop(stdin);
        if let Err(e) = write_result {
            return Err(IngressError::Handshake(format!(
                "failed to send offer: {e}"
            )));
        }

        let mut lines = BufReader::new(stdout).lines();
        let mut expecting_answer = false;
        let mut buffer: Vec<String> = Vec::new();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return Err(IngressError::ChildExited(
                        "stdout closed before answer".into(),
                    ));
                }
                Err(e) => return Err(IngressError::Handshake(e.to_string())),
            };
            let stripped = line.trim();
            log::debug!("[Ingress {}][stdout] {}", self.session_id, stripped);
            if stripped.contains(ANSWER_MARKER) {
                expecting_answer = true;
                buffer.clear();
                continue;
            }
            if expecting_answer && !stripped.is_empty() {
                buffer.push(stripped.to_string());
                if let Some(answer) = try_decode_answer(&buffer) {
                    log::info!("[Ingress {}] Received answer from child", self.session_id);
                    return Ok((answer, existing));
                }
            }
        }
    }

    /// Background port discovery: retries the graph listing until ports
    /// matching the link name appear, classifies them by channel suffix
    /// and records them.
    pub async fn discover_ports(&self, existing: BTreeMap<u32, String>) {
        let mut created: BTreeMap<u32, String> = BTreeMap::new();
        for attempt in 0..DISCOVERY_ATTEMPTS {
            match self.graph.list_output_ports(&self.link_name).await {
                Ok(current) => {
                    created = current
                        .into_iter()
                        .filter(|(id, _)| !existing.contains_key(id))
                        .collect();
                    if !created.is_empty() {
                        log::debug!(
                            "[Ingress {}] Ports appeared on attempt {}: {:?}",
                            self.session_id,
                            attempt + 1,
                            created
                        );
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("[Ingress {}] Port listing failed: {}", self.session_id, e)
                }
            }
            tokio::time::sleep(DISCOVERY_INTERVAL).await;
        }

        if created.is_empty() {
            log::warn!(
                "[Ingress {}] No new ports detected for {}; linking may fall back to names",
                self.session_id,
                self.link_name
            );
            return;
        }

        let mut mapping: HashMap<Channel, Vec<u32>> = HashMap::new();
        for (id, name) in created {
            mapping.entry(classify_port(&name)).or_default().push(id);
        }
        log::debug!(
            "[Ingress {}] Discovered ports: {:?}",
            self.session_id,
            mapping
        );
        *self.ports.write() = mapping;
    }

    /// Whether the child still runs and its recorded ports are still in
    /// the graph. A transient empty listing counts as alive.
    pub async fn is_alive(&self) -> bool {
        {
            let mut guard = self.child.lock();
            match guard.as_mut() {
                None => return false,
                Some(child) => match child.try_wait() {
                    Ok(Some(_)) | Err(_) => return false,
                    Ok(None) => {}
                },
            }
        }

        let recorded = self.ports();
        if recorded.is_empty() {
            return true;
        }
        let current = match self.graph.list_output_ports(&self.link_name).await {
            Ok(ports) => ports,
            // Listing failure is not evidence of death.
            Err(_) => return true,
        };
        if current.is_empty() {
            return true;
        }
        for ids in recorded.values() {
            if !ids.iter().any(|id| current.contains_key(id)) {
                return false;
            }
        }
        true
    }

    /// Terminates the child (graceful, escalating to kill) and clears the
    /// recorded ports.
    pub async fn stop(&self) {
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
                if tokio::time::timeout(Duration::from_secs(1), child.wait())
                    .await
                    .is_ok()
                {
                    self.ports.write().clear();
                    return;
                }
            }
            if let Err(e) = child.start_kill() {
                log::debug!("[Ingress {}] kill failed: {}", self.session_id, e);
            }
            let _ = child.wait().await;
        }
        self.ports.write().clear();
    }
}

/// Classifies an ingress output port by its name suffix.
fn classify_port(name: &str) -> Channel {
    let lname = name.to_lowercase();
    if lname.contains("output_fl") || lname.contains("playback_fl") || lname.ends_with("_fl") {
        Channel::Fl
    } else if lname.contains("output_fr") || lname.contains("playback_fr") || lname.ends_with("_fr")
    {
        Channel::Fr
    } else {
        Channel::Other
    }
}

/// Attempts to decode the concatenated stdout lines as a base64 JSON
/// answer. Returns `None` while the payload is still incomplete.
fn try_decode_answer(buffer: &[String]) -> Option<IngressAnswer> {
    let candidate: String = buffer.concat();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(candidate.as_bytes())
        .ok()?;
    let value: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    let sdp = value.get("sdp")?.as_str()?.to_string();
    Some(IngressAnswer {
        sdp,
        encoded: candidate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_classify_by_suffix() {
        assert_eq!(classify_port("ingress-3:output_FL"), Channel::Fl);
        assert_eq!(classify_port("ingress-3:playback_FR"), Channel::Fr);
        assert_eq!(classify_port("ingress-3:monitor_fl"), Channel::Fl);
        assert_eq!(classify_port("ingress-3:midi_out"), Channel::Other);
    }

    #[test]
    fn answer_decodes_once_all_fragments_arrive() {
        let payload = json!({ "sdp": "v=0\r\nanswer", "type": "answer" }).to_string();
        let encoded = base64::engine::general_purpose::STANDARD.encode(payload);
        let (first, second) = encoded.split_at(encoded.len() / 2);

        let mut buffer = vec![first.to_string()];
        assert!(try_decode_answer(&buffer).is_none());

        buffer.push(second.to_string());
        let answer = try_decode_answer(&buffer).expect("decodes");
        assert_eq!(answer.sdp, "v=0\r\nanswer");
        assert_eq!(answer.encoded, encoded);
    }

    #[test]
    fn garbage_lines_do_not_decode() {
        let buffer = vec!["not-base64!!".to_string()];
        assert!(try_decode_answer(&buffer).is_none());
    }

    #[tokio::test]
    async fn start_rejects_empty_offer() {
        let sup = IngressSupervisor::new(1, PathBuf::from("/nonexistent"), AudioGraph::new());
        let err = sup.start("   ").await.unwrap_err();
        assert!(matches!(err, IngressError::EmptyOffer));
    }

    #[tokio::test]
    async fn start_reports_missing_binary() {
        let sup = IngressSupervisor::new(1, PathBuf::from("/nonexistent"), AudioGraph::new());
        let err = sup.start("v=0").await.unwrap_err();
        assert!(matches!(err, IngressError::BinaryMissing(_)));
    }

    #[tokio::test]
    async fn supervisor_without_child_is_dead() {
        let sup = IngressSupervisor::new(1, PathBuf::from("/nonexistent"), AudioGraph::new());
        assert!(!sup.is_alive().await);
    }
}
