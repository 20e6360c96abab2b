//! Singleton coordinator for all ingress supervisors.
//!
//! Invariants:
//! - at most one ingress per session id
//! - ingress starts are serialized FIFO through [`StartQueue`] (port
//!   discovery races when two children enumerate ports concurrently)

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{PartymicError, PartymicResult};

use super::graph::AudioGraph;
use super::ingress::{IngressAnswer, IngressSupervisor};
use super::{sink_name, Channel, SINK_COUNT};

/// Bound on waiting for the serialized start slot.
const START_WAIT: Duration = Duration::from_secs(20);

/// Interval of the background liveness sweep.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

/// FIFO queue serializing ingress starts.
///
/// A caller enqueues its session id and waits until it reaches the head;
/// releasing (or abandoning) the slot wakes the remaining waiters.
pub(crate) struct StartQueue {
    inner: tokio::sync::Mutex<VecDeque<u64>>,
    notify: Notify,
}

impl StartQueue {
    fn new() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Enqueues `id` and waits until it is at the head of the queue.
    /// Returns `false` when the deadline passes first; the entry is
    /// removed in that case.
    pub(crate) async fn acquire(&self, id: u64, wait: Duration) -> bool {
        self.inner.lock().await.push_back(id);
        let deadline = Instant::now() + wait;
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let queue = self.inner.lock().await;
                if queue.front() == Some(&id) {
                    return true;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.remove(id).await;
                return false;
            }
        }
    }

    /// Removes `id` wherever it sits and wakes the next waiter.
    pub(crate) async fn remove(&self, id: u64) {
        let mut queue = self.inner.lock().await;
        queue.retain(|entry| *entry != id);
        self.notify.notify_waiters();
    }
}

/// Global coordination of per-session ingresses and their sink wiring.
pub struct IngressManager {
    graph: AudioGraph,
    binary: PathBuf,
    ingresses: RwLock<HashMap<u64, Arc<IngressSupervisor>>>,
    sink_links: RwLock<HashMap<u64, usize>>,
    start_queue: StartQueue,
}

impl IngressManager {
    /// Creates the manager. Call [`IngressManager::initialize`] before
    /// accepting sessions.
    pub fn new(binary: PathBuf) -> Self {
        Self {
            graph: AudioGraph::new(),
            binary,
            ingresses: RwLock::new(HashMap::new()),
            sink_links: RwLock::new(HashMap::new()),
            start_queue: StartQueue::new(),
        }
    }

    /// Startup: removes leftover null-sink modules from prior runs and
    /// creates the seven virtual sinks.
    pub async fn initialize(&self) -> PartymicResult<()> {
        if let Err(e) = self.graph.unload_all_null_sinks().await {
            log::warn!("[IngressMgr] Null-sink cleanup failed: {}", e);
        }
        self.graph.ensure_sinks(&super::sink_names()).await?;
        Ok(())
    }

    /// Whether a running ingress exists for the session.
    pub fn has_ingress(&self, session_id: u64) -> bool {
        self.ingresses.read().contains_key(&session_id)
    }

    fn get(&self, session_id: u64) -> Option<Arc<IngressSupervisor>> {
        self.ingresses.read().get(&session_id).cloned()
    }

    /// Starts (or restarts) the ingress for a session with the given SDP
    /// offer. Starts are serialized; waiting more than 20s fails with
    /// `ingress_busy`.
    pub async fn start(
        self: Arc<Self>,
        session_id: u64,
        offer: &str,
    ) -> PartymicResult<IngressAnswer> {
        if !self.start_queue.acquire(session_id, START_WAIT).await {
            log::warn!(
                "[IngressMgr] Session {} timed out waiting for start slot",
                session_id
            );
            return Err(PartymicError::IngressBusy);
        }
        let result = Self::start_at_head(&self, session_id, offer).await;
        self.start_queue.remove(session_id).await;
        result
    }

    async fn start_at_head(
        this: &Arc<Self>,
        session_id: u64,
        offer: &str,
    ) -> PartymicResult<IngressAnswer> {
        // Replace any prior ingress for this session.
        let previous = this.ingresses.write().remove(&session_id);
        if let Some(previous) = previous {
            log::debug!(
                "[IngressMgr] Stopping previous ingress for session {}",
                session_id
            );
            previous.stop().await;
        }
        this.sink_links.write().remove(&session_id);

        let supervisor = Arc::new(IngressSupervisor::new(
            session_id,
            this.binary.clone(),
            this.graph.clone(),
        ));
        this.ingresses
            .write()
            .insert(session_id, Arc::clone(&supervisor));

        let (answer, existing_ports) = match supervisor.start(offer).await {
            Ok(result) => result,
            Err(e) => {
                this.ingresses.write().remove(&session_id);
                supervisor.stop().await;
                return Err(e.into());
            }
        };

        // Success is reported before the ports have landed; discovery runs
        // in the background and auto-connects to the lobby sink when done.
        let manager = Arc::clone(this);
        tokio::spawn(async move {
            supervisor.discover_ports(existing_ports).await;
            if let Err(e) = manager.connect_to_sink(session_id, 0).await {
                log::warn!(
                    "[IngressMgr] Auto-connect of session {} to sink 0 failed: {}",
                    session_id,
                    e
                );
            } else {
                log::info!("[IngressMgr] Session {} auto-connected to sink 0", session_id);
            }
        });

        Ok(answer)
    }

    /// Stops and removes the session's ingress; also purges any pending
    /// start-queue entry so a queued start cannot block others.
    pub async fn remove(&self, session_id: u64) {
        self.start_queue.remove(session_id).await;
        let supervisor = self.ingresses.write().remove(&session_id);
        if let Some(supervisor) = supervisor {
            if let Err(e) = self.disconnect(session_id, &supervisor).await {
                log::debug!(
                    "[IngressMgr] Disconnect during removal of {} failed: {}",
                    session_id,
                    e
                );
            }
            supervisor.stop().await;
            log::info!("[IngressMgr] Removed ingress for session {}", session_id);
        }
        self.sink_links.write().remove(&session_id);
    }

    /// Rewires the session's ingress to the sink at `sink_index`.
    ///
    /// Existing connections are removed first. Discovered numeric ports
    /// are linked per channel; when discovery found nothing the link falls
    /// back to the graph's port names.
    pub async fn connect_to_sink(&self, session_id: u64, sink_index: usize) -> PartymicResult<()> {
        if sink_index >= SINK_COUNT {
            return Err(PartymicError::InvalidInput(format!(
                "Invalid sink index {sink_index}"
            )));
        }
        let supervisor = self
            .get(session_id)
            .ok_or_else(|| PartymicError::NotFound(format!("ingress for session {session_id}")))?;

        self.disconnect(session_id, &supervisor).await?;

        let sink = sink_name(sink_index);
        let ports = supervisor.ports();
        let mut used_numeric = false;
        for channel in [Channel::Fl, Channel::Fr] {
            if let Some(ids) = ports.get(&channel) {
                for &port_id in ids {
                    self.graph.link(port_id, &sink, channel).await?;
                    used_numeric = true;
                }
            }
        }
        if !used_numeric {
            log::debug!(
                "[IngressMgr] No numeric ports for session {}; linking by name",
                session_id
            );
            for channel in [Channel::Fl, Channel::Fr] {
                let source = format!("{}:output_{}", supervisor.link_name(), channel.as_str());
                self.graph.link_named(&source, &sink, channel).await?;
            }
        }

        self.sink_links.write().insert(session_id, sink_index);
        log::debug!(
            "[IngressMgr] Session {} connected to {} (index {})",
            session_id,
            sink,
            sink_index
        );
        Ok(())
    }

    /// Removes every graph connection attached to the ingress's ports.
    async fn disconnect(
        &self,
        session_id: u64,
        supervisor: &Arc<IngressSupervisor>,
    ) -> PartymicResult<()> {
        let ports = supervisor.ports();
        for ids in ports.values() {
            for &port_id in ids {
                self.graph.unlink(port_id, supervisor.link_name()).await?;
            }
        }
        self.sink_links.write().remove(&session_id);
        Ok(())
    }

    /// Whether the session's ingress is alive (child running, ports
    /// present).
    pub async fn is_alive(&self, session_id: u64) -> bool {
        match self.get(session_id) {
            Some(supervisor) => supervisor.is_alive().await,
            None => false,
        }
    }

    /// Sink index each session is currently linked to.
    pub fn sink_index(&self, session_id: u64) -> Option<usize> {
        self.sink_links.read().get(&session_id).copied()
    }

    /// Stops every ingress (shutdown path).
    pub async fn stop_all(&self) {
        let all: Vec<(u64, Arc<IngressSupervisor>)> = self
            .ingresses
            .write()
            .drain()
            .collect();
        for (session_id, supervisor) in all {
            log::debug!("[IngressMgr] Stopping ingress for session {}", session_id);
            supervisor.stop().await;
        }
        self.sink_links.write().clear();
    }

    /// Spawns the periodic liveness sweep: dead ingresses are disconnected
    /// and removed.
    pub fn spawn_liveness_loop(self: Arc<Self>) {
        let manager = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(LIVENESS_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let sessions: Vec<u64> = manager.ingresses.read().keys().copied().collect();
                for session_id in sessions {
                    if !manager.is_alive(session_id).await {
                        log::warn!(
                            "[IngressMgr] Ingress for session {} appears dead; cleaning up",
                            session_id
                        );
                        manager.remove(session_id).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_queue_grants_head_immediately() {
        let queue = StartQueue::new();
        assert!(queue.acquire(1, Duration::from_millis(50)).await);
        queue.remove(1).await;
    }

    #[tokio::test]
    async fn start_queue_serializes_fifo() {
        let queue = Arc::new(StartQueue::new());
        assert!(queue.acquire(1, Duration::from_secs(1)).await);

        let q2 = Arc::clone(&queue);
        let second = tokio::spawn(async move {
            let granted = q2.acquire(2, Duration::from_secs(1)).await;
            (granted, Instant::now())
        });

        // Give the second waiter time to block behind the head.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let released_at = Instant::now();
        queue.remove(1).await;

        let (granted, granted_at) = second.await.unwrap();
        assert!(granted);
        assert!(granted_at >= released_at);
        queue.remove(2).await;
    }

    #[tokio::test]
    async fn start_queue_times_out_waiters() {
        let queue = Arc::new(StartQueue::new());
        assert!(queue.acquire(1, Duration::from_secs(1)).await);
        // Head never releases; the second waiter must give up.
        assert!(!queue.acquire(2, Duration::from_millis(50)).await);
        // The abandoned entry must not linger in the queue.
        queue.remove(1).await;
        assert!(queue.acquire(3, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn connect_requires_valid_sink_index() {
        let manager = Arc::new(IngressManager::new(PathBuf::from("/nonexistent")));
        let err = manager.connect_to_sink(1, SINK_COUNT).await.unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[tokio::test]
    async fn connect_requires_existing_ingress() {
        let manager = Arc::new(IngressManager::new(PathBuf::from("/nonexistent")));
        let err = manager.connect_to_sink(7, 0).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
