//! Session registry: ids, display names, delays, heartbeats.
//!
//! Sessions are identified by opaque random integers carried in a signed
//! cookie. Every inbound request touches `last_seen`; the stale sweeper
//! (wired in bootstrap) evicts sessions that stop calling in, unless
//! their audio ingress is still alive.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// How long a session may stay silent before it is considered stale.
pub const STALE_THRESHOLD: Duration = Duration::from_secs(10);

/// Interval of the stale sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Per-session record.
#[derive(Debug, Clone)]
pub struct Session {
    /// Display name chosen at room join.
    pub name: Option<String>,
    /// Player's audio delay preference (ms).
    pub delay_ms: i64,
    /// Room the session currently occupies.
    pub room: Option<String>,
    /// Sink the session's audio is linked to.
    pub sink_index: usize,
    /// Whether the control passphrase was presented by this session.
    pub control_password_ok: bool,
    /// Monotonic timestamp of the last client contact.
    pub last_seen: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            name: None,
            delay_ms: 0,
            room: None,
            sink_index: 0,
            control_password_ok: false,
            last_seen: Instant::now(),
        }
    }
}

/// Store of all live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, Session>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh random session id and registers it.
    pub fn issue_id(&self) -> u64 {
        loop {
            let id = fastrand::u64(1_000_000..10_000_000);
            if !self.sessions.contains_key(&id) {
                self.sessions.insert(id, Session::new());
                return id;
            }
        }
    }

    /// Registers `id` if unknown (e.g. a cookie from a previous process)
    /// and refreshes its heartbeat.
    pub fn touch(&self, id: u64) {
        self.sessions.entry(id).or_insert_with(Session::new).last_seen = Instant::now();
    }

    /// Whether the session exists.
    pub fn contains(&self, id: u64) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Snapshot of one session.
    pub fn get(&self, id: u64) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// Removes a session, returning its final state.
    pub fn remove(&self, id: u64) -> Option<Session> {
        self.sessions.remove(&id).map(|(_, s)| s)
    }

    /// Records the display name.
    pub fn set_name(&self, id: u64, name: &str) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.name = Some(name.to_string());
        }
    }

    /// Display name of a session, if any.
    pub fn name_of(&self, id: u64) -> Option<String> {
        self.sessions.get(&id).and_then(|s| s.name.clone())
    }

    /// Records the delay preference (ms).
    pub fn set_delay(&self, id: u64, delay_ms: i64) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.delay_ms = delay_ms;
        }
    }

    /// Records the current room and matching sink index.
    pub fn set_room(&self, id: u64, room: Option<&str>, sink_index: usize) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.room = room.map(str::to_string);
            session.sink_index = sink_index;
        }
    }

    /// Stamps (or clears) the control-passphrase authentication.
    pub fn set_password_ok(&self, id: u64, ok: bool) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.control_password_ok = ok;
        }
    }

    /// Whether the session presented the control passphrase.
    pub fn password_ok(&self, id: u64) -> bool {
        self.sessions
            .get(&id)
            .map(|s| s.control_password_ok)
            .unwrap_or(false)
    }

    /// Delay preferences of every session using the given display name.
    /// Duplicate names across sessions all contribute.
    pub fn delays_for_name(&self, name: &str) -> Vec<i64> {
        self.sessions
            .iter()
            .filter(|s| s.name.as_deref() == Some(name))
            .map(|s| s.delay_ms)
            .collect()
    }

    /// Ids whose `last_seen` is older than the threshold.
    pub fn stale_ids(&self, threshold: Duration) -> Vec<u64> {
        self.sessions
            .iter()
            .filter(|s| s.last_seen.elapsed() > threshold)
            .map(|s| *s.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_ids_are_unique_and_registered() {
        let registry = SessionRegistry::new();
        let a = registry.issue_id();
        let b = registry.issue_id();
        assert_ne!(a, b);
        assert!(registry.contains(a));
        assert!(registry.contains(b));
    }

    #[test]
    fn touch_registers_unknown_ids() {
        let registry = SessionRegistry::new();
        registry.touch(1234);
        assert!(registry.contains(1234));
    }

    #[test]
    fn delays_aggregate_across_duplicate_names() {
        let registry = SessionRegistry::new();
        let a = registry.issue_id();
        let b = registry.issue_id();
        registry.set_name(a, "Ada");
        registry.set_name(b, "Ada");
        registry.set_delay(a, 100);
        registry.set_delay(b, 300);
        let mut delays = registry.delays_for_name("Ada");
        delays.sort();
        assert_eq!(delays, vec![100, 300]);
    }

    #[test]
    fn fresh_sessions_are_not_stale() {
        let registry = SessionRegistry::new();
        let id = registry.issue_id();
        assert!(registry.stale_ids(Duration::from_secs(10)).is_empty());
        assert!(registry.stale_ids(Duration::ZERO).contains(&id));
    }
}
