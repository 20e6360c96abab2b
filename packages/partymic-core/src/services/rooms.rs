//! Room coordination: the lobby plus six numbered mic rooms.
//!
//! All membership and capacity mutations run under a single lock, and
//! every successful mutation ends with exactly one subscriber broadcast
//! and a game-config rewrite. Display names are globally unique across
//! rooms: joining anywhere removes the name everywhere else first.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::audio::IngressManager;
use crate::error::{PartymicError, PartymicResult};
use crate::events::EventHub;
use crate::game::{GameConfig, MicSlot};
use crate::state::Config;

use super::registry::SessionRegistry;

/// Number of numbered mic rooms.
pub const MIC_ROOMS: usize = 6;

/// Default capacity of a mic room.
const DEFAULT_CAPACITY: usize = 6;

/// All valid room names in display order.
pub const ROOM_NAMES: [&str; 7] = ["lobby", "mic1", "mic2", "mic3", "mic4", "mic5", "mic6"];

/// Sink index for a room: lobby is 0, `mic<k>` is `k`. `None` for unknown
/// rooms.
pub fn sink_index_for_room(room: &str) -> Option<usize> {
    if room == "lobby" {
        return Some(0);
    }
    let k: usize = room.strip_prefix("mic")?.parse().ok()?;
    (1..=MIC_ROOMS).contains(&k).then_some(k)
}

fn clamp_capacity(value: i64) -> usize {
    value.clamp(1, 6) as usize
}

#[derive(Default)]
struct RoomsInner {
    lobby: Vec<String>,
    mics: [Vec<String>; MIC_ROOMS],
    capacity: [usize; MIC_ROOMS],
}

impl RoomsInner {
    fn members_mut(&mut self, room: &str) -> Option<&mut Vec<String>> {
        if room == "lobby" {
            return Some(&mut self.lobby);
        }
        let k = room.strip_prefix("mic")?.parse::<usize>().ok()?;
        self.mics.get_mut(k.checked_sub(1)?)
    }

    fn remove_everywhere(&mut self, name: &str) -> bool {
        let mut removed = false;
        let before = self.lobby.len();
        self.lobby.retain(|n| n != name);
        removed |= self.lobby.len() != before;
        for members in &mut self.mics {
            let before = members.len();
            members.retain(|n| n != name);
            removed |= members.len() != before;
        }
        removed
    }

    fn rooms_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("lobby".into(), json!(self.lobby));
        for (i, members) in self.mics.iter().enumerate() {
            map.insert(format!("mic{}", i + 1), json!(members));
        }
        Value::Object(map)
    }

    fn capacity_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (i, cap) in self.capacity.iter().enumerate() {
            map.insert(format!("mic{}", i + 1), json!(cap));
        }
        Value::Object(map)
    }
}

/// Successful join result.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Room that was joined.
    pub room: String,
    /// Normalized display name actually recorded.
    pub name: String,
    /// Sink index the session's audio should use.
    pub sink_index: usize,
    /// Post-join rooms snapshot.
    pub rooms: Value,
    /// Post-join capacity snapshot.
    pub capacity: Value,
}

/// Owner of the room table and capacity store.
pub struct RoomCoordinator {
    inner: Mutex<RoomsInner>,
    store_path: PathBuf,
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    hub: Arc<EventHub>,
    game_config: Arc<GameConfig>,
    ingress: Option<Arc<IngressManager>>,
}

impl RoomCoordinator {
    /// Creates the coordinator, loading persisted capacity limits.
    pub fn new(
        config: Arc<Config>,
        registry: Arc<SessionRegistry>,
        hub: Arc<EventHub>,
        game_config: Arc<GameConfig>,
        ingress: Option<Arc<IngressManager>>,
    ) -> Self {
        let store_path = config.capacity_store_path();
        let mut inner = RoomsInner {
            capacity: [DEFAULT_CAPACITY; MIC_ROOMS],
            ..Default::default()
        };
        match std::fs::read_to_string(&store_path) {
            Ok(text) => match serde_json::from_str::<HashMap<String, i64>>(&text) {
                Ok(stored) => {
                    for (room, value) in stored {
                        if let Some(k) = room.strip_prefix("mic").and_then(|s| s.parse::<usize>().ok())
                        {
                            if (1..=MIC_ROOMS).contains(&k) {
                                inner.capacity[k - 1] = clamp_capacity(value);
                            }
                        }
                    }
                }
                Err(e) => log::warn!("[Rooms] Ignoring malformed capacity store: {}", e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("[Rooms] Failed to load capacity store: {}", e),
        }
        Self {
            inner: Mutex::new(inner),
            store_path,
            config,
            registry,
            hub,
            game_config,
            ingress,
        }
    }

    /// `{rooms, capacity}` snapshot payload.
    pub fn snapshot(&self) -> Value {
        let inner = self.inner.lock();
        json!({ "rooms": inner.rooms_value(), "capacity": inner.capacity_value() })
    }

    fn persist_capacity(&self, capacity: &[usize; MIC_ROOMS]) {
        let mut map = serde_json::Map::new();
        for (i, cap) in capacity.iter().enumerate() {
            map.insert(format!("mic{}", i + 1), json!(cap));
        }
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.store_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(
                &self.store_path,
                serde_json::to_string_pretty(&Value::Object(map.clone()))?,
            )
        };
        if let Err(e) = write() {
            log::error!("[Rooms] Failed to persist capacity store: {}", e);
        }
    }

    /// Broadcasts the current snapshot and rewrites the game config.
    /// Called after every successful mutation.
    fn after_mutation(&self) {
        self.hub.broadcast(&self.snapshot());
        self.update_game_config();
    }

    /// Rebuilds `[Name]`/`[PlayerDelay]`/`[Game].Players` from the current
    /// rosters. Failures are logged; a missing game config is not fatal at
    /// runtime.
    pub fn update_game_config(&self) {
        let rosters: [Vec<String>; MIC_ROOMS] = {
            let inner = self.inner.lock();
            inner.mics.clone()
        };
        let mut slots: [MicSlot; MIC_ROOMS] = Default::default();
        for (i, names) in rosters.into_iter().enumerate() {
            let delays: Vec<i64> = names
                .iter()
                .flat_map(|name| self.registry.delays_for_name(name))
                .collect();
            let mean = if delays.is_empty() {
                0
            } else {
                delays.iter().sum::<i64>() / delays.len() as i64
            };
            slots[i] = MicSlot {
                names,
                mean_delay_ms: mean,
            };
        }
        if let Err(e) = self.game_config.update_players(&slots) {
            log::warn!("[Rooms] Game config rewrite skipped: {}", e);
        }
    }

    /// Joins a room, enforcing one-room-per-name and mic capacity.
    pub async fn join(
        &self,
        session_id: u64,
        room: &str,
        name: &str,
        delay_ms: Option<i64>,
    ) -> PartymicResult<JoinOutcome> {
        let sink_index = sink_index_for_room(room)
            .ok_or_else(|| PartymicError::UnknownRoom(room.to_string()))?;

        let username = if name.trim().is_empty() {
            self.registry
                .name_of(session_id)
                .unwrap_or_else(|| self.config.normalize_name("", session_id))
        } else {
            self.config.normalize_name(name, session_id)
        };
        if let Some(delay) = delay_ms {
            self.registry.set_delay(session_id, delay.max(0));
        }

        {
            let mut inner = self.inner.lock();
            inner.remove_everywhere(&username);
            if sink_index > 0 {
                let limit = inner.capacity[sink_index - 1];
                let occupancy = inner
                    .members_mut(room)
                    .map(|members| members.len())
                    .ok_or_else(|| PartymicError::UnknownRoom(room.to_string()))?;
                if occupancy >= limit {
                    return Err(PartymicError::RoomFull {
                        room: room.to_string(),
                        members: occupancy,
                        capacity: limit,
                        rooms: inner.rooms_value(),
                        capacity_map: inner.capacity_value(),
                    });
                }
            }
            inner
                .members_mut(room)
                .ok_or_else(|| PartymicError::UnknownRoom(room.to_string()))?
                .push(username.clone());
        }

        self.registry.set_name(session_id, &username);
        self.registry.set_room(session_id, Some(room), sink_index);

        if let Some(ingress) = &self.ingress {
            if ingress.has_ingress(session_id) {
                if let Err(e) = ingress.connect_to_sink(session_id, sink_index).await {
                    log::error!(
                        "[Rooms] Failed to connect session {} to sink {}: {}",
                        session_id,
                        sink_index,
                        e
                    );
                }
            }
        }

        self.after_mutation();
        log::info!(
            "[Rooms] Session {} joined {} as {}",
            session_id,
            room,
            username
        );
        let snapshot = self.snapshot();
        Ok(JoinOutcome {
            room: room.to_string(),
            name: username,
            sink_index,
            rooms: snapshot["rooms"].clone(),
            capacity: snapshot["capacity"].clone(),
        })
    }

    /// Removes a user from every room, by explicit name or by the
    /// session's recorded name.
    pub fn leave(&self, session_id: Option<u64>, name: Option<&str>) -> PartymicResult<Value> {
        let username = match name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                let sid = session_id
                    .ok_or_else(|| PartymicError::InvalidInput("No session or name provided".into()))?;
                self.registry
                    .name_of(sid)
                    .ok_or_else(|| PartymicError::InvalidInput("Unknown user".into()))?
            }
        };

        {
            let mut inner = self.inner.lock();
            inner.remove_everywhere(&username);
        }
        if let Some(sid) = session_id {
            self.registry.set_room(sid, None, 0);
        }
        self.after_mutation();
        log::info!("[Rooms] {} left all rooms", username);
        Ok(self.snapshot())
    }

    /// Sweeper path: removes a name from every room. Broadcast and config
    /// rewrite only happen when membership actually changed.
    pub fn purge_name(&self, name: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            inner.remove_everywhere(name)
        };
        if removed {
            self.after_mutation();
        }
        removed
    }

    /// Applies capacity updates (mic rooms only), clamping into `[1, 6]`
    /// and persisting to disk. Returns the resulting capacity map.
    pub fn set_capacity(&self, updates: &HashMap<String, i64>) -> PartymicResult<Value> {
        let mut changed = false;
        let capacity_value;
        {
            let mut inner = self.inner.lock();
            for (room, value) in updates {
                let Some(k) = room.strip_prefix("mic").and_then(|s| s.parse::<usize>().ok())
                else {
                    continue;
                };
                if !(1..=MIC_ROOMS).contains(&k) {
                    continue;
                }
                inner.capacity[k - 1] = clamp_capacity(*value);
                changed = true;
            }
            if !changed {
                return Err(PartymicError::InvalidInput(
                    "No valid rooms to update".into(),
                ));
            }
            self.persist_capacity(&inner.capacity);
            capacity_value = inner.capacity_value();
        }
        self.hub.broadcast(&self.snapshot());
        Ok(capacity_value)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn coordinator(dir: &TempDir) -> (RoomCoordinator, Arc<SessionRegistry>, Arc<EventHub>) {
        let config = Arc::new(Config::for_test(dir.path()));
        let registry = Arc::new(SessionRegistry::new());
        let hub = Arc::new(EventHub::new());
        let game_config = Arc::new(GameConfig::new(config.game_config_path()));
        let coordinator = RoomCoordinator::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&hub),
            game_config,
            None,
        );
        (coordinator, registry, hub)
    }

    #[test]
    fn sink_indices_follow_room_numbers() {
        assert_eq!(sink_index_for_room("lobby"), Some(0));
        assert_eq!(sink_index_for_room("mic1"), Some(1));
        assert_eq!(sink_index_for_room("mic6"), Some(6));
        assert_eq!(sink_index_for_room("mic7"), None);
        assert_eq!(sink_index_for_room("stage"), None);
    }

    #[tokio::test]
    async fn join_places_name_in_exactly_one_room() {
        let dir = TempDir::new().unwrap();
        let (rooms, registry, _) = coordinator(&dir);
        let sid = registry.issue_id();

        rooms.join(sid, "mic2", "Ada", None).await.unwrap();
        let outcome = rooms.join(sid, "mic3", "Ada", None).await.unwrap();

        assert_eq!(outcome.rooms["mic2"], json!([]));
        assert_eq!(outcome.rooms["mic3"], json!(["Ada"]));
        assert_eq!(outcome.sink_index, 3);
        assert_eq!(registry.get(sid).unwrap().room.as_deref(), Some("mic3"));
    }

    #[tokio::test]
    async fn join_then_leave_restores_membership() {
        let dir = TempDir::new().unwrap();
        let (rooms, registry, _) = coordinator(&dir);
        let before = rooms.snapshot();
        let sid = registry.issue_id();
        rooms.join(sid, "mic1", "Ada", None).await.unwrap();
        rooms.leave(Some(sid), None).unwrap();
        assert_eq!(rooms.snapshot()["rooms"], before["rooms"]);
    }

    #[tokio::test]
    async fn mic_room_enforces_capacity() {
        let dir = TempDir::new().unwrap();
        let (rooms, registry, _) = coordinator(&dir);
        let updates = HashMap::from([("mic1".to_string(), 1_i64)]);
        rooms.set_capacity(&updates).unwrap();

        let a = registry.issue_id();
        let b = registry.issue_id();
        rooms.join(a, "mic1", "X", None).await.unwrap();
        let err = rooms.join(b, "mic1", "Y", None).await.unwrap_err();
        assert_eq!(err.code(), "room_full");
        assert_eq!(err.status_code().as_u16(), 409);
    }

    #[tokio::test]
    async fn lobby_never_fills() {
        let dir = TempDir::new().unwrap();
        let (rooms, registry, _) = coordinator(&dir);
        for i in 0..20 {
            let sid = registry.issue_id();
            rooms
                .join(sid, "lobby", &format!("user{i}"), None)
                .await
                .unwrap();
        }
        assert_eq!(rooms.snapshot()["rooms"]["lobby"].as_array().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn names_are_truncated_to_the_limit() {
        let dir = TempDir::new().unwrap();
        let (rooms, registry, _) = coordinator(&dir);
        let sid = registry.issue_id();
        let outcome = rooms
            .join(sid, "lobby", "abcdefghijklmnopqrstuvwxyz", None)
            .await
            .unwrap();
        assert_eq!(outcome.name, "abcdefghijklmnop");
    }

    #[tokio::test]
    async fn unknown_room_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (rooms, registry, _) = coordinator(&dir);
        let sid = registry.issue_id();
        let err = rooms.join(sid, "backstage", "Ada", None).await.unwrap_err();
        assert_eq!(err.code(), "unknown_room");
    }

    #[tokio::test]
    async fn capacity_updates_clamp_and_persist() {
        let dir = TempDir::new().unwrap();
        let (rooms, _, _) = coordinator(&dir);
        let updates = HashMap::from([
            ("mic1".to_string(), 99_i64),
            ("mic2".to_string(), 0_i64),
            ("lobby".to_string(), 1_i64),
        ]);
        let capacity = rooms.set_capacity(&updates).unwrap();
        assert_eq!(capacity["mic1"], json!(6));
        assert_eq!(capacity["mic2"], json!(1));

        // Setting the same values twice leaves identical bytes on disk.
        let store = Config::for_test(dir.path()).capacity_store_path();
        let first = std::fs::read(&store).unwrap();
        rooms.set_capacity(&updates).unwrap();
        assert_eq!(std::fs::read(&store).unwrap(), first);
    }

    #[tokio::test]
    async fn mutations_reach_subscribers_in_order() {
        let dir = TempDir::new().unwrap();
        let (rooms, registry, hub) = coordinator(&dir);
        let mut rx = hub.subscribe();
        let sid = registry.issue_id();
        rooms.join(sid, "mic2", "Ada", None).await.unwrap();
        let update = rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(&update).unwrap();
        assert_eq!(value["rooms"]["mic2"], json!(["Ada"]));
    }
}
