//! The single-operator control lock and the keystroke surface behind it.
//!
//! At most one session owns the lock at a time. When a server-wide
//! passphrase is configured, a session must authenticate once before any
//! mutating control operation; the stamp lives on the session record.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{PartymicError, PartymicResult};

use super::input::InputDriver;
use super::registry::SessionRegistry;

/// Backspaces sent before typing replacement text.
const TEXT_CLEAR_BACKSPACES: usize = 20;

/// Unix timestamp in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
struct Owner {
    session: u64,
    name: String,
    acquired_at: u64,
}

/// Exclusive operator grant gating input synthesis, capacity changes and
/// playlist toggling.
pub struct ControlService {
    owner: Mutex<Option<Owner>>,
    password: Option<String>,
    registry: Arc<SessionRegistry>,
    input: Arc<dyn InputDriver>,
}

impl ControlService {
    /// Creates the service. `password` of `None` disables the auth gate.
    pub fn new(
        password: Option<String>,
        registry: Arc<SessionRegistry>,
        input: Arc<dyn InputDriver>,
    ) -> Self {
        Self {
            owner: Mutex::new(None),
            password,
            registry,
            input,
        }
    }

    /// Whether a passphrase is configured at all.
    pub fn password_required(&self) -> bool {
        self.password.is_some()
    }

    /// Whether the session has passed the auth gate (trivially true when
    /// no passphrase is configured).
    pub fn password_ok(&self, session_id: u64) -> bool {
        self.password.is_none() || self.registry.password_ok(session_id)
    }

    /// Fails with `control_password_required` unless the session passed
    /// the gate.
    pub fn ensure_password(&self, session_id: u64) -> PartymicResult<()> {
        if self.password_ok(session_id) {
            Ok(())
        } else {
            Err(PartymicError::ControlPasswordRequired)
        }
    }

    /// Validates the supplied passphrase and stamps the session.
    pub fn authenticate(&self, session_id: u64, provided: &str) -> PartymicResult<Value> {
        let Some(expected) = &self.password else {
            self.registry.set_password_ok(session_id, true);
            return Ok(json!({
                "success": true, "password_required": false, "password_ok": true
            }));
        };
        if provided == expected {
            self.registry.set_password_ok(session_id, true);
            Ok(json!({
                "success": true, "password_required": true, "password_ok": true
            }))
        } else {
            self.registry.set_password_ok(session_id, false);
            Err(PartymicError::InvalidPassword)
        }
    }

    /// Lock status payload for `/control/status` and `/status`.
    pub fn status(&self, session_id: Option<u64>) -> Value {
        let owner = self.owner.lock().clone();
        json!({
            "owner": owner.as_ref().map(|o| o.session),
            "owner_name": owner.as_ref().map(|o| o.name.clone()),
            "timestamp": owner.as_ref().map(|o| o.acquired_at).unwrap_or(0),
            "password_required": self.password_required(),
            "password_ok": session_id.is_some_and(|sid| self.password_ok(sid)),
        })
    }

    /// Acquires the lock for the session; conflicts carry the current
    /// owner.
    pub fn acquire(&self, session_id: u64, name: &str) -> PartymicResult<Value> {
        self.ensure_password(session_id)?;
        let mut owner = self.owner.lock();
        if let Some(current) = owner.as_ref() {
            if current.session != session_id {
                return Err(PartymicError::Conflict {
                    owner: current.session,
                    owner_name: Some(current.name.clone()),
                });
            }
        }
        let display = if name.is_empty() {
            owner
                .as_ref()
                .map(|o| o.name.clone())
                .unwrap_or_else(|| "Controller".to_string())
        } else {
            name.to_string()
        };
        let acquired = Owner {
            session: session_id,
            name: display,
            acquired_at: now_millis(),
        };
        log::info!(
            "[Control] Lock acquired by {} ({})",
            acquired.name,
            acquired.session
        );
        let payload = json!({
            "success": true, "owner": acquired.session, "owner_name": acquired.name
        });
        *owner = Some(acquired);
        Ok(payload)
    }

    /// Releases the lock; only the owner may release.
    pub fn release(&self, session_id: u64) -> PartymicResult<()> {
        self.require_owner(session_id)?;
        self.ensure_password(session_id)?;
        *self.owner.lock() = None;
        log::debug!("[Control] Lock released by session {}", session_id);
        Ok(())
    }

    /// Clears the lock if `session_id` holds it (stale-session path).
    pub fn release_if_owned_by(&self, session_id: u64) -> bool {
        let mut owner = self.owner.lock();
        if owner.as_ref().is_some_and(|o| o.session == session_id) {
            *owner = None;
            return true;
        }
        false
    }

    /// Fails with `not_owner` unless the session holds the lock.
    pub fn require_owner(&self, session_id: u64) -> PartymicResult<()> {
        let owner = self.owner.lock();
        match owner.as_ref() {
            Some(o) if o.session == session_id => Ok(()),
            _ => Err(PartymicError::NotOwner),
        }
    }

    /// Fails with `control_required` unless the session holds the lock and
    /// passed the auth gate. Used by non-`/control` surfaces (capacity,
    /// playlist toggling).
    pub fn require_lock(&self, session_id: u64) -> PartymicResult<()> {
        {
            let owner = self.owner.lock();
            if !owner.as_ref().is_some_and(|o| o.session == session_id) {
                return Err(PartymicError::ControlRequired);
            }
        }
        self.ensure_password(session_id)
    }

    /// Sends one keystroke: a single printable character is typed
    /// literally; whitelisted symbolic names are sent as keys.
    pub async fn keystroke(&self, session_id: u64, key: &str) -> PartymicResult<()> {
        self.require_owner(session_id)?;
        self.ensure_password(session_id)?;
        if key.is_empty() {
            return Err(PartymicError::InvalidInput("Missing key".into()));
        }
        if key.chars().count() == 1 {
            self.input.type_text(key).await?;
            return Ok(());
        }
        let mapped = map_symbolic_key(key).ok_or(PartymicError::UnsupportedKey)?;
        self.input.key(mapped).await?;
        Ok(())
    }

    /// Replaces the game's current text field: a burst of backspaces, then
    /// the full text typed literally.
    pub async fn type_text(&self, session_id: u64, text: &str) -> PartymicResult<()> {
        self.require_owner(session_id)?;
        self.ensure_password(session_id)?;
        for _ in 0..TEXT_CLEAR_BACKSPACES {
            // Best-effort: a failed backspace should not abort the clear.
            let _ = self.input.key("BackSpace").await;
        }
        if !text.is_empty() {
            self.input.type_text(text).await?;
        }
        Ok(())
    }
}

/// Maps browser-style key names onto the whitelisted tool key names.
fn map_symbolic_key(key: &str) -> Option<&'static str> {
    match key {
        "Escape" | "Esc" => Some("Escape"),
        "Enter" | "Return" => Some("Return"),
        "Backspace" => Some("BackSpace"),
        "Space" => Some("space"),
        "ArrowLeft" => Some("Left"),
        "ArrowRight" => Some("Right"),
        "ArrowUp" => Some("Up"),
        "ArrowDown" => Some("Down"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::input::testing::RecordingInput;

    fn service(password: Option<&str>) -> (ControlService, Arc<SessionRegistry>, Arc<RecordingInput>) {
        let registry = Arc::new(SessionRegistry::new());
        let input = RecordingInput::shared();
        let service = ControlService::new(
            password.map(str::to_string),
            Arc::clone(&registry),
            Arc::clone(&input) as Arc<dyn InputDriver>,
        );
        (service, registry, input)
    }

    #[test]
    fn second_session_gets_conflict() {
        let (service, registry, _) = service(None);
        let a = registry.issue_id();
        let b = registry.issue_id();
        service.acquire(a, "Ada").unwrap();
        let err = service.acquire(b, "Bob").unwrap_err();
        assert_eq!(err.code(), "conflict");
        // Re-acquiring by the owner succeeds.
        service.acquire(a, "Ada").unwrap();
    }

    #[test]
    fn release_requires_ownership() {
        let (service, registry, _) = service(None);
        let a = registry.issue_id();
        let b = registry.issue_id();
        service.acquire(a, "Ada").unwrap();
        assert_eq!(service.release(b).unwrap_err().code(), "not_owner");
        service.release(a).unwrap();
        assert!(service.status(None)["owner"].is_null());
    }

    #[test]
    fn password_gate_blocks_until_authenticated() {
        let (service, registry, _) = service(Some("secret"));
        let sid = registry.issue_id();
        assert_eq!(
            service.acquire(sid, "Ada").unwrap_err().code(),
            "control_password_required"
        );
        assert_eq!(
            service.authenticate(sid, "wrong").unwrap_err().code(),
            "invalid_password"
        );
        service.authenticate(sid, "secret").unwrap();
        service.acquire(sid, "Ada").unwrap();
    }

    #[tokio::test]
    async fn keystroke_maps_and_whitelists() {
        let (service, registry, input) = service(None);
        let sid = registry.issue_id();
        service.acquire(sid, "Ada").unwrap();

        service.keystroke(sid, "a").await.unwrap();
        service.keystroke(sid, "Enter").await.unwrap();
        service.keystroke(sid, "ArrowDown").await.unwrap();
        assert_eq!(input.taken(), vec!["type:a", "key:Return", "key:Down"]);

        assert_eq!(
            service.keystroke(sid, "F13").await.unwrap_err().code(),
            "unsupported_key"
        );
    }

    #[tokio::test]
    async fn type_text_clears_then_types() {
        let (service, registry, input) = service(None);
        let sid = registry.issue_id();
        service.acquire(sid, "Ada").unwrap();
        service.type_text(sid, "Hello").await.unwrap();

        let events = input.taken();
        assert_eq!(events.len(), 21);
        assert!(events[..20].iter().all(|e| e == "key:BackSpace"));
        assert_eq!(events[20], "type:Hello");
    }

    #[tokio::test]
    async fn keystroke_requires_the_lock() {
        let (service, registry, _) = service(None);
        let sid = registry.issue_id();
        assert_eq!(
            service.keystroke(sid, "Enter").await.unwrap_err().code(),
            "not_owner"
        );
    }

    #[test]
    fn stale_release_clears_only_the_owner() {
        let (service, registry, _) = service(None);
        let a = registry.issue_id();
        service.acquire(a, "Ada").unwrap();
        assert!(!service.release_if_owned_by(a + 1));
        assert!(service.release_if_owned_by(a));
        assert!(service.status(None)["owner"].is_null());
    }
}
