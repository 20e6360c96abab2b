//! The signed session cookie.
//!
//! Sessions are identified by an opaque integer carried in a signed
//! cookie, created on first contact. Every request that resolves a
//! session id also refreshes the registry heartbeat.

use axum_extra::extract::cookie::{Cookie, SameSite, SignedCookieJar};

use crate::services::SessionRegistry;

/// Cookie carrying the session id.
pub const SESSION_COOKIE: &str = "session_id";

/// Session id from the jar, if the cookie is present and valid.
pub fn session_id(jar: &SignedCookieJar) -> Option<u64> {
    jar.get(SESSION_COOKIE)
        .and_then(|cookie| cookie.value().parse().ok())
}

/// Session id from the jar, with the registry heartbeat refreshed.
pub fn touch_session(jar: &SignedCookieJar, registry: &SessionRegistry) -> Option<u64> {
    let sid = session_id(jar)?;
    registry.touch(sid);
    Some(sid)
}

/// Resolves the session id, issuing one (and setting the cookie) on first
/// contact.
pub fn ensure_session(
    jar: SignedCookieJar,
    registry: &SessionRegistry,
) -> (u64, SignedCookieJar) {
    if let Some(sid) = touch_session(&jar, registry) {
        return (sid, jar);
    }
    let sid = registry.issue_id();
    let cookie = Cookie::build((SESSION_COOKIE, sid.to_string()))
        .path("/")
        .same_site(SameSite::Lax)
        .http_only(true)
        .build();
    (sid, jar.add(cookie))
}

/// Drops the session cookie (explicit disconnect).
pub fn clear_session(jar: SignedCookieJar) -> SignedCookieJar {
    jar.remove(Cookie::build((SESSION_COOKIE, "")).path("/").build())
}
