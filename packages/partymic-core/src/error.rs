//! Centralized error types for the Partymic core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::audio::graph::GraphError;
use crate::audio::ingress::IngressError;
use crate::services::input::InputError;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

impl ErrorCode for GraphError {
    fn code(&self) -> &'static str {
        match self {
            Self::ToolUnavailable(_) => "audio_graph_unavailable",
            Self::CommandFailed { .. } => "audio_graph_error",
            Self::Io(_) => "audio_graph_io",
        }
    }
}

impl ErrorCode for IngressError {
    fn code(&self) -> &'static str {
        match self {
            Self::EmptyOffer => "invalid_input",
            Self::BinaryMissing(_) => "ingress_unavailable",
            Self::Spawn(_) => "ingress_failed",
            Self::Handshake(_) => "ingress_failed",
            Self::ChildExited(_) => "ingress_failed",
        }
    }
}

impl ErrorCode for InputError {
    fn code(&self) -> &'static str {
        match self {
            Self::ToolMissing => "input_tool_missing",
            Self::WindowNotFound => "game_window_not_found",
            Self::CommandFailed(_) => "input_failed",
        }
    }
}

/// Application-wide error type for the Partymic server.
#[derive(Debug, Error)]
pub enum PartymicError {
    /// Missing or malformed required field.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Room name not in the allowed set.
    #[error("Unknown room: {0}")]
    UnknownRoom(String),

    /// Mic room at capacity. Carries the current membership snapshot so
    /// clients can render the conflict.
    #[error("{room} is full")]
    RoomFull {
        room: String,
        members: usize,
        capacity: usize,
        rooms: serde_json::Value,
        capacity_map: serde_json::Value,
    },

    /// Operation requires the control lock.
    #[error("Control lock required")]
    ControlRequired,

    /// Control passphrase must be supplied via /control/auth first.
    #[error("Control password required")]
    ControlPasswordRequired,

    /// Supplied control passphrase did not match.
    #[error("Invalid control password")]
    InvalidPassword,

    /// Another session already holds the control lock.
    #[error("Control already taken")]
    Conflict {
        owner: u64,
        owner_name: Option<String>,
    },

    /// Mutating control operation from a session that is not the owner.
    #[error("Not owner")]
    NotOwner,

    /// Key not in the keystroke whitelist.
    #[error("Unsupported key")]
    UnsupportedKey,

    /// Song id (or similar resource) unknown.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Path resolved outside the allowed root.
    #[error("Forbidden")]
    Forbidden,

    /// Timed out waiting for the serialized ingress start slot.
    #[error("Timed out waiting to start session")]
    IngressBusy,

    /// Child process failed to start or negotiate.
    #[error("Ingress failed: {0}")]
    IngressFailed(String),

    /// Underlying audio-graph tool failure.
    #[error("Audio graph error: {0}")]
    AudioGraph(String),

    /// Playlist automation failure (phase timeout, synthesized input).
    #[error("Automation error: {0}")]
    Automation(String),

    /// Server is running in control-only mode (no audio operations).
    #[error("Server is running in control-only mode")]
    ControlOnly,

    /// Unexpected condition.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PartymicError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::UnknownRoom(_) => "unknown_room",
            Self::RoomFull { .. } => "room_full",
            Self::ControlRequired => "control_required",
            Self::ControlPasswordRequired => "control_password_required",
            Self::InvalidPassword => "invalid_password",
            Self::Conflict { .. } => "conflict",
            Self::NotOwner => "not_owner",
            Self::UnsupportedKey => "unsupported_key",
            Self::NotFound(_) => "not_found",
            Self::Forbidden => "forbidden",
            Self::IngressBusy => "ingress_busy",
            Self::IngressFailed(_) => "ingress_failed",
            Self::AudioGraph(_) => "audio_graph_error",
            Self::Automation(_) => "automation_error",
            Self::ControlOnly => "control_only",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::UnknownRoom(_) | Self::UnsupportedKey => {
                StatusCode::BAD_REQUEST
            }
            Self::RoomFull { .. } | Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::ControlRequired
            | Self::ControlPasswordRequired
            | Self::InvalidPassword
            | Self::NotOwner
            | Self::Forbidden
            | Self::ControlOnly => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type PartymicResult<T> = Result<T, PartymicError>;

impl IntoResponse for PartymicError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // A few variants carry extra context the UI needs to react to.
        let mut body = json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.code(),
        });
        match &self {
            Self::RoomFull {
                room,
                members,
                capacity,
                rooms,
                capacity_map,
            } => {
                body["room"] = json!(room);
                body["members"] = json!(members);
                body["capacity"] = json!(capacity);
                body["rooms"] = rooms.clone();
                body["capacity_map"] = capacity_map.clone();
            }
            Self::Conflict { owner, owner_name } => {
                body["owner"] = json!(owner);
                body["owner_name"] = json!(owner_name);
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

impl From<GraphError> for PartymicError {
    fn from(err: GraphError) -> Self {
        Self::AudioGraph(err.to_string())
    }
}

impl From<IngressError> for PartymicError {
    fn from(err: IngressError) -> Self {
        match err {
            IngressError::EmptyOffer => Self::InvalidInput("Offer must not be empty".into()),
            other => Self::IngressFailed(other.to_string()),
        }
    }
}

impl From<InputError> for PartymicError {
    fn from(err: InputError) -> Self {
        Self::Automation(err.to_string())
    }
}

impl From<std::io::Error> for PartymicError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_full_maps_to_conflict_status() {
        let err = PartymicError::RoomFull {
            room: "mic1".into(),
            members: 2,
            capacity: 2,
            rooms: json!({}),
            capacity_map: json!({}),
        };
        assert_eq!(err.code(), "room_full");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn control_errors_map_to_forbidden() {
        assert_eq!(
            PartymicError::ControlRequired.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            PartymicError::ControlPasswordRequired.code(),
            "control_password_required"
        );
        assert_eq!(
            PartymicError::NotOwner.status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn empty_offer_converts_to_invalid_input() {
        let err: PartymicError = IngressError::EmptyOffer.into();
        assert_eq!(err.code(), "invalid_input");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
