//! Partymic Core - shared library for the karaoke session controller.
//!
//! Phones on the local network join rooms (a lobby plus six numbered
//! microphones), each connected player gets a WebRTC audio ingress wired
//! into a virtual sink of the external audio graph, and an operator - or
//! the playlist automation - drives UltraStar Deluxe through synthesized
//! input events.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`audio`]: Audio-graph adapter, per-session ingress supervision
//! - [`services`]: Sessions, rooms, control lock, input, automation
//! - [`songs`]: Song index and playlist file
//! - [`game`]: Game config rewriting and log tailing
//! - [`events`]: Snapshot fan-out to SSE subscribers
//! - [`api`]: HTTP/SSE surface
//! - [`bootstrap`]: Composition root wiring everything together
//! - [`error`]: Centralized error types
//!
//! External tools (the audio graph, the ingress binary, the input tool,
//! the overlay, the game itself) are reached through narrow seams so the
//! coordination logic stays testable without them.

#![warn(clippy::all)]

pub mod api;
pub mod audio;
pub mod bootstrap;
pub mod error;
pub mod events;
pub mod game;
pub mod services;
pub mod songs;
pub mod state;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, ServerError};
pub use audio::{sink_name, AudioGraph, IngressManager, SINK_COUNT};
pub use bootstrap::{bootstrap_services, BootstrappedServices};
pub use error::{ErrorCode, PartymicError, PartymicResult};
pub use events::EventHub;
pub use game::{GameConfig, LogTailer};
pub use services::{
    ControlService, PlaylistAutomation, RoomCoordinator, SessionRegistry,
};
pub use songs::{PlaylistFile, SongIndex};
pub use state::Config;
