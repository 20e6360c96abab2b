//! Service layer: session/room coordination, operator control, input
//! synthesis and the playlist automation.

pub mod automation;
pub mod control;
pub mod input;
pub mod overlay;
pub mod registry;
pub mod rooms;

pub use automation::PlaylistAutomation;
pub use control::ControlService;
pub use input::{InputDriver, InputError, XdotoolInput};
pub use overlay::CountdownOverlay;
pub use registry::SessionRegistry;
pub use rooms::RoomCoordinator;
