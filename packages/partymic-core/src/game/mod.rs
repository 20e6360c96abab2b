//! Integration with the karaoke game's on-disk surface: its `config.ini`
//! and its log file.

pub mod config;
pub mod log;

pub use config::{GameConfig, GameConfigError, MicSlot};
pub use log::LogTailer;
