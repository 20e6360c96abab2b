//! Input synthesis into the game window.
//!
//! Wraps `xdotool`. The game's window id is looked up once (substring
//! search over window names) and cached; every subsequent invocation
//! targets that window explicitly so synthesized events land in the game
//! even when it is not focused.

use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::process::Command;

/// Errors from input synthesis.
#[derive(Debug, Error)]
pub enum InputError {
    /// `xdotool` is not installed.
    #[error("xdotool not installed")]
    ToolMissing,

    /// The game window could not be located.
    #[error("game window not found")]
    WindowNotFound,

    /// The tool ran but failed.
    #[error("input command failed: {0}")]
    CommandFailed(String),
}

/// Seam for sending input events to the game.
///
/// The automation and the control surface depend on this trait; tests
/// substitute a recording implementation.
#[async_trait]
pub trait InputDriver: Send + Sync {
    /// Sends a symbolic key (e.g. `Return`, `Escape`).
    async fn key(&self, key: &str) -> Result<(), InputError>;

    /// Types a literal string with no inter-key delay.
    async fn type_text(&self, text: &str) -> Result<(), InputError>;
}

/// `xdotool`-backed input driver.
pub struct XdotoolInput {
    window_title: String,
    window_id: Mutex<Option<String>>,
}

impl XdotoolInput {
    /// Creates a driver targeting the first window whose name contains
    /// `window_title`.
    pub fn new(window_title: String) -> Self {
        Self {
            window_title,
            window_id: Mutex::new(None),
        }
    }

    async fn run_tool(args: &[&str]) -> Result<String, InputError> {
        let output = Command::new("xdotool")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    InputError::ToolMissing
                } else {
                    InputError::CommandFailed(e.to_string())
                }
            })?;
        if !output.status.success() {
            return Err(InputError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn window_id(&self) -> Result<String, InputError> {
        if let Some(id) = self.window_id.lock().clone() {
            return Ok(id);
        }
        let listing = Self::run_tool(&["search", &self.window_title]).await?;
        let id = listing
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or(InputError::WindowNotFound)?;
        log::debug!("[Input] Cached game window id {}", id);
        *self.window_id.lock() = Some(id.clone());
        Ok(id)
    }

    async fn run(&self, subcmd: &str, rest: &[&str]) -> Result<(), InputError> {
        let window = self.window_id().await?;
        let mut args = vec![subcmd, "--window", window.as_str()];
        args.extend_from_slice(rest);
        match Self::run_tool(&args).await {
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("[Input] xdotool {} failed: {}", subcmd, e);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl InputDriver for XdotoolInput {
    async fn key(&self, key: &str) -> Result<(), InputError> {
        self.run("key", &[key]).await
    }

    async fn type_text(&self, text: &str) -> Result<(), InputError> {
        self.run("type", &["--delay", "0", text]).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Arc;

    /// Recording driver for automation and control tests.
    #[derive(Default)]
    pub struct RecordingInput {
        pub events: Mutex<Vec<String>>,
        pub fail: Mutex<bool>,
    }

    impl RecordingInput {
        pub fn shared() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn taken(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        pub fn set_failing(&self, failing: bool) {
            *self.fail.lock() = failing;
        }
    }

    #[async_trait]
    impl InputDriver for RecordingInput {
        async fn key(&self, key: &str) -> Result<(), InputError> {
            if *self.fail.lock() {
                return Err(InputError::CommandFailed("simulated".into()));
            }
            self.events.lock().push(format!("key:{key}"));
            Ok(())
        }

        async fn type_text(&self, text: &str) -> Result<(), InputError> {
            if *self.fail.lock() {
                return Err(InputError::CommandFailed("simulated".into()));
            }
            self.events.lock().push(format!("type:{text}"));
            Ok(())
        }
    }
}
