//! Handle on the fullscreen countdown overlay child process.
//!
//! The overlay itself is an external program; this module only launches
//! and terminates it. Launching replaces any overlay still on screen.

use std::path::PathBuf;
use std::process::{Child, Command};

use parking_lot::Mutex;

/// Supervisor of the single overlay child.
pub struct CountdownOverlay {
    command: Option<PathBuf>,
    child: Mutex<Option<Child>>,
}

impl CountdownOverlay {
    /// Creates the handle. With no command configured every launch is a
    /// no-op.
    pub fn new(command: Option<PathBuf>) -> Self {
        Self {
            command,
            child: Mutex::new(None),
        }
    }

    /// Launches the overlay showing `seconds`, replacing a running one.
    pub fn launch(&self, seconds: u64) {
        let Some(command) = &self.command else {
            log::debug!("[Overlay] No overlay command configured; skipping");
            return;
        };
        if cfg!(target_os = "linux") && std::env::var_os("DISPLAY").is_none() {
            log::warn!("[Overlay] DISPLAY not set; skipping countdown overlay");
            return;
        }
        let seconds = seconds.max(1);
        let mut guard = self.child.lock();
        if let Some(child) = guard.as_mut() {
            terminate(child);
        }
        match Command::new(command).arg(seconds.to_string()).spawn() {
            Ok(child) => {
                log::info!("[Overlay] Started countdown overlay for {}s", seconds);
                *guard = Some(child);
            }
            Err(e) => {
                log::error!(
                    "[Overlay] Failed to launch {}: {}",
                    command.display(),
                    e
                );
                *guard = None;
            }
        }
    }

    /// Terminates the overlay if one is on screen.
    pub fn stop(&self) {
        let mut guard = self.child.lock();
        if let Some(child) = guard.as_mut() {
            terminate(child);
            log::debug!("[Overlay] Stopped countdown overlay");
        }
        *guard = None;
    }

    /// Whether an overlay child is currently running.
    pub fn is_running(&self) -> bool {
        let mut guard = self.child.lock();
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        // Reap promptly if it already obeyed.
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_overlay_is_inert() {
        let overlay = CountdownOverlay::new(None);
        overlay.launch(5);
        assert!(!overlay.is_running());
        overlay.stop();
    }
}
