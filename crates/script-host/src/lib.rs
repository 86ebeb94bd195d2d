//! Perch Script Host
//!
//! Owns one sandboxed interpreter session at a time and drives it through
//! named events, one coroutine resume per event. Provides:
//!
//! - the event queue host collaborators post into,
//! - the resource handle table mapping opaque tokens to native objects,
//! - the watchdog that kills scripts which never yield,
//! - the cooperative scheduler (`Session::drain`),
//! - the script-facing `system`/`fs` API.
//!
//! ## Script API
//!
//! - `system.queue_event(name, ...)` - post an event to the machine
//! - `system.reboot()` / `system.shutdown()` - power requests, honored at
//!   the next host tick
//! - `system.log(msg)` - structured log line
//! - `system.uptime()` - seconds since this session booted
//! - `fs.open(path, mode)` / `fs.read(h)` / `fs.write(h, data)` /
//!   `fs.close(h)` - handle-based file access inside the virtual root
//! - `fs.exists` / `fs.list` / `fs.makedir` / `fs.delete`

mod bindings;
mod handles;
mod queue;
mod session;
mod watchdog;

pub use bindings::*;
pub use handles::*;
pub use queue::*;
pub use session::*;
pub use watchdog::*;

use std::sync::{Mutex, PoisonError};

use perch_protocol::PowerAction;

/// Errors from script execution, fatal to the current session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    #[error("{message}")]
    Syntax { message: String },

    #[error("out of memory: {message}")]
    OutOfMemory { message: String },

    #[error("{message}")]
    Runtime {
        message: String,
        traceback: Option<String>,
    },
}

/// Power request latch, set synchronously from script space (or the host's
/// forced-reboot gesture) and consumed by the boot state machine between
/// drains.
///
/// Shutdown is sticky: a reboot request never downgrades it.
#[derive(Debug, Default)]
pub struct PowerSwitch {
    requested: Mutex<Option<PowerAction>>,
}

impl PowerSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, action: PowerAction) {
        let mut slot = self.lock();
        match *slot {
            Some(PowerAction::Shutdown) => {}
            _ => *slot = Some(action),
        }
    }

    pub fn take(&self) -> Option<PowerAction> {
        self.lock().take()
    }

    #[must_use]
    pub fn pending(&self) -> Option<PowerAction> {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PowerAction>> {
        self.requested.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_is_sticky() {
        let power = PowerSwitch::new();
        power.request(PowerAction::Shutdown);
        power.request(PowerAction::Reboot);
        assert_eq!(power.take(), Some(PowerAction::Shutdown));
        assert_eq!(power.take(), None);
    }

    #[test]
    fn reboot_upgrades_to_shutdown() {
        let power = PowerSwitch::new();
        power.request(PowerAction::Reboot);
        power.request(PowerAction::Shutdown);
        assert_eq!(power.pending(), Some(PowerAction::Shutdown));
    }
}
