//! Common types used across the runtime boundary

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an interpreter session (one per boot stage)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, pointer-sized reference to a natively owned resource.
///
/// Scripts only ever see the token (as light userdata); the native object
/// stays in the owning session's handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleToken(pub u64);

impl std::fmt::Display for HandleToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// The two boot stages of the machine lifecycle.
///
/// A module-level step counter advances monotonically and wraps; even steps
/// boot the privileged recovery environment, odd steps boot the sandboxed
/// user environment. There are no other stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootStage {
    /// Privileged, minimal environment that can install or repair the
    /// persisted user files.
    Bootstrap,
    /// Full sandboxed environment running the persisted entry script.
    UserSpace,
}

impl BootStage {
    /// Map a step counter value to its stage (even ⇒ Bootstrap, odd ⇒
    /// UserSpace).
    #[must_use]
    pub const fn from_step(step: u8) -> Self {
        if step % 2 == 0 {
            Self::Bootstrap
        } else {
            Self::UserSpace
        }
    }

    /// The stage a normal advance or reboot lands on.
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::Bootstrap => Self::UserSpace,
            Self::UserSpace => Self::Bootstrap,
        }
    }
}

impl std::fmt::Display for BootStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bootstrap => write!(f, "bootstrap"),
            Self::UserSpace => write!(f, "userspace"),
        }
    }
}

/// Power request raised synchronously from script space (or the host's
/// forced-reboot gesture); honored by the machine at the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    /// Tear the session down and boot the next stage.
    Reboot,
    /// Tear the session down and halt the machine (host application exit).
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_alternates_with_step() {
        assert_eq!(BootStage::from_step(0), BootStage::Bootstrap);
        assert_eq!(BootStage::from_step(1), BootStage::UserSpace);
        assert_eq!(BootStage::from_step(2), BootStage::Bootstrap);
        // Wrapped counter values still resolve to one of the two stages
        assert_eq!(BootStage::from_step(255), BootStage::UserSpace);
    }

    #[test]
    fn stage_next_cycles() {
        assert_eq!(BootStage::Bootstrap.next(), BootStage::UserSpace);
        assert_eq!(BootStage::UserSpace.next(), BootStage::Bootstrap);
    }

    #[test]
    fn token_serialization() {
        let token = HandleToken(42);
        let json = serde_json::to_string(&token).unwrap();
        let parsed: HandleToken = serde_json::from_str(&json).unwrap();
        assert_eq!(token, parsed);
    }
}
