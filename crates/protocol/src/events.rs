//! Events delivered to the scripted computer and fault diagnostics

use serde::{Deserialize, Serialize};

use crate::HandleToken;

/// Name of the canonical filter-bypassing event.
pub const INTERRUPT_EVENT: &str = "interrupt";

/// A value carried by an event into script space.
///
/// The set is closed by design: everything here survives serialization and
/// converts losslessly to an interpreter stack value at delivery time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EventValue {
    Nil,
    Bool(bool),
    Int(i64),
    Number(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Opaque reference to a native resource in the session's handle table.
    Handle(HandleToken),
}

impl From<&str> for EventValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for EventValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for EventValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<f64> for EventValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for EventValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// A named, ordered unit of work delivered to the session coroutine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub args: Vec<EventValue>,
    /// Delivered even when the active filter set excludes the name.
    #[serde(default)]
    pub always_deliver: bool,
}

impl Event {
    /// An ordinary, filterable event.
    #[must_use]
    pub fn new(name: impl Into<String>, args: Vec<EventValue>) -> Self {
        Self {
            name: name.into(),
            args,
            always_deliver: false,
        }
    }

    /// An event that bypasses the active filter set.
    #[must_use]
    pub fn unfiltered(name: impl Into<String>, args: Vec<EventValue>) -> Self {
        Self {
            name: name.into(),
            args,
            always_deliver: true,
        }
    }

    /// The interrupt signal (always delivered).
    #[must_use]
    pub fn interrupt() -> Self {
        Self::unfiltered(INTERRUPT_EVENT, vec![])
    }
}

/// Diagnostic captured when a session dies on an uncaught script error.
///
/// The message is preserved verbatim for the panic surface; the traceback is
/// attached when the interpreter produced one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultReport {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl FaultReport {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: None,
        }
    }

    #[must_use]
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

impl std::fmt::Display for FaultReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(trace) = &self.traceback {
            write!(f, "\n{trace}")?;
        }
        Ok(())
    }
}
