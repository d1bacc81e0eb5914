use std::fmt;

use thiserror::Error;

use crate::lsl::types::Type;

/// Everything that can stop a handler against the script's will.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeFault {
    #[error("memory usage {usage} exceeds limit {limit}")]
    MemoryLimit { usage: i32, limit: i32 },
    #[error("event handler already active")]
    HandlerActive,
    #[error("cannot start the None event")]
    NoneEvent,
    #[error("unknown event {0}")]
    UnknownEvent(String),
    #[error("bad arguments for {event}: {message}")]
    BadEventArgs { event: String, message: String },
    #[error("{0}() transitioned state")]
    NestedTransition(&'static str),
    #[error("cannot cast {from} to {to}")]
    BadCast { from: String, to: Type },
    #[error("math error: {0}")]
    Math(&'static str),
    #[error("call depth exceeds {0}")]
    CallDepth(usize),
    #[error("{function}: {message}")]
    Host { function: String, message: String },
    #[error("cannot {operation} while {status}")]
    InvalidStatus {
        operation: &'static str,
        status: &'static str,
    },
    #[error("corrupt bytecode: {0}")]
    CorruptBytecode(String),
    #[error("migration failed: {0}")]
    Migration(String),
}

/// Where a fault happened in the script source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub function: String,
    pub line: u32,
    pub column: u32,
}

/// A fault together with the script position that raised it, when there is one.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedFault {
    pub fault: RuntimeFault,
    pub location: Option<SourceLocation>,
}

impl LocatedFault {
    pub fn at(fault: RuntimeFault, location: SourceLocation) -> Self {
        Self {
            fault,
            location: Some(location),
        }
    }
}

impl From<RuntimeFault> for LocatedFault {
    fn from(fault: RuntimeFault) -> Self {
        Self { fault, location: None }
    }
}

impl fmt::Display for LocatedFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{} ({} line {}:{})", self.fault, loc.function, loc.line, loc.column),
            None => write!(f, "{}", self.fault),
        }
    }
}

impl std::error::Error for LocatedFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.fault)
    }
}

/// Requests raised by host calls that unwind the whole handler.
/// Script code never sees or intercepts these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Re-initialize globals and restart in the default state.
    Reset,
    /// Dispose the instance.
    Terminate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn located_fault_display() {
        let fault = LocatedFault::at(
            RuntimeFault::Math("division by zero"),
            SourceLocation {
                function: "default state_entry".into(),
                line: 4,
                column: 9,
            },
        );
        assert_eq!(
            fault.to_string(),
            "math error: division by zero (default state_entry line 4:9)"
        );
        let bare: LocatedFault = RuntimeFault::HandlerActive.into();
        assert_eq!(bare.to_string(), "event handler already active");
    }

    #[test]
    fn nested_transition_message() {
        assert_eq!(
            RuntimeFault::NestedTransition("state_exit").to_string(),
            "state_exit() transitioned state"
        );
    }
}
