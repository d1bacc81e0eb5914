use std::fmt;

use crate::lsl::error::CompileError;
use crate::lsl::module::ModuleError;
use crate::runtime::error::LocatedFault;
use crate::runtime::migration::MigrationFault;
use crate::settings::SettingsError;

/// Top-level error for the CLI and embedders. Each variant wraps the error
/// of one stage so callers can still match on where things went wrong.
#[derive(Debug)]
pub enum EngineError {
    Compile(Vec<CompileError>),
    Module(ModuleError),
    Runtime(LocatedFault),
    Migration(MigrationFault),
    Settings(SettingsError),
    Io(std::io::Error),
    Usage(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Compile(errors) => {
                write!(f, "{} compile error(s)", errors.len())?;
                for e in errors {
                    write!(f, "\n  {e}")?;
                }
                Ok(())
            }
            EngineError::Module(e) => write!(f, "{e}"),
            EngineError::Runtime(e) => write!(f, "Runtime fault: {e}"),
            EngineError::Migration(e) => write!(f, "{e}"),
            EngineError::Settings(e) => write!(f, "Settings error: {e}"),
            EngineError::Io(e) => write!(f, "I/O error: {e}"),
            EngineError::Usage(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<Vec<CompileError>> for EngineError {
    fn from(e: Vec<CompileError>) -> Self {
        EngineError::Compile(e)
    }
}

impl From<ModuleError> for EngineError {
    fn from(e: ModuleError) -> Self {
        EngineError::Module(e)
    }
}

impl From<LocatedFault> for EngineError {
    fn from(e: LocatedFault) -> Self {
        EngineError::Runtime(e)
    }
}

impl From<MigrationFault> for EngineError {
    fn from(e: MigrationFault) -> Self {
        EngineError::Migration(e)
    }
}

impl From<SettingsError> for EngineError {
    fn from(e: SettingsError) -> Self {
        EngineError::Settings(e)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e)
    }
}

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Usage(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::lsl::compile;
    use crate::runtime::error::RuntimeFault;

    #[test]
    fn compile_errors_are_listed() {
        let errors = compile("default { state_entry() { x = 1; y = 2; } }").unwrap_err();
        let err = EngineError::from(errors);
        let text = err.to_string();
        assert!(text.starts_with("2 compile error(s)"), "{text}");
        assert!(text.contains("undefined variable x"), "{text}");
    }

    #[test]
    fn runtime_fault_display() {
        let err = EngineError::from(LocatedFault::from(RuntimeFault::NoneEvent));
        assert_eq!(err.to_string(), "Runtime fault: cannot start the None event");
    }
}
