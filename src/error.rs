//! Error taxonomy shared by the command engine and the dependency resolver.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Required module is not installed: {0}")]
    ModuleMissing(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Command failed: {message}")]
    Command { message: String, transient: bool },
    #[error("Command failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<EngineError>,
    },
    #[error("Command execution error: {0}")]
    Execution(String),
    #[error("Command engine has been disposed")]
    Disposed,
    #[error("Failed to install module {module}: {detail}")]
    InstallFailed { module: String, detail: String },
    #[error("Runtime unavailable: {0}")]
    Runtime(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the failure is worth another attempt under the retry policy.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Command { transient, .. } => *transient,
            EngineError::Timeout(_) => true,
            _ => false,
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
