//! Execution protocol: per-call invocations, raw session output and result types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

pub mod pwsh;

/// One output object, properties in the order the session emitted them. Shape depends on the command.
pub type Record = serde_json::Map<String, Value>;

/// A caller's request: command name plus named parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl CommandRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn validate(&self, max_name_len: usize, max_params: usize) -> EngineResult<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation("command name is empty".into()));
        }
        if name.chars().count() > max_name_len {
            return Err(EngineError::Validation(format!(
                "command name exceeds {} characters",
                max_name_len
            )));
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(EngineError::Validation(format!(
                "command name contains whitespace or control characters: {:?}",
                self.name
            )));
        }
        if self.parameters.len() > max_params {
            return Err(EngineError::Validation(format!(
                "{} parameters given, at most {} allowed",
                self.parameters.len(),
                max_params
            )));
        }
        if let Some(bad) = self.parameters.keys().find(|k| !is_parameter_name(k)) {
            return Err(EngineError::Validation(format!(
                "invalid parameter name: {:?}",
                bad
            )));
        }
        Ok(())
    }
}

fn is_parameter_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// How the session treats non-terminating errors for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorAction {
    #[default]
    Continue,
    Stop,
}

/// Per-call execution context. Built fresh for every attempt; the session it runs
/// against is shared.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Invocation {
    pub command: String,
    pub parameters: BTreeMap<String, Value>,
    pub error_action: ErrorAction,
}

impl Invocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command(&mut self, name: impl Into<String>) -> &mut Self {
        self.command = name.into();
        self
    }

    pub fn parameter(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn parameters(&mut self, params: &BTreeMap<String, Value>) -> &mut Self {
        self.parameters
            .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn error_action(&mut self, action: ErrorAction) -> &mut Self {
        self.error_action = action;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Information,
    Warning,
    Verbose,
    Debug,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
}

impl Diagnostic {
    pub fn new(level: DiagnosticLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Underlying cause reported for an error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCause {
    Timeout,
    Network,
    Remoting,
    #[default]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(default)]
    pub cause: ErrorCause,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>, cause: ErrorCause) -> Self {
        Self {
            message: message.into(),
            cause,
        }
    }
}

/// Everything one invocation produced, before classification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationOutput {
    pub records: Vec<Record>,
    pub errors: Vec<ErrorRecord>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Failure raised by the session itself rather than reported in the error stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationFault {
    pub kind: FaultKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Timeout,
    Transport,
    /// The interpreter process went away; any remote connection went with it.
    SessionLost,
    Other,
}

impl InvocationFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for InvocationFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Successful execution outcome handed back to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandResult {
    pub records: Vec<Record>,
    pub diagnostics: Vec<Diagnostic>,
}

impl From<InvocationOutput> for CommandResult {
    fn from(out: InvocationOutput) -> Self {
        Self {
            records: out.records,
            diagnostics: out.diagnostics,
        }
    }
}
