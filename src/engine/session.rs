//! The seam between the engine and a concrete interpreter.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;

use crate::{
    error::EngineResult,
    execution::{Diagnostic, Invocation, InvocationFault, InvocationOutput},
    process::module_path::ModulePathSetup,
};

/// Receives diagnostics as the session produces them, before the call returns.
pub type DiagnosticSink<'a> = &'a (dyn Fn(&Diagnostic) + Send + Sync);

/// A long-lived interpreter session. Not reentrant: callers serialize access.
#[async_trait]
pub trait Session: Send {
    async fn invoke(
        &mut self,
        invocation: &Invocation,
        on_diagnostic: DiagnosticSink<'_>,
    ) -> Result<InvocationOutput, InvocationFault>;

    /// Stops whatever is in flight. Returns true when the abort discarded the
    /// remote connection along with it.
    async fn abort(&mut self) -> bool;

    async fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub pwsh_path: PathBuf,
    pub allow_unrestricted_scripts: bool,
    pub module_path: Option<ModulePathSetup>,
    pub start_timeout: Duration,
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, options: &SessionOptions) -> EngineResult<Box<dyn Session>>;
}
