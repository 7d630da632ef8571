//! Interpreter process management (startup/IO/bounded one-shot runs).

use std::{ffi::OsStr, process::Stdio, time::Duration};

use tokio::{
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

pub mod module_path;
pub mod pwsh;

pub struct ProcessHandle {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Captured result of a bounded one-shot process run.
#[derive(Debug, Clone, Default)]
pub struct BoundedOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl BoundedOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs `program` with redirected output and a hard deadline. The child is killed
/// when the deadline passes.
pub async fn run_bounded<I, S>(program: &OsStr, args: I, limit: Duration) -> EngineResult<BoundedOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| {
        EngineError::Runtime(format!(
            "failed to start {}: {}",
            program.to_string_lossy(),
            e
        ))
    })?;

    // Dropping the wait future on timeout drops the child, which kills it.
    let out = timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| {
            EngineError::Timeout(format!(
                "{} did not finish within {}s",
                program.to_string_lossy(),
                limit.as_secs()
            ))
        })??;

    let output = BoundedOutput {
        code: out.status.code(),
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    };
    debug!(
        program = %program.to_string_lossy(),
        code = ?output.code,
        "bounded process finished"
    );
    Ok(output)
}
