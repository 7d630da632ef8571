//! pwsh process bootstrap and I/O glue.

use std::{path::Path, process::Stdio};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
};
use tracing::debug;

use super::{module_path::ModulePathSetup, ProcessHandle};
use crate::error::{EngineError, EngineResult};

/// Arguments that run `bootstrap` without touching the user profile. stdin stays free
/// for the bootstrap's own request loop.
pub fn session_args(allow_unrestricted_scripts: bool, bootstrap: &str) -> Vec<String> {
    let mut args: Vec<String> = vec!["-NoLogo".into(), "-NoProfile".into(), "-NonInteractive".into()];
    if allow_unrestricted_scripts {
        args.extend(["-ExecutionPolicy".into(), "Bypass".into()]);
    }
    args.extend(["-Command".into(), bootstrap.into()]);
    args
}

/// Arguments for a one-shot `-Command` run.
pub fn oneshot_args(script: &str) -> Vec<String> {
    vec![
        "-NoLogo".into(),
        "-NoProfile".into(),
        "-NonInteractive".into(),
        "-Command".into(),
        script.into(),
    ]
}

pub fn start_pwsh(
    pwsh: &Path,
    bootstrap: &str,
    allow_unrestricted_scripts: bool,
    module_path: Option<&ModulePathSetup>,
) -> EngineResult<ProcessHandle> {
    let mut cmd = Command::new(pwsh);
    cmd.args(session_args(allow_unrestricted_scripts, bootstrap))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(setup) = module_path {
        setup.apply(&mut cmd);
    }

    let mut child: Child = cmd.spawn().map_err(|e| {
        EngineError::Runtime(format!("failed to start {}: {}", pwsh.display(), e))
    })?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| EngineError::Runtime("interpreter has no stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::Runtime("interpreter has no stdout".into()))?;

    // stderr is drained into the log so a chatty module can never fill the pipe.
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "tenant_console::pwsh", "{}", line);
            }
        });
    }

    Ok(ProcessHandle {
        child,
        stdin,
        stdout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_only_when_enabled() {
        assert!(!session_args(false, "exit").iter().any(|a| a == "Bypass"));
        let relaxed = session_args(true, "exit");
        assert!(relaxed.iter().any(|a| a == "Bypass"));
        assert_eq!(relaxed.last().map(String::as_str), Some("exit"));
    }
}
