//! pwsh execution protocol: an NDJSON request loop running inside one long-lived process.
//!
//! Each request is a single JSON line on stdin. The bootstrap splats the parameters,
//! merges every stream into the pipeline and writes one JSON line per item, tagged with
//! the request id, then an `end` line. Lines carrying another id are leftovers from an
//! abandoned call and are skipped.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout},
    time::timeout,
};
use tracing::{debug, warn};

use super::{
    Diagnostic, DiagnosticLevel, ErrorAction, ErrorCause, ErrorRecord, FaultKind, Invocation,
    InvocationFault, InvocationOutput, Record,
};
use crate::{
    engine::session::{DiagnosticSink, Session, SessionFactory, SessionOptions},
    error::{EngineError, EngineResult},
    process::pwsh::start_pwsh,
};

const BOOTSTRAP: &str = r##"
$ErrorActionPreference = 'Continue'
$ProgressPreference = 'SilentlyContinue'
function Emit($Id, $Kind, $Payload) {
    $out = (@{ id = $Id; kind = $Kind } + $Payload) | ConvertTo-Json -Compress -Depth 8
    [Console]::Out.WriteLine($out)
    [Console]::Out.Flush()
}
function Get-Cause($Err) {
    $ex = $Err.Exception
    while ($null -ne $ex) {
        $name = $ex.GetType().FullName
        if ($name -match 'Timeout') { return 'timeout' }
        if ($name -match 'Remoting') { return 'remoting' }
        if ($name -match 'Http|Socket|WebException|IOException') { return 'network' }
        $ex = $ex.InnerException
    }
    return 'other'
}
Emit 0 'ready' @{}
while ($null -ne ($req = [Console]::In.ReadLine())) {
    if ([string]::IsNullOrWhiteSpace($req)) { continue }
    $req = $req | ConvertFrom-Json
    $id = $req.id
    $params = @{}
    if ($null -ne $req.parameters) {
        foreach ($p in $req.parameters.PSObject.Properties) { $params[$p.Name] = $p.Value }
    }
    if ($req.errorAction -eq 'stop') { $params['ErrorAction'] = 'Stop' }
    try {
        & $req.command @params *>&1 | ForEach-Object {
            $item = $_
            if ($item -is [System.Management.Automation.ErrorRecord]) {
                Emit $id 'error' @{ message = $item.ToString(); cause = (Get-Cause $item) }
            } elseif ($item -is [System.Management.Automation.WarningRecord]) {
                Emit $id 'warning' @{ message = $item.Message }
            } elseif ($item -is [System.Management.Automation.VerboseRecord]) {
                Emit $id 'verbose' @{ message = $item.Message }
            } elseif ($item -is [System.Management.Automation.DebugRecord]) {
                Emit $id 'debug' @{ message = $item.Message }
            } elseif ($item -is [System.Management.Automation.InformationRecord]) {
                Emit $id 'information' @{ message = [string]$item.MessageData }
            } else {
                Emit $id 'record' @{ data = $item }
            }
        }
    } catch {
        Emit $id 'error' @{ message = $_.ToString(); cause = (Get-Cause $_) }
    }
    Emit $id 'end' @{}
}
"##;

#[derive(Debug, Deserialize)]
struct WireLine {
    #[serde(default)]
    id: u64,
    kind: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    cause: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

fn parse_cause(raw: Option<&str>) -> ErrorCause {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("timeout") => ErrorCause::Timeout,
        Some("network") => ErrorCause::Network,
        Some("remoting") => ErrorCause::Remoting,
        _ => ErrorCause::Other,
    }
}

fn into_record(data: Value) -> Record {
    match data {
        Value::Object(map) => map,
        other => {
            let mut map = Record::new();
            map.insert("Value".into(), other);
            map
        }
    }
}

/// Builds the request line for one invocation.
pub fn encode_request(id: u64, invocation: &Invocation) -> String {
    let action = match invocation.error_action {
        ErrorAction::Stop => "stop",
        ErrorAction::Continue => "continue",
    };
    json!({
        "id": id,
        "command": invocation.command,
        "parameters": invocation.parameters,
        "errorAction": action,
    })
    .to_string()
}

/// Outcome of folding one stdout line into the output being collected.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    More,
    Done,
}

fn apply_line(
    id: u64,
    line: &str,
    out: &mut InvocationOutput,
    on_diagnostic: DiagnosticSink<'_>,
) -> Step {
    let line = line.trim();
    if line.is_empty() {
        return Step::More;
    }
    let wire: WireLine = match serde_json::from_str(line) {
        Ok(w) => w,
        Err(_) => {
            // Raw console output from a module, e.g. a sign-in banner.
            let diag = Diagnostic::new(DiagnosticLevel::Information, line);
            on_diagnostic(&diag);
            out.diagnostics.push(diag);
            return Step::More;
        }
    };
    if wire.id != id {
        debug!(expected = id, got = wire.id, "skipping stale session output");
        return Step::More;
    }
    let level = match wire.kind.as_str() {
        "end" => return Step::Done,
        "record" => {
            out.records.push(into_record(wire.data.unwrap_or(Value::Null)));
            return Step::More;
        }
        "error" => {
            out.errors.push(ErrorRecord::new(
                wire.message.unwrap_or_default(),
                parse_cause(wire.cause.as_deref()),
            ));
            return Step::More;
        }
        "warning" => DiagnosticLevel::Warning,
        "verbose" => DiagnosticLevel::Verbose,
        "debug" => DiagnosticLevel::Debug,
        _ => DiagnosticLevel::Information,
    };
    let diag = Diagnostic::new(level, wire.message.unwrap_or_default());
    on_diagnostic(&diag);
    out.diagnostics.push(diag);
    Step::More
}

struct Live {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

impl Live {
    async fn spawn(options: &SessionOptions) -> EngineResult<Self> {
        let handle = start_pwsh(
            &options.pwsh_path,
            BOOTSTRAP,
            options.allow_unrestricted_scripts,
            options.module_path.as_ref(),
        )?;
        let mut live = Live {
            child: handle.child,
            stdin: handle.stdin,
            lines: BufReader::new(handle.stdout).lines(),
        };

        let ready = timeout(options.start_timeout, async {
            while let Some(line) = live.lines.next_line().await? {
                if let Ok(wire) = serde_json::from_str::<WireLine>(line.trim()) {
                    if wire.kind == "ready" {
                        return Ok(true);
                    }
                }
            }
            Ok::<bool, std::io::Error>(false)
        })
        .await
        .map_err(|_| {
            EngineError::Timeout(format!(
                "interpreter did not become ready within {}s",
                options.start_timeout.as_secs()
            ))
        })??;
        if !ready {
            return Err(EngineError::Runtime(
                "interpreter exited before becoming ready".into(),
            ));
        }
        Ok(live)
    }

    async fn exchange(
        &mut self,
        id: u64,
        invocation: &Invocation,
        on_diagnostic: DiagnosticSink<'_>,
    ) -> Result<InvocationOutput, InvocationFault> {
        let mut request = encode_request(id, invocation);
        request.push('\n');
        let lost = |e: std::io::Error| InvocationFault::new(FaultKind::SessionLost, e.to_string());
        self.stdin.write_all(request.as_bytes()).await.map_err(lost)?;
        self.stdin.flush().await.map_err(lost)?;

        let mut out = InvocationOutput::default();
        loop {
            match self.lines.next_line().await.map_err(lost)? {
                Some(line) => {
                    if apply_line(id, &line, &mut out, on_diagnostic) == Step::Done {
                        return Ok(out);
                    }
                }
                None => {
                    return Err(InvocationFault::new(
                        FaultKind::SessionLost,
                        "interpreter process exited during the call",
                    ))
                }
            }
        }
    }

    async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill interpreter process");
        }
    }
}

/// Session backed by a pwsh child process. A lost process is respawned on the next call.
pub struct PwshSession {
    options: SessionOptions,
    live: Option<Live>,
    next_id: u64,
}

impl PwshSession {
    pub async fn start(options: SessionOptions) -> EngineResult<Self> {
        let live = Live::spawn(&options).await?;
        Ok(Self {
            options,
            live: Some(live),
            next_id: 0,
        })
    }
}

#[async_trait]
impl Session for PwshSession {
    async fn invoke(
        &mut self,
        invocation: &Invocation,
        on_diagnostic: DiagnosticSink<'_>,
    ) -> Result<InvocationOutput, InvocationFault> {
        if self.live.is_none() {
            debug!("respawning interpreter process");
            let live = Live::spawn(&self.options).await.map_err(|e| match e {
                EngineError::Timeout(m) => InvocationFault::new(FaultKind::Timeout, m),
                other => InvocationFault::new(FaultKind::SessionLost, other.to_string()),
            })?;
            self.live = Some(live);
        }
        self.next_id += 1;
        let id = self.next_id;
        let live = match self.live.as_mut() {
            Some(live) => live,
            None => {
                return Err(InvocationFault::new(
                    FaultKind::SessionLost,
                    "interpreter process unavailable",
                ))
            }
        };
        let result = live.exchange(id, invocation, on_diagnostic).await;
        if matches!(&result, Err(f) if f.kind == FaultKind::SessionLost) {
            self.live = None;
        }
        result
    }

    async fn abort(&mut self) -> bool {
        match self.live.take() {
            Some(live) => {
                live.kill().await;
                true
            }
            None => false,
        }
    }

    async fn close(&mut self) {
        if let Some(live) = self.live.take() {
            live.kill().await;
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PwshSessionFactory;

#[async_trait]
impl SessionFactory for PwshSessionFactory {
    async fn create(&self, options: &SessionOptions) -> EngineResult<Box<dyn Session>> {
        Ok(Box::new(PwshSession::start(options.clone()).await?))
    }
}
