//! Command execution engine: one interpreter session, lazy authentication, retries.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    auth::AuthProvider,
    error::{EngineError, EngineResult},
    execution::{
        pwsh::PwshSessionFactory, CommandRequest, CommandResult, Diagnostic, DiagnosticLevel,
        ErrorAction, FaultKind, Invocation,
    },
    notify::Notifier,
    process::module_path::ModulePathSetup,
};

pub mod retry;
pub mod session;

pub use retry::{Classification, RetryPolicy};
use retry::{classify_errors, classify_fault, indicates_disconnect, is_device_code_prompt};
use session::{Session, SessionFactory, SessionOptions};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub pwsh_path: PathBuf,
    pub allow_unrestricted_scripts: bool,
    pub connect_command: String,
    /// Parameter that receives the identity hint on the first connect attempt.
    pub identity_parameter: String,
    /// Extra parameters passed to every connect attempt.
    pub connect_parameters: BTreeMap<String, Value>,
    pub max_command_name_length: usize,
    pub max_parameter_count: usize,
    pub session_start_timeout: Duration,
    /// Budget for each connect attempt.
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    /// Directory the executable runs from; searched for a bundled runtime.
    pub base_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let mut connect_parameters = BTreeMap::new();
        connect_parameters.insert("ShowBanner".to_string(), Value::Bool(false));
        Self {
            pwsh_path: PathBuf::from("pwsh"),
            allow_unrestricted_scripts: false,
            connect_command: "Connect-ExchangeOnline".into(),
            identity_parameter: "UserPrincipalName".into(),
            connect_parameters,
            max_command_name_length: 128,
            max_parameter_count: 64,
            session_start_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            base_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ExecOptions {
    retry: RetryPolicy,
    auto_reconnect: bool,
}

#[derive(Default)]
struct EngineState {
    session: Option<Box<dyn Session>>,
    connected: bool,
    identity: Option<String>,
}

pub struct CommandEngine {
    settings: EngineSettings,
    factory: Arc<dyn SessionFactory>,
    auth: Arc<dyn AuthProvider>,
    notifier: Arc<dyn Notifier>,
    state: Mutex<EngineState>,
    disposed: AtomicBool,
}

impl CommandEngine {
    pub fn new(
        settings: EngineSettings,
        factory: Arc<dyn SessionFactory>,
        auth: Arc<dyn AuthProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            factory,
            auth,
            notifier,
            state: Mutex::new(EngineState::default()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Engine backed by a real pwsh process.
    pub fn pwsh(
        settings: EngineSettings,
        auth: Arc<dyn AuthProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::new(settings, Arc::new(PwshSessionFactory), auth, notifier)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Creates the interpreter session. Later calls return immediately.
    pub async fn initialize(&self, ct: &CancellationToken) -> EngineResult<()> {
        let mut state = self.lock(ct).await?;
        self.ensure_session(&mut state, ct).await
    }

    /// Opens the authenticated channel unless it is already open.
    pub async fn ensure_connected(&self, ct: &CancellationToken) -> EngineResult<()> {
        let mut state = self.lock(ct).await?;
        self.ensure_connected_locked(&mut state, ct).await
    }

    /// Validates, connects if needed, then runs the command with retries.
    pub async fn execute_command(
        &self,
        request: &CommandRequest,
        ct: &CancellationToken,
    ) -> EngineResult<CommandResult> {
        self.check_disposed()?;
        request.validate(
            self.settings.max_command_name_length,
            self.settings.max_parameter_count,
        )?;
        let mut state = self.lock(ct).await?;
        self.ensure_connected_locked(&mut state, ct).await?;
        let opts = ExecOptions {
            retry: self.settings.retry,
            auto_reconnect: true,
        };
        self.run_locked(&mut state, |inv| request_into(request, inv), opts, ct)
            .await
    }

    /// Like [`execute_command`](Self::execute_command) but never touches the primary
    /// connection. For capabilities that manage their own remote channel.
    pub async fn execute_raw_command(
        &self,
        request: &CommandRequest,
        ct: &CancellationToken,
    ) -> EngineResult<CommandResult> {
        self.check_disposed()?;
        request.validate(
            self.settings.max_command_name_length,
            self.settings.max_parameter_count,
        )?;
        let mut state = self.lock(ct).await?;
        self.ensure_session(&mut state, ct).await?;
        let opts = ExecOptions {
            retry: self.settings.retry,
            auto_reconnect: false,
        };
        self.run_locked(&mut state, |inv| request_into(request, inv), opts, ct)
            .await
    }

    /// Opens a secondary channel by passing a bearer token for `scope` to `command`.
    pub async fn connect_with_token(
        &self,
        command: &str,
        scope: &str,
        token_parameter: &str,
        ct: &CancellationToken,
    ) -> EngineResult<CommandResult> {
        self.check_disposed()?;
        let token = self.auth.bearer_token(scope).await?;
        let request = CommandRequest::new(command).param(token_parameter, token);
        self.execute_raw_command(&request, ct).await
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    /// Identity the current connection was opened with, if any.
    pub async fn connected_identity(&self) -> Option<String> {
        let state = self.state.lock().await;
        if state.connected {
            state.identity.clone()
        } else {
            None
        }
    }

    /// Closes the session. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().await;
        if let Some(mut session) = state.session.take() {
            session.close().await;
        }
        state.connected = false;
        state.identity = None;
        info!("command engine disposed");
    }

    fn check_disposed(&self) -> EngineResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }

    async fn lock(&self, ct: &CancellationToken) -> EngineResult<MutexGuard<'_, EngineState>> {
        self.check_disposed()?;
        let guard = tokio::select! {
            biased;
            _ = ct.cancelled() => return Err(EngineError::Cancelled),
            guard = self.state.lock() => guard,
        };
        // Dispose may have won the race for the lock.
        self.check_disposed()?;
        Ok(guard)
    }

    async fn ensure_session(
        &self,
        state: &mut EngineState,
        ct: &CancellationToken,
    ) -> EngineResult<()> {
        if state.session.is_some() {
            return Ok(());
        }
        let options = SessionOptions {
            pwsh_path: self.settings.pwsh_path.clone(),
            allow_unrestricted_scripts: self.settings.allow_unrestricted_scripts,
            module_path: self.configure_module_path(),
            start_timeout: self.settings.session_start_timeout,
        };
        let session = tokio::select! {
            biased;
            _ = ct.cancelled() => return Err(EngineError::Cancelled),
            session = self.factory.create(&options) => session?,
        };
        state.session = Some(session);
        info!(
            pwsh = %options.pwsh_path.display(),
            unrestricted = options.allow_unrestricted_scripts,
            "interpreter session initialized"
        );
        Ok(())
    }

    /// Best effort: a missing bundled runtime only means the installed one is used.
    fn configure_module_path(&self) -> Option<ModulePathSetup> {
        let base = self.settings.base_dir.as_ref()?;
        match ModulePathSetup::discover(base) {
            Some(setup) => {
                info!(home = %setup.home.display(), "using bundled interpreter modules");
                Some(setup)
            }
            None => {
                debug!(base = %base.display(), "no bundled interpreter modules found");
                None
            }
        }
    }

    async fn ensure_connected_locked(
        &self,
        state: &mut EngineState,
        ct: &CancellationToken,
    ) -> EngineResult<()> {
        if state.connected {
            return Ok(());
        }
        self.ensure_session(state, ct).await?;

        let hint = self.auth.identity_hint();
        let first = self.connect_attempt(state, hint.as_deref(), ct).await;
        let identity = match first {
            Ok(()) => hint,
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => {
                warn!(error = %e, "connect with cached identity failed, trying interactive sign-in");
                self.auth.begin_interactive().await?;
                self.connect_attempt(state, None, ct).await?;
                None
            }
        };
        state.connected = true;
        state.identity = identity;
        info!(identity = ?state.identity, "connected to remote service");
        Ok(())
    }

    /// One connect call, without retries, bounded by `connect_timeout`.
    async fn connect_attempt(
        &self,
        state: &mut EngineState,
        identity: Option<&str>,
        ct: &CancellationToken,
    ) -> EngineResult<()> {
        let opts = ExecOptions {
            retry: RetryPolicy::no_retry(),
            auto_reconnect: false,
        };
        let budget = self.settings.connect_timeout;
        let attempt = tokio::time::timeout(
            budget,
            self.run_locked(state, |inv| self.connect_into(inv, identity), opts, ct),
        )
        .await;
        match attempt {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                // The abandoned call may still be running inside the session.
                if let Some(session) = state.session.as_mut() {
                    session.abort().await;
                }
                warn!(command = %self.settings.connect_command, "connect timed out");
                Err(EngineError::Timeout(format!(
                    "{} did not complete within {}s",
                    self.settings.connect_command,
                    budget.as_secs()
                )))
            }
        }
    }

    fn connect_into(&self, inv: &mut Invocation, identity: Option<&str>) {
        inv.command(&self.settings.connect_command)
            .parameters(&self.settings.connect_parameters)
            .error_action(ErrorAction::Stop);
        if let Some(id) = identity {
            inv.parameter(&self.settings.identity_parameter, id);
        }
    }

    fn surface_diagnostic(&self, diag: &Diagnostic) {
        if is_device_code_prompt(&diag.message) {
            info!(message = %diag.message, "device sign-in code received");
            self.notifier.notify("Sign-in required", &diag.message);
            return;
        }
        match diag.level {
            DiagnosticLevel::Warning => warn!(message = %diag.message, "session warning"),
            _ => debug!(level = ?diag.level, message = %diag.message, "session output"),
        }
    }

    /// Runs one command against the shared session. `configure` fills a fresh
    /// invocation for every attempt.
    async fn run_locked<F>(
        &self,
        state: &mut EngineState,
        configure: F,
        opts: ExecOptions,
        ct: &CancellationToken,
    ) -> EngineResult<CommandResult>
    where
        F: Fn(&mut Invocation) + Sync,
    {
        let session = state
            .session
            .as_mut()
            .ok_or_else(|| EngineError::Execution("interpreter session is not initialized".into()))?;
        let sink = |d: &Diagnostic| self.surface_diagnostic(d);
        let max_attempts = opts.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let mut inv = Invocation::new();
            configure(&mut inv);
            debug!(attempt, command = %inv.command, "invoking command");

            let outcome = tokio::select! {
                biased;
                _ = ct.cancelled() => None,
                r = session.invoke(&inv, &sink) => Some(r),
            };
            let Some(outcome) = outcome else {
                if session.abort().await {
                    state.connected = false;
                }
                info!(command = %inv.command, "command cancelled");
                return Err(EngineError::Cancelled);
            };

            let (err, class) = match outcome {
                Ok(out) if out.errors.is_empty() => return Ok(out.into()),
                Ok(out) => {
                    let message = out
                        .errors
                        .iter()
                        .map(|e| e.message.as_str())
                        .collect::<Vec<_>>()
                        .join("\n");
                    if opts.auto_reconnect
                        && indicates_disconnect(&message, &self.settings.connect_command)
                    {
                        warn!(command = %inv.command, "remote connection lost; next call will reconnect");
                        state.connected = false;
                    }
                    let class = classify_errors(&out.errors);
                    let err = EngineError::Command {
                        message,
                        transient: class == Classification::Transient,
                    };
                    (err, class)
                }
                Err(fault) => {
                    if fault.kind == FaultKind::SessionLost {
                        state.connected = false;
                    }
                    let class = classify_fault(&fault);
                    let err = match (class, fault.kind) {
                        (Classification::Terminal, _) => {
                            return Err(EngineError::Execution(fault.to_string()))
                        }
                        (_, FaultKind::Timeout) => EngineError::Timeout(fault.message),
                        _ => EngineError::Command {
                            message: fault.message,
                            transient: true,
                        },
                    };
                    (err, class)
                }
            };

            if !opts.retry.should_retry(attempt, class) {
                if class == Classification::Transient && max_attempts > 1 {
                    warn!(command = %inv.command, attempts = attempt, error = %err, "giving up after retries");
                    return Err(EngineError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                return Err(err);
            }

            let delay = opts.retry.delay_for_attempt(attempt);
            warn!(
                command = %inv.command,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );
            tokio::select! {
                biased;
                _ = ct.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Err(EngineError::Execution("retry loop ended without an outcome".into()))
    }
}

fn request_into(request: &CommandRequest, inv: &mut Invocation) {
    inv.command(request.name.trim())
        .parameters(&request.parameters);
}
