//! Scripted fakes for driving the command engine without a real interpreter.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tenant_console::{
    auth::AuthProvider,
    engine::session::{DiagnosticSink, Session, SessionFactory, SessionOptions},
    error::{EngineError, EngineResult},
    execution::{
        Diagnostic, DiagnosticLevel, ErrorCause, ErrorRecord, FaultKind, Invocation,
        InvocationFault, InvocationOutput, Record,
    },
    notify::Notifier,
    CommandEngine, EngineSettings,
};

pub enum Step {
    Output(InvocationOutput),
    Fault(InvocationFault),
    Hang,
}

impl Step {
    pub fn records(n: usize) -> Self {
        let records = (0..n)
            .map(|i| {
                let mut r = Record::new();
                r.insert("Index".into(), i.into());
                r
            })
            .collect();
        Step::Output(InvocationOutput {
            records,
            ..Default::default()
        })
    }

    pub fn error(message: &str) -> Self {
        Self::error_with_cause(message, ErrorCause::Other)
    }

    pub fn error_with_cause(message: &str, cause: ErrorCause) -> Self {
        Step::Output(InvocationOutput {
            errors: vec![ErrorRecord::new(message, cause)],
            ..Default::default()
        })
    }

    pub fn diagnostic(level: DiagnosticLevel, message: &str) -> Self {
        Step::Output(InvocationOutput {
            diagnostics: vec![Diagnostic::new(level, message)],
            ..Default::default()
        })
    }

    pub fn fault(kind: FaultKind, message: &str) -> Self {
        Step::Fault(InvocationFault::new(kind, message))
    }
}

/// Shared script and call log. Commands without queued steps succeed with no output.
#[derive(Default)]
pub struct Script {
    steps: Mutex<HashMap<String, VecDeque<Step>>>,
    log: Mutex<Vec<Invocation>>,
    pub creates: AtomicUsize,
    pub aborts: AtomicUsize,
    pub closes: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub invoke_delay: Mutex<Option<Duration>>,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, command: &str, step: Step) {
        self.steps
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .push_back(step);
    }

    pub fn calls(&self, command: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.command == command)
            .count()
    }

    pub fn invocations(&self, command: &str) -> Vec<Invocation> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.command == command)
            .cloned()
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    fn next(&self, command: &str) -> Option<Step> {
        self.steps
            .lock()
            .unwrap()
            .get_mut(command)
            .and_then(VecDeque::pop_front)
    }
}

pub struct FakeSession {
    script: Arc<Script>,
}

#[async_trait]
impl Session for FakeSession {
    async fn invoke(
        &mut self,
        invocation: &Invocation,
        on_diagnostic: DiagnosticSink<'_>,
    ) -> Result<InvocationOutput, InvocationFault> {
        self.script.log.lock().unwrap().push(invocation.clone());
        let now = self.script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.script.invoke_delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let step = self.script.next(&invocation.command);
        let result = match step {
            None => Ok(InvocationOutput::default()),
            Some(Step::Output(out)) => {
                for d in &out.diagnostics {
                    on_diagnostic(d);
                }
                Ok(out)
            }
            Some(Step::Fault(f)) => Err(f),
            Some(Step::Hang) => {
                // Counter stays raised; the engine drops this future on cancel.
                std::future::pending::<()>().await;
                unreachable!()
            }
        };
        self.script.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn abort(&mut self) -> bool {
        self.script.aborts.fetch_add(1, Ordering::SeqCst);
        self.script.in_flight.store(0, Ordering::SeqCst);
        true
    }

    async fn close(&mut self) {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeFactory {
    pub script: Arc<Script>,
}

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn create(&self, _options: &SessionOptions) -> EngineResult<Box<dyn Session>> {
        self.script.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            script: self.script.clone(),
        }))
    }
}

#[derive(Default)]
pub struct FakeAuth {
    pub hint: Option<String>,
    pub interactive: AtomicUsize,
}

#[async_trait]
impl AuthProvider for FakeAuth {
    fn identity_hint(&self) -> Option<String> {
        self.hint.clone()
    }

    async fn bearer_token(&self, scope: &str) -> EngineResult<String> {
        if scope == "denied" {
            Err(EngineError::Auth("no token".into()))
        } else {
            Ok(format!("token-for-{}", scope))
        }
    }

    async fn begin_interactive(&self) -> EngineResult<()> {
        self.interactive.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<String>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, _title: &str, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

pub const CONNECT: &str = "Connect-ExchangeOnline";

pub struct Harness {
    pub engine: CommandEngine,
    pub script: Arc<Script>,
    pub auth: Arc<FakeAuth>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn harness(settings: EngineSettings, hint: Option<&str>) -> Harness {
    let script = Script::new();
    let auth = Arc::new(FakeAuth {
        hint: hint.map(String::from),
        ..Default::default()
    });
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = CommandEngine::new(
        settings,
        Arc::new(FakeFactory {
            script: script.clone(),
        }),
        auth.clone(),
        notifier.clone(),
    );
    Harness {
        engine,
        script,
        auth,
        notifier,
    }
}
