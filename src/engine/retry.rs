//! Retry policy and failure classification for command execution.
//!
//! The policy is pure: `classify` decides transient vs terminal, `delay_for_attempt`
//! gives the backoff, and the engine's loop does the rest.

use std::time::Duration;

use crate::execution::{ErrorCause, ErrorRecord, FaultKind, InvocationFault};

const TRANSIENT_MARKERS: &[&str] = &["temporarily", "timeout", "throttle", "429", "server busy"];

const DISCONNECT_MARKERS: &[&str] = &["not connected"];

const DEVICE_CODE_MARKERS: &[&str] = &[
    "microsoft.com/devicelogin",
    "aka.ms/devicelogin",
    "enter the code",
    "devicelogin",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Transient,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles for each later one.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, used for connect calls.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Backoff after failed attempt `attempt` (1-based): base × 2^(attempt-1).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    pub fn should_retry(&self, attempt: u32, classification: Classification) -> bool {
        classification == Classification::Transient && attempt < self.max_attempts
    }
}

fn contains_marker(text: &str, markers: &[&str]) -> bool {
    let lower = text.to_lowercase();
    markers.iter().any(|m| lower.contains(m))
}

/// Classifies the error records of one invocation.
pub fn classify_errors(errors: &[ErrorRecord]) -> Classification {
    let by_cause = errors.iter().any(|e| {
        matches!(
            e.cause,
            ErrorCause::Timeout | ErrorCause::Network | ErrorCause::Remoting
        )
    });
    if by_cause || errors.iter().any(|e| contains_marker(&e.message, TRANSIENT_MARKERS)) {
        Classification::Transient
    } else {
        Classification::Terminal
    }
}

/// Classifies a fault raised by the session itself.
pub fn classify_fault(fault: &InvocationFault) -> Classification {
    match fault.kind {
        FaultKind::Timeout | FaultKind::Transport => Classification::Transient,
        FaultKind::SessionLost | FaultKind::Other => Classification::Terminal,
    }
}

/// True when the error text says the remote channel is gone.
pub fn indicates_disconnect(text: &str, connect_command: &str) -> bool {
    contains_marker(text, DISCONNECT_MARKERS)
        || (!connect_command.is_empty()
            && text.to_lowercase().contains(&connect_command.to_lowercase()))
}

/// True when a diagnostic carries an out-of-band sign-in code.
pub fn is_device_code_prompt(message: &str) -> bool {
    contains_marker(message, DEVICE_CODE_MARKERS)
}
