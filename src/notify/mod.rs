//! User notifications raised from inside command execution.

use std::io::{self, Write};

use owo_colors::OwoColorize;

pub trait Notifier: Send + Sync {
    /// Shows `message` to the operator before returning.
    fn notify(&self, title: &str, message: &str);
}

/// Writes a highlighted block to stderr so it is visible even when stdout is piped.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify(&self, title: &str, message: &str) {
        let mut err = io::stderr().lock();
        let _ = writeln!(err, "\n{}", title.yellow().bold());
        let _ = writeln!(err, "{}\n", message.bold());
        err.flush().ok();
    }
}
