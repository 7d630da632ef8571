//! Install confirmation step shown after probing.

use std::io::{self, BufRead, Write};

use owo_colors::OwoColorize;
use tracing::warn;

use super::AvailabilityMap;

pub trait InstallPrompt: Send + Sync {
    /// Shows every module with its status and returns the missing ones to install.
    fn choose(&self, modules: &AvailabilityMap) -> Vec<String>;
}

/// Selects every missing module without asking.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl InstallPrompt for AcceptAll {
    fn choose(&self, modules: &AvailabilityMap) -> Vec<String> {
        modules.missing().into_iter().map(String::from).collect()
    }
}

/// Selects nothing; used when no one is there to answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOnly;

impl InstallPrompt for ReportOnly {
    fn choose(&self, _modules: &AvailabilityMap) -> Vec<String> {
        Vec::new()
    }
}

/// Lists modules on stderr and asks per missing module on stdin (Enter = install).
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl TerminalPrompt {
    fn render(modules: &AvailabilityMap, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "Required modules:")?;
        for (name, installed) in modules.iter() {
            if installed {
                writeln!(out, "  {} {}", "[installed]".green(), name)?;
            } else {
                writeln!(out, "  {} {}", "[missing]  ".red(), name)?;
            }
        }
        if modules.missing().is_empty() {
            writeln!(out, "All required modules are installed.")?;
        }
        Ok(())
    }

    fn ask(
        modules: &AvailabilityMap,
        input: &mut impl BufRead,
        out: &mut impl Write,
    ) -> io::Result<Vec<String>> {
        Self::render(modules, out)?;
        let mut selected = Vec::new();
        for name in modules.missing() {
            write!(out, "Install {}? [Y/n]: ", name)?;
            out.flush()?;
            let mut answer = String::new();
            if input.read_line(&mut answer)? == 0 {
                break;
            }
            let a = answer.trim().to_lowercase();
            if a.is_empty() || a == "y" || a == "yes" {
                selected.push(name.to_string());
            }
        }
        Ok(selected)
    }

    /// A broken terminal selects nothing.
    fn choose_from(
        modules: &AvailabilityMap,
        input: &mut impl BufRead,
        out: &mut impl Write,
    ) -> Vec<String> {
        Self::ask(modules, input, out).unwrap_or_else(|e| {
            warn!(error = %e, "install prompt failed; installing nothing");
            Vec::new()
        })
    }
}

impl InstallPrompt for TerminalPrompt {
    fn choose(&self, modules: &AvailabilityMap) -> Vec<String> {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut err = io::stderr();
        Self::choose_from(modules, &mut input, &mut err)
    }
}
