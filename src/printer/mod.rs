//! Printers: diagnostics (colored), records as JSON or a markdown table (termimad).

use std::io::{self, Write};

use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use serde_json::Value;
use termimad::MadSkin;

use crate::{
    execution::{Diagnostic, DiagnosticLevel, Record},
    resolver::AvailabilityMap,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
}

pub struct DiagnosticPrinter {
    pub show_verbose: bool,
}

impl DiagnosticPrinter {
    pub fn print(&self, diagnostics: &[Diagnostic]) {
        let mut err = io::stderr().lock();
        for d in diagnostics {
            let _ = match d.level {
                DiagnosticLevel::Warning => writeln!(err, "{} {}", "WARNING:".yellow(), d.message),
                DiagnosticLevel::Information => writeln!(err, "{}", d.message.cyan()),
                DiagnosticLevel::Verbose | DiagnosticLevel::Debug if self.show_verbose => {
                    writeln!(err, "{}", d.message.dimmed())
                }
                _ => Ok(()),
            };
        }
    }
}

pub struct RecordPrinter {
    pub format: OutputFormat,
    pub skin: MadSkin,
}

impl RecordPrinter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format, skin: MadSkin::default() }
    }

    pub fn print(&self, records: &[Record]) -> io::Result<()> {
        match self.format {
            OutputFormat::Json => {
                let text = serde_json::to_string_pretty(records)?;
                writeln!(io::stdout().lock(), "{}", text)
            }
            OutputFormat::Table => {
                let table = markdown_table(records);
                if table.is_empty() {
                    return Ok(());
                }
                if io::stdout().is_terminal() {
                    self.skin.print_text(&table);
                    Ok(())
                } else {
                    write!(io::stdout().lock(), "{}", table)
                }
            }
        }
    }
}

fn cell(v: &Value) -> String {
    let text = match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    text.replace('|', "¦").replace(['\r', '\n'], " ")
}

/// Markdown table with columns in first-seen property order; missing properties render empty.
pub fn markdown_table(records: &[Record]) -> String {
    let mut columns: Vec<&str> = Vec::new();
    for r in records {
        for k in r.keys() {
            if !columns.contains(&k.as_str()) {
                columns.push(k);
            }
        }
    }
    if columns.is_empty() {
        return String::new();
    }

    let mut s = format!("|{}|\n", columns.join("|"));
    s.push_str(&format!("|{}|\n", vec!["-"; columns.len()].join("|")));
    for r in records {
        let row: Vec<String> = columns
            .iter()
            .map(|c| r.get(*c).map(cell).unwrap_or_default())
            .collect();
        s.push_str(&format!("|{}|\n", row.join("|")));
    }
    s
}

pub fn print_availability(map: &AvailabilityMap) {
    for (name, installed) in map.iter() {
        if installed {
            println!("{} {}", "installed".green(), name);
        } else {
            println!("{}   {}", "missing".red(), name);
        }
    }
}
