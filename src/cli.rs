use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::Value;

use tenant_console::printer::OutputFormat;

#[derive(Parser, Debug, Clone)]
#[command(name = "tenant-console", about = "Run administrative commands against a tenant over pwsh", version)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Check the modules required by the registered capabilities and offer to install missing ones.
    Modules {
        /// Install every missing module without asking.
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// List capabilities with their module availability.
    Capabilities {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run a command on the primary connection (connects on first use).
    Run(RunArgs),
    /// Run a command without touching the primary connection.
    Raw(RawArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Command name, e.g. Get-Mailbox.
    #[arg(value_name = "COMMAND")]
    pub name: String,

    /// Named parameter as KEY=VALUE. VALUE is parsed as JSON when possible.
    #[arg(short = 'p', long = "param", value_parser = parse_param, action = ArgAction::Append)]
    pub params: Vec<(String, Value)>,

    /// Capability whose modules must be installed before running.
    #[arg(long)]
    pub capability: Option<String>,

    /// Output format for result records.
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(Args, Debug, Clone)]
pub struct RawArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Connect a secondary channel first by running this command with a bearer token.
    #[arg(long = "token-command", requires = "token_scope")]
    pub token_command: Option<String>,

    /// Scope the bearer token is requested for.
    #[arg(long = "token-scope")]
    pub token_scope: Option<String>,

    /// Parameter of the token command that receives the token.
    #[arg(long = "token-parameter", default_value = "AccessToken")]
    pub token_parameter: String,
}

pub fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (k, v) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", raw))?;
    let key = k.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in {:?}", raw));
    }
    let value = serde_json::from_str::<Value>(v.trim()).unwrap_or_else(|_| Value::String(v.to_string()));
    Ok((key.to_string(), value))
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
