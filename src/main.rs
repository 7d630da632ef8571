mod cli;

use std::{io, sync::Arc};

use anyhow::{anyhow, Context, Result};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cli::{Command, RawArgs, RunArgs};
use tenant_console::{
    auth::ConfigAuth,
    capability::{CapabilityProvider, CapabilityRegistry},
    config::Config,
    notify::TerminalNotifier,
    printer::{print_availability, DiagnosticPrinter, RecordPrinter},
    resolver::{required_modules, AcceptAll, InstallPrompt, ReportOnly, TerminalPrompt},
    CommandEngine, CommandRequest, CommandResult, DependencyResolver,
};

fn init_tracing(cfg: &Config, verbose: u8) {
    let fallback = match verbose {
        0 => "tenant_console=info,warn",
        1 => "tenant_console=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| cfg.get("LOG_FILTER").and_then(|f| EnvFilter::try_new(f).ok()))
        .unwrap_or_else(|| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // Load config
    let cfg = Config::load();
    init_tracing(&cfg, args.verbose);

    let ct = CancellationToken::new();
    {
        let ct = ct.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling");
                ct.cancel();
            }
        });
    }

    let registry = CapabilityRegistry::builtin();

    match args.command {
        Command::Modules { yes } => {
            let resolver = DependencyResolver::pwsh(cfg.resolver_settings());
            let prompt: Box<dyn InstallPrompt> = if yes {
                Box::new(AcceptAll)
            } else if io::stdin().is_terminal() {
                Box::new(TerminalPrompt)
            } else {
                Box::new(ReportOnly)
            };
            let map = resolver
                .resolve(&registry, prompt.as_ref(), &ct)
                .await
                .context("module resolution failed")?;
            print_availability(&map);
            Ok(())
        }
        Command::Capabilities { json } => {
            let resolver = DependencyResolver::pwsh(cfg.resolver_settings());
            resolver.check_runtime(&ct).await?;
            let map = resolver
                .probe(&required_modules(registry.capabilities()), &ct)
                .await?;
            if json {
                let rows: Vec<_> = registry
                    .capabilities()
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "capability": c,
                            "available": c.is_available(&map),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
                return Ok(());
            }
            for (category, caps) in registry.by_category() {
                println!("{}", category.bold());
                for c in caps {
                    let status = if c.is_available(&map) {
                        format!("{}", "available".green())
                    } else {
                        format!("{} ({})", "unavailable".red(), c.missing_modules(&map).join(", "))
                    };
                    println!("  {:<22} {:<28} {}", c.id(), c.display_name(), status);
                }
            }
            Ok(())
        }
        Command::Run(run) => {
            gate_capability(&cfg, &registry, &run, &ct).await?;
            let engine = build_engine(&cfg);
            let result = engine.execute_command(&to_request(&run), &ct).await;
            engine.dispose().await;
            print_result(&run, result?)
        }
        Command::Raw(raw) => {
            gate_capability(&cfg, &registry, &raw.run, &ct).await?;
            let engine = build_engine(&cfg);
            let result = run_raw(&engine, &raw, &ct).await;
            engine.dispose().await;
            print_result(&raw.run, result?)
        }
    }
}

fn build_engine(cfg: &Config) -> CommandEngine {
    CommandEngine::pwsh(
        cfg.engine_settings(),
        Arc::new(ConfigAuth::from_config(cfg)),
        Arc::new(TerminalNotifier),
    )
}

fn to_request(run: &RunArgs) -> CommandRequest {
    run.params
        .iter()
        .cloned()
        .fold(CommandRequest::new(&run.name), |req, (k, v)| req.param(k, v))
}

async fn gate_capability(
    cfg: &Config,
    registry: &CapabilityRegistry,
    run: &RunArgs,
    ct: &CancellationToken,
) -> Result<()> {
    let Some(id) = run.capability.as_deref() else {
        return Ok(());
    };
    let capability = registry
        .get(id)
        .ok_or_else(|| anyhow!("unknown capability: {}", id))?;
    let resolver = DependencyResolver::pwsh(cfg.resolver_settings());
    let map = resolver
        .probe(capability.required_modules(), ct)
        .await?;
    map.require_capability(capability)
        .with_context(|| format!("capability {} is not usable; run `tenant-console modules`", id))?;
    Ok(())
}

async fn run_raw(
    engine: &CommandEngine,
    raw: &RawArgs,
    ct: &CancellationToken,
) -> tenant_console::EngineResult<CommandResult> {
    if let (Some(command), Some(scope)) = (raw.token_command.as_deref(), raw.token_scope.as_deref()) {
        engine
            .connect_with_token(command, scope, &raw.token_parameter, ct)
            .await?;
    }
    engine.execute_raw_command(&to_request(&raw.run), ct).await
}

fn print_result(run: &RunArgs, result: CommandResult) -> Result<()> {
    DiagnosticPrinter {
        show_verbose: false,
    }
    .print(&result.diagnostics);
    RecordPrinter::new(run.format).print(&result.records)?;
    Ok(())
}
