//! # relay
//!
//! Command-line front end: registers the demo agents, runs one query through
//! the chosen coordinator and streams the answer to stdout.

#![deny(unsafe_code)]

mod demo;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_core::{
    AgentId, LexicalSelector, OrchestrationEvent, PresentationSink, Strategy, TurnStatus,
};
use relay_engine::{AgentRegistry, CoordinatorDeps, SessionManager};
use relay_settings::{load_settings, load_settings_from_path, RelaySettings};
use relay_telemetry::{init_telemetry, parse_level, TelemetryConfig};
use tokio_util::sync::CancellationToken;
use tracing::Level;

/// Multi-agent turn orchestrator demo.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Route a request through cooperating agents")]
struct Cli {
    /// The request, e.g. "draw a chart of revenue".
    #[arg(required = true)]
    query: Vec<String>,

    /// Coordinator strategy (`resolver` or `planner`). Defaults to settings.
    #[arg(long)]
    strategy: Option<Strategy>,

    /// Settings file to use instead of `~/.relay/settings.json`.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level override (`warn`, `info`, `debug`, ...).
    #[arg(long)]
    log_level: Option<String>,

    /// Print orchestration events to stderr as they happen.
    #[arg(long)]
    events: bool,

    /// Dump collected metrics as JSON to stderr when done.
    #[arg(long)]
    metrics: bool,
}

/// Writes chunks to stdout as they arrive.
struct StdoutSink {
    show_events: bool,
}

impl PresentationSink for StdoutSink {
    fn on_chunk(&self, _agent_id: &AgentId, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    fn on_done(&self, status: TurnStatus, error: Option<&str>) {
        tracing::debug!(?status, error, "turn finished");
    }

    fn on_event(&self, event: &OrchestrationEvent) {
        if self.show_events {
            if let Ok(line) = serde_json::to_string(event) {
                eprintln!("{line}");
            }
        }
    }
}

fn load(cli: &Cli) -> Result<RelaySettings> {
    match &cli.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        None => load_settings().context("failed to load settings"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    let level_name = cli.log_level.as_deref().unwrap_or(&settings.logging.level);
    let telemetry = init_telemetry(TelemetryConfig {
        log_level: parse_level(level_name).unwrap_or(Level::INFO),
        json: settings.logging.json,
        metrics_enabled: settings.logging.metrics || cli.metrics,
        ..Default::default()
    });

    let mut registry = AgentRegistry::new();
    demo::register_demo_agents(&mut registry).context("failed to register demo agents")?;
    tracing::info!(agents = registry.len(), "registry ready");

    let deps = CoordinatorDeps::new(
        Arc::new(registry),
        Arc::new(LexicalSelector::new()),
        Arc::new(settings),
    )
    .with_metrics(telemetry.metrics());
    let manager = SessionManager::new(deps);
    let session_id = manager.create(cli.strategy);

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let sink = StdoutSink {
        show_events: cli.events,
    };
    let query = cli.query.join(" ");
    let response = manager.submit(&session_id, &query, &sink, &cancel).await?;

    if let Some(err) = &response.error {
        let marker = if err.is_cancelled() {
            "[turn cancelled]"
        } else {
            "[turn failed]"
        };
        println!("\n{marker} {}", err.user_notice());
    }

    if cli.metrics {
        if let Some(metrics) = telemetry.metrics() {
            eprintln!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);
        }
    }

    manager.archive(&session_id).await?;
    if response.status == TurnStatus::Completed {
        Ok(())
    } else {
        std::process::exit(1)
    }
}
