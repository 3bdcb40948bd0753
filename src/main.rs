use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webpilot::auth::verifier_from_config;
use webpilot::config::AppConfig;
use webpilot::llm::{GeminiClient, GeminiConfig};
use webpilot::server::{build_router, supervisor::Supervisor, ServeHealth, ServeState};
use webpilot::storage::MemoryStore;
use webpilot::types::{Automation, Run};

/// webpilot - vision-model driven web task agents
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent websocket server
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Override the configured bind address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Seed file with runs and automations for the in-memory store
    #[arg(long, value_name = "FILE")]
    seed: Option<PathBuf>,
}

#[derive(serde::Deserialize, Default)]
struct SeedFile {
    #[serde(default)]
    runs: Vec<Run>,
    #[serde(default)]
    automations: Vec<Automation>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Serve(args) => serve(config, args).await,
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(mut config: AppConfig, args: ServeArgs) -> Result<()> {
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let verifier = verifier_from_config(&config.auth)
        .context("configure an auth verify endpoint or a development token")?;
    let model = Arc::new(
        GeminiClient::new(GeminiConfig::from(&config.llm)).context("building the model client")?,
    );

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &args.seed {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading seed file {}", path.display()))?;
        let seed: SeedFile =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let (runs, automations) = (seed.runs.len(), seed.automations.len());
        for run in seed.runs {
            store.insert_run(run);
        }
        for automation in seed.automations {
            store.insert_automation(automation);
        }
        info!(runs, automations, "seeded in-memory store");
    } else {
        warn!("no seed file given; the in-memory store starts empty");
    }

    let browser_factory = Supervisor::chromium_factory(&config);
    let supervisor = Arc::new(Supervisor::new(
        verifier,
        store.clone(),
        store,
        model,
        config.clone(),
        browser_factory,
    ));

    let health = Arc::new(ServeHealth::new());
    health.mark_live();

    let state = ServeState {
        supervisor: supervisor.clone(),
        health: health.clone(),
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    health.mark_ready();
    info!(addr = %config.server.bind, "webpilot listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received; cancelling active sessions");
            supervisor.cancel_all();
        })
        .await
        .context("server error")?;

    Ok(())
}
