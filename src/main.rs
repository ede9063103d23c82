use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tracing::{error, info};

use newsdesk::approval::ApprovalDesk;
use newsdesk::config;
use newsdesk::enrich::HttpEnricher;
use newsdesk::events::{bot_channels, LogBus};
use newsdesk::gateway::TelegramGateway;
use newsdesk::http::{self, AppState};
use newsdesk::llm::OpenAiClient;
use newsdesk::queue::BoundedQueue;
use newsdesk::sources::SourceRegistry;
use newsdesk::stream::StreamController;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let http_client = reqwest::Client::builder()
        .user_agent(concat!("newsdesk/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;
    let logs = LogBus::default();

    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let gateway = Arc::new(TelegramGateway::new(bot.clone()));
    let llm = Arc::new(OpenAiClient::new(
        http_client.clone(),
        cfg.llm.base_url.clone(),
        cfg.llm.api_key.clone(),
    ));
    let desk = Arc::new(ApprovalDesk::new(
        cfg.tenants.clone(),
        gateway,
        llm,
        logs.clone(),
    ));

    let registry = Arc::new(SourceRegistry::from_config(&cfg.sources, http_client.clone()));
    let mut streams = StreamController::new(
        registry,
        BoundedQueue::new(cfg.app.enrich_concurrency),
        logs.clone(),
        Duration::from_secs(cfg.app.poll_interval_secs),
    );
    if cfg.app.enrich {
        streams = streams.with_enricher(Arc::new(HttpEnricher::new(http_client.clone())));
    }

    // Bot updates -> typed channels -> approval desk
    let (events_tx, events_rx) = bot_channels(64);
    tokio::spawn(Arc::clone(&desk).run(events_rx));
    tokio::spawn(newsdesk::bot::run(bot, events_tx));

    let app = http::router(Arc::new(AppState { desk, streams }));
    let listener = tokio::net::TcpListener::bind(&cfg.app.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.app.bind))?;
    info!(bind = %cfg.app.bind, "serving http");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(?err, "failed to listen for ctrl-c");
    }
    info!("shutting down");
}
