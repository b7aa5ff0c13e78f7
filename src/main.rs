use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use llmserve::config::{Cli, Config};
use llmserve::inference::engine::ServingEngine;
use llmserve::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "llmserve=debug,tower_http=debug"
    } else {
        "llmserve=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("llmserve v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    info!(
        page_tokens = config.model.page_tokens,
        page_bytes = config.model.page_bytes(),
        tenants = config.tenants.len(),
        workers = config.workers.len(),
        "Configuration loaded"
    );
    info!(
        device = config.tiers.device_memory_budget,
        host = config.tiers.host_memory_budget,
        local = config.tiers.local_storage_budget,
        remote = config.tiers.remote_object_budget,
        "Tier capacities"
    );

    let engine = ServingEngine::open(config.clone()).await?;

    let state = Arc::new(AppState {
        engine: engine.clone(),
        config: Arc::new(config.clone()),
        start_time: Instant::now(),
    });
    let app = build_router(state);

    let listener = TcpListener::bind(&config.server.listen).await?;
    info!("Listening on {}", config.server.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    engine.shutdown();
    Ok(())
}
