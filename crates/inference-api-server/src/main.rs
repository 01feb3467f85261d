use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use inference_api_server::config::Settings;
use inference_api_server::services::HubFetcher;
use inference_api_server::{build_router, logging, AppState};
use inference_engine::LlamaCppLoader;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser, Debug)]
#[command(name = "inference-api-server", version, about = "LLM inference server with streaming telemetry")]
struct Args {
    /// Settings file, without extension
    #[arg(long, default_value = Settings::DEFAULT_PATH)]
    config: String,

    /// Override `server.host`
    #[arg(long)]
    host: Option<String>,

    /// Override `server.port`
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Args > Config > Defaults
    let mut settings = Settings::load_from(&args.config)?;
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }

    logging::init(&settings.logging);
    info!("🚀 Starting LLM Inference Server...");

    let loader = LlamaCppLoader::new()?.with_mlock(settings.models.use_mlock);
    info!("✅ llama.cpp backend initialized");

    let fetcher = HubFetcher::new(&settings.models)?;

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    info!(
        "Model cache: max_models={}, max_memory_mb={}; generations: max_concurrent={}",
        settings.cache.max_models,
        settings.cache.max_memory_mb,
        settings.limits.max_concurrent_generations
    );

    let state = AppState::new(settings, Arc::new(loader), Arc::new(fetcher));
    let app = build_router(state);

    info!("🎯 Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
