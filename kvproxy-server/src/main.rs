use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kvproxy::coordinator::Coordinator;
use kvproxy::index::LcpIndex;
use kvproxy::janitor::Janitor;
use kvproxy::meta::MetaStore;
use kvproxy::slots::SlotManager;
use kvproxy::upstream::UpstreamClient;

#[derive(Parser, Debug)]
#[command(name = "kvproxy-server")]
#[command(about = "Prefix-reusing KV-cache proxy for llama.cpp-style backends")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Backend base URL (overrides LLAMA_URL)
    #[arg(long)]
    llama_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,kvproxy=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = kvproxy::Config::from_env()?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(url) = args.llama_url {
        config.llama_url = url;
    }
    config.ensure_dirs()?;

    tracing::info!(
        "Starting kvproxy on port {} (backend {}, {} slots)",
        config.port,
        config.llama_url,
        config.n_slots
    );

    // Rebuild the prefix index from the metadata directory.
    let index = Arc::new(LcpIndex::new());
    let meta = Arc::new(MetaStore::new(&config.meta_dir));
    for entry in meta.load_all()? {
        index.insert(entry);
    }
    tracing::info!(
        "Loaded {} cache entries from {}",
        index.len(),
        config.meta_dir.display()
    );

    let slots = Arc::new(SlotManager::new(config.n_slots));
    let upstream = Arc::new(UpstreamClient::new(
        &config.llama_url,
        config.request_timeout(),
    )?);
    let coordinator = Arc::new(Coordinator::new(
        config.clone(),
        index.clone(),
        meta.clone(),
        slots,
        upstream,
    )?);

    let janitor = Arc::new(Janitor::new(&config, meta, index));
    let janitor_task = {
        let janitor = janitor.clone();
        tokio::spawn(async move { janitor.start().await })
    };

    let app = kvproxy::api::router(kvproxy::api::AppState { coordinator });
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    janitor.stop();
    let _ = janitor_task.await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
