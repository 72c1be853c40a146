//! Process bootstrap for the mergex webhook service.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mergex_core::{EngineContext, Settings};
use mergex_server::{AppState, create_router};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments for the mergex webhook service
#[derive(Parser, Debug)]
#[command(name = "mergex-server")]
#[command(about = "Auto-merge controller webhook service")]
struct Args {
    /// Server port (overrides environment)
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Server host
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let settings = Arc::new(Settings::from_env());

    let ctx = Arc::new(
        EngineContext::connect(Arc::clone(&settings))
            .await
            .context("failed to connect to Redis")?,
    );
    let state = AppState::new(ctx);

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("invalid host/port")?;
    info!(version = %settings.service_version, %addr, "mergex server listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}
