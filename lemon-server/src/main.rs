//! Lemon server binary - local inference gateway with an OpenAI-compatible API.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lemon_server::{api, AppState, Config};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    println!("lemon-server {}", VERSION);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        print_version();
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Make sure lemon.toml is valid or unset conflicting LEMON__* variables.",
            e
        )
    })?;
    tracing::info!(
        "Starting lemon-server {} (cache: {})",
        VERSION,
        config.cache_dir.display()
    );

    let state = Arc::new(AppState::new(config.clone())?);

    let app = api::router()
        .layer(axum::middleware::from_fn(api::request_logger))
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let addr = format!("{}:{}", config.api.host, config.api.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Engines are child processes; stop them before exiting.
    state.orchestrator.unload_all().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutting down");
}
