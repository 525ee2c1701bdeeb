use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use runner_engine::{Engine, EngineConfig};
use runner_gateway::{create_app, AppState, ServerMetrics};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "info,runner_gateway=debug,runner_engine=debug".to_string()
        }))
        .init();

    let config = EngineConfig::from_env()?;
    let listen_addr: SocketAddr = std::env::var("AGENT_RUNNER_LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .context("parsing AGENT_RUNNER_LISTEN_ADDR")?;
    let api_key = std::env::var("AGENT_RUNNER_API_KEY").ok();
    if api_key.is_none() {
        warn!("AGENT_RUNNER_API_KEY is not set, execution endpoint is unauthenticated");
    }

    let engine = Engine::with_docker(config).context("initializing engine")?;
    let state = Arc::new(AppState {
        engine,
        api_key,
        metrics: ServerMetrics::default(),
    });
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .context("binding listen address")?;
    info!(addr = %listen_addr, "agent runner listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
