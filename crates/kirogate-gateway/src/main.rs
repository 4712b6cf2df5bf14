use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kirogate_gateway::app;
use tracing::info;

#[derive(Parser)]
#[command(name = "kirogate", about = "OpenAI/Anthropic gateway for the Kiro upstream")]
struct Cli {
    /// Path to the TOML config file (env vars override it).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kirogate=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = kirogate_core::GatewayConfig::load(cli.config.as_deref())?;
    if config.proxy_api_key.is_empty() {
        anyhow::bail!("PROXY_API_KEY must be set");
    }

    let bind = config.bind.clone();
    let port = config.port;
    let refresh_interval = Duration::from_secs(config.background_refresh_interval);

    let state = Arc::new(app::AppState::new(config)?);
    state.auth.start_background_refresh(refresh_interval);

    let router = app::build_router(state.clone());
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!(%addr, version = kirogate_core::config::APP_VERSION, "kirogate listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: Arc<app::AppState>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
    state.auth.shutdown();
}
