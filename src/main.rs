mod collectors;
mod config;
mod error;
mod metrics;
mod mode;
mod server;
mod snapshot;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::config::Cli;
use crate::server::{AppState, router};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let collector = cli.build_collector()?;
    info!(collector = ?cli.collector, "collector ready");

    let app = router(AppState::new(collector));

    let addr = cli.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Serving GPU status on http://{}/status", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
