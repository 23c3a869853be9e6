use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mproxy_common::ServerConfig;
use mproxy_core::dump::Dumper;
use mproxy_core::state::AppState;
use mproxy_provider::TransformerRegistry;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading server config from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone())),
        )
        .init();

    let registry = Arc::new(TransformerRegistry::with_builtins());
    let state = AppState::bootstrap(
        args.user_config.clone(),
        registry,
        Dumper::new(config.dump.clone()),
    )
    .with_context(|| {
        format!(
            "building service container from {}",
            args.user_config.display()
        )
    })?;

    let app = mproxy_router::app(state);
    let bind = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(%bind, "mproxy listening");
    axum::serve(listener, app).await?;
    Ok(())
}
