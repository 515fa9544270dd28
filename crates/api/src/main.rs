use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use synctrack_api::app::{self, services};
use synctrack_api::settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    synctrack_observability::init();

    let settings = Settings::parse();
    let services = Arc::new(services::build_services(&settings).await?);
    let workers = services.spawn_workers();

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let served = axum::serve(listener, app::build_app(services.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    services.shutdown(workers).await;
    served.context("server error")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
