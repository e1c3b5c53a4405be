use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use edmo_backend::backend::Backend;
use edmo_backend::config::Config;
use edmo_backend::{console, http};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("edmo_backend=info".parse()?))
        .init();

    let config = Config::parse();
    info!(?config, "starting edmo-backend");

    let backend = Backend::new(config.clone()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_listener = tokio::net::TcpListener::bind(config.http_bind).await?;
    let http_server = tokio::spawn(
        axum::serve(http_listener, http::router(backend.clone()))
            .with_graceful_shutdown(wait_for_shutdown(shutdown_tx.subscribe())),
    );

    let console_handle = tokio::spawn(console::run(backend.clone(), shutdown_tx.clone()));

    let ctrl_c_shutdown_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("ctrl-c received, shutting down");
        let _ = ctrl_c_shutdown_tx.send(true);
    });

    backend.run(shutdown_rx).await;

    let _ = console_handle.await;
    let _ = http_server.await;

    Ok(())
}

async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}
