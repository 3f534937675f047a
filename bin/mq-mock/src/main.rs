//! MQ Mock broker.
//!
//! Starts the AMQP server (default port 5672) and the HTTP control API
//! (default port 80) over one shared in-memory storage, then waits for
//! SIGINT/SIGTERM and shuts both down gracefully.
//!
//! ## Environment
//!
//! - `LOG_LEVEL`: log filter when `RUST_LOG` is unset (default: `ERROR`)
//! - `HEARTBEAT_INTERVAL`: heartbeat seconds advertised to clients, 0
//!   disables (default: 0)
//! - `AMQP_PORT` / `HTTP_PORT` / `BIND_ADDR`: listen configuration

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;

use mq_server::{AmqpServer, AmqpServerConfig};
use mq_storage::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    mq_common::logging::init_logging("mq-mock");

    let bind_addr = env_string("BIND_ADDR", "0.0.0.0");
    let amqp_port = env_parse("AMQP_PORT", 5672u16)?;
    let http_port = env_parse("HTTP_PORT", 80u16)?;
    let heartbeat = env_parse("HEARTBEAT_INTERVAL", 0u16)?;

    info!("Starting MQ Mock broker");

    let storage = Storage::new();

    let amqp_config = AmqpServerConfig {
        bind_addr: bind_addr.clone(),
        port: amqp_port,
        server_properties: None,
        heartbeat,
    };
    let amqp_handle = AmqpServer::new(storage.clone(), amqp_config)
        .start()
        .await
        .context("failed to start AMQP server")?;

    let http_listener = TcpListener::bind((bind_addr.as_str(), http_port))
        .await
        .with_context(|| format!("failed to bind HTTP listener on {bind_addr}:{http_port}"))?;
    info!(addr = %http_listener.local_addr()?, "HTTP control API listening");

    let app = mq_http::create_router(storage).layer(TraceLayer::new_for_http());
    let (http_shutdown_tx, http_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_task = tokio::spawn(async move {
        axum::serve(http_listener, app)
            .with_graceful_shutdown(async {
                let _ = http_shutdown_rx.await;
            })
            .await
    });

    info!(amqp_port, http_port, "MQ Mock started. Press Ctrl+C to shutdown.");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = http_shutdown_tx.send(());
    http_task.await?.context("HTTP server failed")?;
    amqp_handle.shutdown().await;

    info!("MQ Mock shutdown complete");
    Ok(())
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value.parse().with_context(|| format!("invalid {name}: {value}")),
        Err(_) => Ok(default),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
