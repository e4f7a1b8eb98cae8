//! Usage server binary
//!
//! # Environment Variables
//!
//! - `KAFKA_BROKER`: broker address, `host:port` (required)
//! - `KAFKA_*`, `FALLBACK_*`, `SHUTDOWN_TIMEOUT_SECS`: see `hive_usage::config`
//! - `PORT`: HTTP port (default: 4000)
//! - `RUST_LOG`: log filter (default: info)
//!
//! # Example
//!
//! ```bash
//! export KAFKA_BROKER=localhost:9092
//! cargo run -p hive-usage-server --features kafka
//! ```

use anyhow::Context;
use hive_usage::{KafkaProducer, UsageConfig, UsageService};
use hive_usage_server::shutdown::ShutdownSignal;
use hive_usage_server::{create_router, AppState};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = UsageConfig::from_env().context("invalid usage configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(config.broker_log_level.directive().parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    hive_usage_observability::init();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(4000);

    info!(
        broker = %config.connection.broker,
        topic = %config.topic,
        tls = config.connection.tls.is_some(),
        sasl = ?config.connection.sasl.as_ref().map(|s| s.mechanism),
        port,
        "Usage server starting"
    );

    let producer = KafkaProducer::new(config.connection.clone())
        .context("failed to create broker producer")?;
    let service = UsageService::builder()
        .config(config)
        .producer(Arc::new(producer))
        .build()?;

    service.start().await.context("failed to start usage pipeline")?;

    let router = create_router(AppState {
        service: service.clone(),
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            match ShutdownSignal::recv().await {
                Ok(signal) => info!(%signal, "Received shutdown signal"),
                Err(e) => {
                    error!(error = %e, "Cannot listen for shutdown signals");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await?;

    if let Err(e) = service.stop().await {
        error!(error = %e, "Usage pipeline did not stop cleanly");
        return Err(e.into());
    }

    info!("Server shut down gracefully");
    Ok(())
}
