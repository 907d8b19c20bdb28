//! The long-running ingestion service.

use anyhow::{Context, Result};
use marine_weather_core::{
    AmqpConnection, Config, ConsumerLoop, ConsumerSettings, IngestionProcessor, MongoRecordStore,
    RecordStore,
    provider::{default_timezone, provider_from_config},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Wire the pipeline together and consume until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let store = Arc::new(
        MongoRecordStore::connect(&config.store)
            .await
            .context("connecting to MongoDB")?,
    );
    let provider = Arc::new(provider_from_config(&config).context("building weather API client")?);
    let timezone = default_timezone(&config);
    info!(timezone = %timezone, api_url = %config.provider.api_url, "Marine weather provider ready");

    let processor = Arc::new(IngestionProcessor::new(provider, store.clone(), timezone));
    let connection = Arc::new(AmqpConnection::new(&config.broker));
    let consumer = ConsumerLoop::new(
        connection,
        processor,
        ConsumerSettings::from_config(&config),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let result = tokio::spawn(async move { consumer.run(shutdown).await }).await;

    store.close().await;
    info!("Marine weather service stopped");

    match result {
        Ok(outcome) => outcome.context("consuming from RabbitMQ"),
        Err(e) => {
            error!(error = %e, "Consumer task failed");
            Err(e.into())
        }
    }
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
