//! Binary crate for the `marine-weather` command-line tool.
//!
//! This crate focuses on:
//! - Running the ingestion service until it is told to stop
//! - Operator commands: publishing requests and reading stored records
//! - Interactive configuration

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod configure;
mod query;
mod service;

/// Log filter variable, e.g. `MARINE_WEATHER_LOG=marine_weather_core=debug`.
const LOG_ENV: &str = "MARINE_WEATHER_LOG";

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cmd = cli::Cli::parse();
    cmd.run().await
}
