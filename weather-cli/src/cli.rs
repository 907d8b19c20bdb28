use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use marine_weather_core::{
    AmqpConnection, Config, QueueConnection,
    model::{RequestMessage, normalize_date},
    validate,
};
use tracing::{info, warn};

use crate::{configure, query, service};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(
    name = "marine-weather",
    version,
    about = "Marine weather ingestion service"
)]
pub struct Cli {
    /// Defaults to `run`.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Consume weather requests from the broker until interrupted.
    Run,

    /// Publish one weather request to the broker.
    Publish {
        /// Asset identifier, at most 20 characters.
        #[arg(long)]
        asset: String,

        /// Reference to the asset entity in the owning service.
        #[arg(long)]
        asset_ref: Option<String>,

        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        #[arg(long, allow_negative_numbers = true)]
        lon: f64,

        /// Day to fetch, `YYYY-MM-DD` or an ISO-8601 timestamp.
        #[arg(long)]
        date: String,

        /// IANA timezone for the hourly series.
        #[arg(long)]
        timezone: Option<String>,
    },

    /// Read stored records.
    Query {
        #[command(subcommand)]
        query: QueryCommand,
    },

    /// Interactively write the configuration file.
    Configure,
}

#[derive(Debug, Subcommand)]
pub enum QueryCommand {
    /// Records of one asset, newest first.
    Asset {
        /// Asset identifier.
        #[arg(required_unless_present = "asset_ref")]
        asset_id: Option<String>,

        /// Match on the asset reference instead of the identifier.
        #[arg(long, conflicts_with = "asset_id")]
        asset_ref: Option<String>,

        #[arg(long, value_parser = parse_day)]
        from: Option<NaiveDate>,

        #[arg(long, value_parser = parse_day)]
        to: Option<NaiveDate>,

        #[arg(long, default_value_t = marine_weather_core::store::DEFAULT_QUERY_LIMIT)]
        limit: u32,
    },

    /// The most recent record of an asset.
    Latest { asset_id: String },

    /// The record of an asset for one day.
    Day {
        asset_id: String,

        #[arg(value_parser = parse_day)]
        date: NaiveDate,
    },

    /// Number of records stored for an asset.
    Count { asset_id: String },

    /// Records near a point, nearest first.
    Near {
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        #[arg(long, allow_negative_numbers = true)]
        lon: f64,

        /// Search radius in meters.
        #[arg(long, default_value_t = marine_weather_core::store::DEFAULT_MAX_DISTANCE_M)]
        max_distance: f64,

        #[arg(long, value_parser = parse_day)]
        from: Option<NaiveDate>,

        #[arg(long, value_parser = parse_day)]
        to: Option<NaiveDate>,

        #[arg(long, default_value_t = marine_weather_core::store::DEFAULT_QUERY_LIMIT)]
        limit: u32,
    },
}

fn parse_day(raw: &str) -> Result<NaiveDate, String> {
    normalize_date(raw).ok_or_else(|| format!("'{raw}' is not a date"))
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command.unwrap_or(Command::Run) {
            Command::Run => service::run(Config::load()?).await,
            Command::Publish {
                asset,
                asset_ref,
                lat,
                lon,
                date,
                timezone,
            } => {
                let message = RequestMessage {
                    asset_id: asset,
                    asset_ref,
                    latitude: lat,
                    longitude: lon,
                    date,
                    timezone,
                };
                publish(&Config::load()?, &message).await
            }
            Command::Query { query } => query::run(&Config::load()?, query).await,
            Command::Configure => configure::run(),
        }
    }
}

/// Validate locally, then publish as a persistent message.
async fn publish(config: &Config, message: &RequestMessage) -> Result<()> {
    let value = serde_json::to_value(message)?;
    let request = validate(&value)?;
    let body = serde_json::to_vec(&value)?;

    let connection = AmqpConnection::new(&config.broker);
    send(&connection, &config.broker.exchange, &body).await?;

    info!(
        asset_id = %request.asset_id,
        date = %request.date_key(),
        exchange = %config.broker.exchange,
        "Request published"
    );
    println!("Published request for {} on {}", request.asset_id, request.date_key());
    Ok(())
}

/// Publish `body` on a fresh session, then close the connection. A failed
/// close after a publish is only logged; the publish outcome is what counts.
async fn send(connection: &dyn QueueConnection, exchange: &str, body: &[u8]) -> Result<()> {
    let result = async {
        let mut session = connection.connect().await?;
        session.declare_fanout(exchange).await?;
        session.publish(exchange, body).await
    }
    .await;
    let closed = connection.close().await;

    result.with_context(|| format!("publishing to exchange '{exchange}'"))?;
    if let Err(e) = closed {
        warn!(error = %e, "Error while closing broker connection");
    }
    Ok(())
}
