//! Read-only commands against the record store.

use anyhow::{Context, Result};
use marine_weather_core::{
    Config, MongoRecordStore, RecordStore,
    store::{AssetQuery, LocationQuery},
};
use serde::Serialize;

use crate::cli::QueryCommand;

pub async fn run(config: &Config, command: QueryCommand) -> Result<()> {
    let store = MongoRecordStore::connect(&config.store)
        .await
        .context("connecting to MongoDB")?;
    let result = execute(&store, command).await;
    store.close().await;
    println!("{}", result?);
    Ok(())
}

/// Run one query and render its result as pretty JSON.
pub async fn execute(store: &dyn RecordStore, command: QueryCommand) -> Result<String> {
    match command {
        QueryCommand::Asset {
            asset_id,
            asset_ref,
            from,
            to,
            limit,
        } => {
            let query = AssetQuery {
                asset_id,
                asset_ref,
                from,
                to,
                limit,
            };
            render(&store.find_by_asset(&query).await?)
        }
        QueryCommand::Latest { asset_id } => render(&store.find_latest(&asset_id).await?),
        QueryCommand::Day { asset_id, date } => render(&store.find_by_key(&asset_id, date).await?),
        QueryCommand::Count { asset_id } => render(&serde_json::json!({
            "idAsset": asset_id,
            "count": store.count_by_asset(&asset_id).await?,
        })),
        QueryCommand::Near {
            lat,
            lon,
            max_distance,
            from,
            to,
            limit,
        } => {
            let query = LocationQuery {
                max_distance_m: max_distance,
                from,
                to,
                limit,
                ..LocationQuery::new(lon, lat)
            };
            render(&store.find_near(&query).await?)
        }
    }
}

fn render<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}
