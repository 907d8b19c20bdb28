//! Interactive editing of the configuration file.

use anyhow::{Context, Result};
use inquire::{Confirm, CustomType, Password, Text};
use marine_weather_core::Config;

/// Prompt for every connection setting, starting from what is on disk.
pub fn run() -> Result<()> {
    let mut config = Config::load_file()?;
    prompt(&mut config).context("reading configuration answers")?;

    config.save()?;
    println!("Configuration saved to {}", Config::config_file_path()?.display());
    Ok(())
}

fn prompt(config: &mut Config) -> Result<(), inquire::InquireError> {
    let broker = &mut config.broker;
    broker.host = Text::new("RabbitMQ host:")
        .with_default(&broker.host)
        .prompt()?;
    broker.port = CustomType::<u16>::new("RabbitMQ port:")
        .with_default(broker.port)
        .prompt()?;
    broker.user = Text::new("RabbitMQ user:")
        .with_default(&broker.user)
        .prompt()?;
    if Confirm::new("Change the RabbitMQ password?")
        .with_default(false)
        .prompt()?
    {
        broker.password = Password::new("RabbitMQ password:")
            .without_confirmation()
            .prompt()?;
    }
    broker.exchange = Text::new("Exchange:")
        .with_default(&broker.exchange)
        .prompt()?;
    broker.queue = Text::new("Queue:").with_default(&broker.queue).prompt()?;

    let store = &mut config.store;
    store.uri = Text::new("MongoDB URI:").with_default(&store.uri).prompt()?;
    store.database = Text::new("MongoDB database:")
        .with_default(&store.database)
        .prompt()?;
    let user = Text::new("MongoDB user (empty for none):")
        .with_default(store.user.as_deref().unwrap_or_default())
        .prompt()?;
    store.user = Some(user).filter(|u| !u.trim().is_empty());
    if store.user.is_some() {
        store.password = Some(
            Password::new("MongoDB password:")
                .without_confirmation()
                .prompt()?,
        );
    } else {
        store.password = None;
    }

    let provider = &mut config.provider;
    provider.timeout_secs = CustomType::<u64>::new("Weather API timeout (seconds):")
        .with_default(provider.timeout_secs)
        .prompt()?;
    let timezone = Text::new("Default timezone (empty to detect):")
        .with_default(provider.timezone.as_deref().unwrap_or_default())
        .prompt()?;
    provider.timezone = Some(timezone).filter(|tz| !tz.trim().is_empty());

    config.consumer.requeue_transient =
        Confirm::new("Requeue a message once after a transient weather API failure?")
            .with_default(config.consumer.requeue_transient)
            .prompt()?;
    Ok(())
}
