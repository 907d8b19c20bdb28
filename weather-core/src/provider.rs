use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;

use crate::{Config, model::Forecast};

pub mod openmeteo;

pub use openmeteo::OpenMeteoMarineProvider;

/// Parameters of one forecast lookup. Dates are `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastQuery {
    pub latitude: f64,
    pub longitude: f64,
    pub start_date: String,
    pub end_date: String,
    pub timezone: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("marine weather request timed out")]
    Timeout,

    #[error("failed to reach marine weather API: {0}")]
    Transport(String),

    #[error("marine weather API responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode marine weather response: {0}")]
    Decode(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl ProviderError {
    /// Whether a later attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::Transport(_) => true,
            ProviderError::Status { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Decode(_) | ProviderError::Client(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

#[async_trait]
pub trait MarineWeatherProvider: Send + Sync + Debug {
    /// Short identifier of the data source, stored in record metadata.
    fn source(&self) -> &'static str;

    /// Host the data is fetched from, stored in record metadata.
    fn api_source(&self) -> &str;

    async fn fetch_forecast(&self, query: &ForecastQuery) -> Result<Forecast, ProviderError>;
}

/// Construct the marine weather provider from config.
pub fn provider_from_config(config: &Config) -> Result<OpenMeteoMarineProvider, ProviderError> {
    OpenMeteoMarineProvider::new(config.provider.api_url.clone(), config.provider.timeout())
}

/// Timezone used when a request carries none: the configured one, else the
/// host's IANA zone, else UTC.
pub fn default_timezone(config: &Config) -> String {
    config
        .provider
        .timezone
        .clone()
        .or_else(|| iana_time_zone::get_timezone().ok())
        .filter(|tz| !tz.trim().is_empty())
        .unwrap_or_else(|| "UTC".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::Transport("refused".into()).is_transient());
        assert!(ProviderError::Status { status: 503, body: String::new() }.is_transient());
        assert!(ProviderError::Status { status: 429, body: String::new() }.is_transient());
        assert!(!ProviderError::Status { status: 400, body: String::new() }.is_transient());
        assert!(!ProviderError::Decode("bad json".into()).is_transient());
    }

    #[test]
    fn configured_timezone_wins() {
        let mut cfg = Config::default();
        cfg.provider.timezone = Some("America/Sao_Paulo".into());

        assert_eq!(default_timezone(&cfg), "America/Sao_Paulo");
    }

    #[test]
    fn guessed_timezone_is_never_empty() {
        let cfg = Config::default();
        assert!(!default_timezone(&cfg).is_empty());
    }

    #[test]
    fn provider_from_default_config_builds() {
        let provider = provider_from_config(&Config::default()).expect("client builds");
        assert_eq!(provider.source(), "open-meteo");
        assert_eq!(provider.api_source(), "marine-api.open-meteo.com");
    }
}
