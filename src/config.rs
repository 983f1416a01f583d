use crate::cache::CacheConfig;
use crate::dispatcher::DispatcherConfig;
use crate::providers::{ComparisonConfig, GdsConfig, MetasearchConfig};
use crate::ranking::RankingWeights;
use crate::token::DEFAULT_SAFETY_BUFFER_SECONDS;
use serde::Deserialize;
use std::env;
use std::time::Duration;

pub const ENV_PREFIX: &str = "FLIGHTS";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub cache: CacheConfig,
    pub tokens: TokenConfig,
    pub dispatcher: DispatcherConfig,
    pub ranking: RankingWeights,
    pub reference: ReferenceConfig,
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_seconds: 15 }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub safety_buffer_seconds: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            safety_buffer_seconds: DEFAULT_SAFETY_BUFFER_SECONDS,
        }
    }
}

impl TokenConfig {
    pub fn safety_buffer(&self) -> Duration {
        Duration::from_secs(self.safety_buffer_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub ttl_seconds: u64,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 24 * 60 * 60,
        }
    }
}

impl ReferenceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

// A provider is enabled by the presence of its section
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub gds: Option<GdsConfig>,
    pub comparison: Option<ComparisonConfig>,
    pub metasearch: Option<MetasearchConfig>,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in, holds developer secrets
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. FLIGHTS__PROVIDERS__GDS__CLIENT_SECRET
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }

    pub fn from_toml(source: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.http.timeout(), Duration::from_secs(15));
        assert_eq!(config.tokens.safety_buffer(), Duration::from_secs(300));
        assert_eq!(config.reference.ttl(), Duration::from_secs(86_400));
        assert_eq!(config.dispatcher.per_provider_timeout(), Duration::from_secs(10));
        assert_eq!(config.cache.default_ttl_seconds, 300);
        assert!(config.providers.gds.is_none());
    }

    #[test]
    fn test_from_toml_merges_with_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [tokens]
            safety_buffer_seconds = 120

            [ranking]
            price = 0.6
            duration = 0.2

            [providers.gds]
            base_url = "https://gds.example.com"
            token_url = "https://gds.example.com/v1/security/oauth2/token"
            client_id = "id"
            client_secret = "secret"

            [providers.comparison]
            base_url = "https://comparison.example.com"
            api_key = "key"
            "#,
        )
        .unwrap();

        assert_eq!(config.tokens.safety_buffer_seconds, 120);
        assert_eq!(config.http.timeout_seconds, 15);
        assert!((config.ranking.price - 0.6).abs() < f64::EPSILON);
        assert!((config.ranking.stops - 0.2).abs() < f64::EPSILON);
        assert!((config.ranking.price_baseline - 1000.0).abs() < f64::EPSILON);

        let gds = config.providers.gds.unwrap();
        assert_eq!(gds.client_id, "id");
        let comparison = config.providers.comparison.unwrap();
        assert_eq!(comparison.api_key_header, "X-API-Key");
        assert!(config.providers.metasearch.is_none());
    }

    #[test]
    fn test_checked_in_defaults_parse() {
        let config = AppConfig::from_toml(include_str!("../config/default.toml")).unwrap();
        assert_eq!(config.tokens.safety_buffer_seconds, DEFAULT_SAFETY_BUFFER_SECONDS);
        assert!(config.providers.gds.is_some());
    }
}
