//! Gateway configuration, loaded once from TOML at startup.
//!
//! ```toml
//! [queue]
//! high_capacity = 1000
//! workers = 4
//!
//! [[providers]]
//! id = "yahoo-finance"
//! base_url = "https://query1.finance.yahoo.com"
//! url_template = "{base_url}/v8/finance/chart/{symbol}?interval=1d&range=1d"
//! response_format = "yahoo_chart"
//! priority = 1
//! ```
//!
//! Every section has defaults, so a file only needs the keys it overrides.
//! Omitting `[[providers]]` entirely yields the four-provider default deployment.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::domain::{DataType, Symbol};
use crate::error::ConfigError;
use crate::market_hours::MarketHours;
use crate::provider::ProviderId;
use crate::rate_limiter::RateLimitConfig;
use crate::retry::{Backoff, RetryPolicy};
use crate::upstream::ResponseFormat;
use crate::ValidationError;

/// Root of the TOML document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub logging: LoggingConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub health: HealthConfig,
    pub market_hours: MarketHoursConfig,
    pub providers: Vec<ProviderConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            queue: QueueConfig::default(),
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
            market_hours: MarketHoursConfig::default(),
            providers: default_providers(),
        }
    }
}

impl GatewayConfig {
    /// Reads, parses and validates a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&raw)?;

        info!(
            path = %path.display(),
            providers = config.providers.len(),
            workers = config.queue.workers,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.queue.validate()?;
        self.cache.validate()?;
        self.health.validate()?;
        MarketHours::from_config(&self.market_hours)?;

        ensure(!self.providers.is_empty(), "at least one provider must be configured")?;
        ensure(
            self.providers.iter().any(|provider| provider.enabled),
            "at least one provider must be enabled",
        )?;

        let mut seen = HashSet::new();
        for provider in &self.providers {
            ensure(
                seen.insert(provider.id.clone()),
                format!("provider '{}' is configured more than once", provider.id),
            )?;
            provider.validate()?;
        }

        Ok(())
    }
}

/// `[logging]`: default filter when `RUST_LOG` is unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            json: false,
        }
    }
}

/// `[queue]`: admission lanes, worker pool and retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub high_capacity: usize,
    pub medium_capacity: usize,
    pub low_capacity: usize,
    pub workers: usize,
    /// Assumed requests per second one worker completes, used for wait estimates.
    pub throughput_per_worker: f64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_factor: f64,
    pub retry_max_ms: u64,
    pub retry_jitter: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            high_capacity: 1000,
            medium_capacity: 1000,
            low_capacity: 1000,
            workers: 4,
            throughput_per_worker: 1.0,
            max_retries: 3,
            retry_base_ms: 1_000,
            retry_factor: 2.0,
            retry_max_ms: 300_000,
            retry_jitter: false,
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(self.retry_base_ms),
                factor: self.retry_factor,
                max: Duration::from_millis(self.retry_max_ms),
                jitter: self.retry_jitter,
            },
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        ensure(
            self.high_capacity > 0 && self.medium_capacity > 0 && self.low_capacity > 0,
            "queue lane capacities must be positive",
        )?;
        ensure(self.workers > 0, "queue.workers must be positive")?;
        ensure(
            self.throughput_per_worker.is_finite() && self.throughput_per_worker > 0.0,
            "queue.throughput_per_worker must be a positive number",
        )?;
        ensure(
            self.retry_factor.is_finite() && self.retry_factor >= 1.0,
            "queue.retry_factor must be >= 1",
        )?;
        ensure(
            self.retry_max_ms >= self.retry_base_ms,
            "queue.retry_max_ms must be >= queue.retry_base_ms",
        )
    }
}

/// `[cache]`: sweep, market-open watch and prefetch schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub sweep_interval_secs: u64,
    pub market_check_interval_secs: u64,
    pub prefetch_interval_secs: u64,
    pub prefetch_jitter_secs: u64,
    pub popular_symbols: Vec<String>,
    pub prefetch_data_types: Vec<DataType>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            market_check_interval_secs: 30,
            prefetch_interval_secs: 3_600,
            prefetch_jitter_secs: 300,
            popular_symbols: [
                "AAPL", "GOOGL", "MSFT", "AMZN", "TSLA", "META", "NVDA", "NFLX", "SPY", "QQQ",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            prefetch_data_types: vec![
                DataType::Price,
                DataType::Fundamentals,
                DataType::Technical,
            ],
        }
    }
}

impl CacheConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn market_check_interval(&self) -> Duration {
        Duration::from_secs(self.market_check_interval_secs)
    }

    pub fn prefetch_interval(&self) -> Duration {
        Duration::from_secs(self.prefetch_interval_secs)
    }

    pub fn prefetch_jitter(&self) -> Duration {
        Duration::from_secs(self.prefetch_jitter_secs)
    }

    pub fn popular_symbols(&self) -> Result<Vec<Symbol>, ValidationError> {
        self.popular_symbols
            .iter()
            .map(|symbol| Symbol::parse(symbol))
            .collect()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        ensure(
            self.sweep_interval_secs > 0
                && self.market_check_interval_secs > 0
                && self.prefetch_interval_secs > 0,
            "cache intervals must be positive",
        )?;
        self.popular_symbols()?;
        Ok(())
    }
}

/// `[health]`: active probe schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub probe_symbol: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 300,
            probe_timeout_ms: 10_000,
            probe_symbol: String::from("AAPL"),
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        ensure(
            self.probe_interval_secs > 0 && self.probe_timeout_ms > 0,
            "health probe interval and timeout must be positive",
        )?;
        Symbol::parse(&self.probe_symbol)?;
        Ok(())
    }
}

/// `[market_hours]`: trading session used for cache expiry and routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarketHoursConfig {
    /// Local `HH:MM`.
    pub open: String,
    pub close: String,
    /// Fixed offset from UTC, `+HH:MM` or `-HH:MM`.
    pub utc_offset: String,
    pub weekdays_only: bool,
}

impl Default for MarketHoursConfig {
    fn default() -> Self {
        Self {
            open: String::from("09:30"),
            close: String::from("16:00"),
            utc_offset: String::from("-05:00"),
            weekdays_only: true,
        }
    }
}

/// One `[[providers]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub id: ProviderId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub base_url: String,
    /// Request URL with `{base_url}`, `{symbol}`, `{data_type}` and `{api_key}` placeholders.
    pub url_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_url_template: Option<String>,
    /// Environment variable holding the API key substituted for `{api_key}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub response_format: ResponseFormat,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub cost_per_request: f64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Strength per data type in `[0, 1]`, keyed by data type name.
    #[serde(default)]
    pub specializations: BTreeMap<String, f64>,
    #[serde(default)]
    pub coverage: Vec<String>,
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn specialization_table(&self) -> Result<BTreeMap<DataType, f64>, ValidationError> {
        self.specializations
            .iter()
            .map(|(data_type, score)| Ok((data_type.parse::<DataType>()?, *score)))
            .collect()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let id = &self.id;
        ensure(
            !self.base_url.trim().is_empty(),
            format!("provider '{id}' has an empty base_url"),
        )?;
        ensure(
            self.url_template.contains("{symbol}"),
            format!("provider '{id}' url_template must contain {{symbol}}"),
        )?;
        ensure(
            self.timeout_ms > 0,
            format!("provider '{id}' timeout_ms must be positive"),
        )?;
        ensure(
            self.cost_per_request.is_finite() && self.cost_per_request >= 0.0,
            format!("provider '{id}' cost_per_request must be a non-negative number"),
        )?;
        self.specialization_table()?;
        ensure(
            self.specializations
                .values()
                .all(|score| (0.0..=1.0).contains(score)),
            format!("provider '{id}' specialization scores must lie in [0, 1]"),
        )?;
        self.rate_limit
            .validate()
            .map_err(|message| invalid(format!("provider '{id}' {message}")))?;
        self.circuit_breaker
            .validate()
            .map_err(|message| invalid(format!("provider '{id}' {message}")))
    }
}

const fn enabled_by_default() -> bool {
    true
}

const fn default_timeout_ms() -> u64 {
    10_000
}

fn ensure(condition: bool, message: impl Into<String>) -> Result<(), ValidationError> {
    if condition {
        Ok(())
    } else {
        Err(invalid(message))
    }
}

fn invalid(message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidConfig {
        message: message.into(),
    }
}

#[allow(clippy::too_many_arguments)]
fn builtin_provider(
    id: &'static str,
    name: &str,
    api_key_env: Option<&str>,
    base_url: &str,
    url_path: &str,
    response_format: ResponseFormat,
    priority: u32,
    timeout_ms: u64,
    cost_per_request: f64,
    requests_per_second: f64,
    specializations: &[(DataType, f64)],
    coverage: &[&str],
) -> ProviderConfig {
    ProviderConfig {
        id: ProviderId::from_static(id),
        name: name.to_owned(),
        enabled: true,
        base_url: base_url.to_owned(),
        url_template: format!("{{base_url}}{url_path}"),
        health_url_template: None,
        api_key_env: api_key_env.map(String::from),
        response_format,
        priority,
        timeout_ms,
        cost_per_request,
        rate_limit: RateLimitConfig {
            requests_per_second,
            burst: 1,
        },
        circuit_breaker: CircuitBreakerConfig::default(),
        specializations: specializations
            .iter()
            .map(|(data_type, score)| (data_type.as_str().to_owned(), *score))
            .collect(),
        coverage: coverage.iter().map(|region| (*region).to_owned()).collect(),
    }
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        builtin_provider(
            "yahoo-finance",
            "Yahoo Finance",
            None,
            "https://query1.finance.yahoo.com",
            "/v8/finance/chart/{symbol}?interval=1d&range=1d",
            ResponseFormat::YahooChart,
            1,
            5_000,
            0.0,
            2.0,
            &[
                (DataType::Price, 0.9),
                (DataType::Fundamentals, 0.8),
                (DataType::News, 0.7),
                (DataType::Options, 0.6),
            ],
            &["US", "EU", "ASIA", "GLOBAL"],
        ),
        builtin_provider(
            "alpha-vantage",
            "Alpha Vantage",
            Some("QUOTEGATE_ALPHA_VANTAGE_API_KEY"),
            "https://www.alphavantage.co",
            "/query?function=TIME_SERIES_DAILY&symbol={symbol}&apikey={api_key}",
            ResponseFormat::AlphaVantageDaily,
            2,
            10_000,
            0.0001,
            0.2,
            &[
                (DataType::Technical, 0.9),
                (DataType::Fundamentals, 0.8),
                (DataType::News, 0.6),
                (DataType::Price, 0.7),
            ],
            &["US", "EU", "ASIA"],
        ),
        builtin_provider(
            "twelve-data",
            "Twelve Data",
            Some("QUOTEGATE_TWELVE_DATA_API_KEY"),
            "https://api.twelvedata.com",
            "/time_series?symbol={symbol}&interval=1day&apikey={api_key}",
            ResponseFormat::TwelveDataSeries,
            3,
            10_000,
            0.0002,
            0.5,
            &[
                (DataType::RealTime, 0.9),
                (DataType::Technical, 0.8),
                (DataType::Price, 0.8),
                (DataType::Fundamentals, 0.6),
            ],
            &["US", "EU", "ASIA", "GLOBAL"],
        ),
        builtin_provider(
            "polygon",
            "Polygon.io",
            Some("QUOTEGATE_POLYGON_API_KEY"),
            "https://api.polygon.io",
            "/v2/aggs/ticker/{symbol}/prev?apikey={api_key}",
            ResponseFormat::PolygonAggregates,
            4,
            10_000,
            0.0005,
            0.2,
            &[
                (DataType::RealTime, 0.95),
                (DataType::Historical, 0.9),
                (DataType::Options, 0.8),
                (DataType::Fundamentals, 0.7),
            ],
            &["US"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = GatewayConfig::default();
        config.validate().expect("default config validates");
        assert_eq!(config.providers.len(), 4);
        assert_eq!(config.providers[0].id.as_str(), "yahoo-finance");
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [queue]
            high_capacity = 2
            workers = 1
            "#,
        )
        .expect("partial config parses");

        assert_eq!(config.queue.high_capacity, 2);
        assert_eq!(config.queue.medium_capacity, 1000);
        assert_eq!(config.cache.sweep_interval_secs, 300);
        assert_eq!(config.providers.len(), 4);
    }

    #[test]
    fn rejects_duplicate_provider_ids() {
        let mut config = GatewayConfig::default();
        let duplicate = config.providers[0].clone();
        config.providers.push(duplicate);

        let error = config.validate().expect_err("duplicate must fail");
        assert!(error.to_string().contains("more than once"));
    }

    #[test]
    fn rejects_template_without_symbol() {
        let mut config = GatewayConfig::default();
        config.providers[1].url_template = String::from("{base_url}/query");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        let result = GatewayConfig::from_toml_str("[queue]\nworkerz = 3\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn serialized_config_parses_back() {
        let config = GatewayConfig::default();
        let rendered = config.to_toml().expect("serializes");
        let parsed = GatewayConfig::from_toml_str(&rendered).expect("parses");
        assert_eq!(parsed, config);
    }

    #[test]
    fn retry_policy_follows_queue_section() {
        let policy = QueueConfig::default().retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(2));
    }
}
