//! Provider descriptor table built once from configuration.
//!
//! Each descriptor carries everything needed to reach its provider (URL
//! templates, response format, timeout) plus the static routing tables
//! (specialization per data type, regional coverage, cost). Adding a provider
//! is a configuration change.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::config::{GatewayConfig, ProviderConfig};
use crate::domain::{DataType, Symbol};
use crate::provider::ProviderId;
use crate::rate_limiter::RateLimitConfig;
use crate::upstream::ResponseFormat;
use crate::ValidationError;

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub name: String,
    pub enabled: bool,
    pub base_url: String,
    pub url_template: String,
    pub health_url_template: Option<String>,
    pub api_key: ApiKey,
    pub response_format: ResponseFormat,
    pub priority: u32,
    pub timeout: Duration,
    pub cost_per_request: f64,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub specializations: BTreeMap<DataType, f64>,
    /// Region codes, uppercase.
    pub coverage: BTreeSet<String>,
}

impl ProviderDescriptor {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ValidationError> {
        Ok(Self {
            id: config.id.clone(),
            name: if config.name.trim().is_empty() {
                config.id.to_string()
            } else {
                config.name.clone()
            },
            enabled: config.enabled,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            url_template: config.url_template.clone(),
            health_url_template: config.health_url_template.clone(),
            api_key: ApiKey::from_env(config.api_key_env.as_deref()),
            response_format: config.response_format,
            priority: config.priority,
            timeout: config.timeout(),
            cost_per_request: config.cost_per_request,
            rate_limit: config.rate_limit,
            circuit_breaker: config.circuit_breaker,
            specializations: config.specialization_table()?,
            coverage: config
                .coverage
                .iter()
                .map(|region| region.trim().to_ascii_uppercase())
                .collect(),
        })
    }

    /// Data URL for one symbol.
    pub fn request_url(&self, symbol: &Symbol, data_type: DataType) -> String {
        self.render(&self.url_template, symbol, data_type)
    }

    /// Lightweight probe URL; falls back to the data URL when no health template is set.
    pub fn health_url(&self, probe_symbol: &Symbol) -> String {
        let template = self
            .health_url_template
            .as_deref()
            .unwrap_or(&self.url_template);
        self.render(template, probe_symbol, DataType::Price)
    }

    pub fn specialization(&self, data_type: DataType) -> Option<f64> {
        self.specializations.get(&data_type).copied()
    }

    pub fn covers(&self, region: &str) -> bool {
        self.coverage.contains(&region.trim().to_ascii_uppercase())
    }

    fn render(&self, template: &str, symbol: &Symbol, data_type: DataType) -> String {
        template
            .replace("{base_url}", &self.base_url)
            .replace("{symbol}", &urlencoding::encode(symbol.as_str()))
            .replace("{data_type}", data_type.as_str())
            .replace("{api_key}", &urlencoding::encode(self.api_key.expose()))
    }
}

/// Provider API key, resolved from the environment once at startup.
///
/// Providers without a configured key get their public `DEMO` key.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ApiKey(Option<String>);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Some(key.into()))
    }

    fn from_env(variable: Option<&str>) -> Self {
        Self(
            variable
                .and_then(|name| std::env::var(name).ok())
                .map(|key| key.trim().to_owned())
                .filter(|key| !key.is_empty()),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.0.is_some()
    }

    fn expose(&self) -> &str {
        self.0.as_deref().unwrap_or("DEMO")
    }
}

impl Debug for ApiKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_configured() { "ApiKey(***)" } else { "ApiKey(DEMO)" })
    }
}

/// All configured providers, ordered by ascending `priority` then id.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<ProviderDescriptor>>,
    index: HashMap<ProviderId, usize>,
}

impl ProviderRegistry {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, ValidationError> {
        let descriptors = config
            .providers
            .iter()
            .map(ProviderDescriptor::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(descriptors))
    }

    pub fn new(mut descriptors: Vec<ProviderDescriptor>) -> Self {
        descriptors.sort_by(|left, right| {
            left.priority
                .cmp(&right.priority)
                .then_with(|| left.id.cmp(&right.id))
        });
        let index = descriptors
            .iter()
            .enumerate()
            .map(|(position, descriptor)| (descriptor.id.clone(), position))
            .collect();
        Self {
            providers: descriptors.into_iter().map(Arc::new).collect(),
            index,
        }
    }

    pub fn get(&self, id: &ProviderId) -> Option<&Arc<ProviderDescriptor>> {
        self.index.get(id).map(|position| &self.providers[*position])
    }

    /// Position in priority order, used as the routing tie-breaker.
    pub fn position(&self, id: &ProviderId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<ProviderDescriptor>> {
        self.providers.iter()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Arc<ProviderDescriptor>> {
        self.providers.iter().filter(|descriptor| descriptor.enabled)
    }

    pub fn is_enabled(&self, id: &ProviderId) -> bool {
        self.get(id).is_some_and(|descriptor| descriptor.enabled)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
