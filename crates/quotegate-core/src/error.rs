use std::time::Duration;

use thiserror::Error;

use crate::domain::{DataType, Priority, WorkId};
use crate::provider::ProviderId;

/// Validation and contract errors exposed by `quotegate-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("symbol cannot be empty")]
    EmptySymbol,
    #[error("symbol length {len} exceeds max {max}")]
    SymbolTooLong { len: usize, max: usize },
    #[error("symbol must start with an ASCII letter: '{ch}'")]
    SymbolInvalidStart { ch: char },
    #[error("symbol contains invalid character '{ch}' at index {index}")]
    SymbolInvalidChar { ch: char, index: usize },

    #[error("invalid data type '{value}', expected one of real-time, price, fundamentals, technical, news, historical, options, volume")]
    InvalidDataType { value: String },
    #[error("invalid priority '{value}', expected one of high, medium, low")]
    InvalidPriority { value: String },
    #[error("provider id must be non-empty lowercase ASCII, digits or '-': '{value}'")]
    InvalidProviderId { value: String },

    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },
    #[error("field '{field}' must be non-negative")]
    NegativeValue { field: &'static str },
    #[error("bar high must be >= low")]
    InvalidBarRange,
    #[error("bar open/close must be within high/low range")]
    InvalidBarBounds,

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

/// Classification of a failed upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Transport,
    Timeout,
    Status(u16),
    Parse,
}

/// Network error, non-2xx status, timeout or unparseable body from a provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{provider}: {message}")]
pub struct UpstreamError {
    provider: ProviderId,
    kind: UpstreamErrorKind,
    message: String,
}

impl UpstreamError {
    pub fn transport(provider: ProviderId, message: impl Into<String>) -> Self {
        Self {
            provider,
            kind: UpstreamErrorKind::Transport,
            message: message.into(),
        }
    }

    pub fn timeout(provider: ProviderId, after: Duration) -> Self {
        Self {
            provider,
            kind: UpstreamErrorKind::Timeout,
            message: format!("request timed out after {}ms", after.as_millis()),
        }
    }

    pub fn status(provider: ProviderId, status: u16) -> Self {
        Self {
            provider,
            kind: UpstreamErrorKind::Status(status),
            message: format!("upstream responded with HTTP {status}"),
        }
    }

    pub fn parse(provider: ProviderId, message: impl Into<String>) -> Self {
        Self {
            provider,
            kind: UpstreamErrorKind::Parse,
            message: message.into(),
        }
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    pub const fn kind(&self) -> UpstreamErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, UpstreamErrorKind::Timeout)
    }
}

/// Gateway error taxonomy surfaced to callers and admin tooling.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    #[error("{priority} lane is at capacity ({capacity})")]
    AdmissionRejected { priority: Priority, capacity: usize },

    #[error("provider '{provider}' has no rate budget available")]
    RateLimited { provider: ProviderId },

    #[error("circuit breaker for provider '{provider}' is open")]
    CircuitOpen { provider: ProviderId },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("all providers exhausted for {symbol} {data_type} after {attempts} attempt(s) and no cached data")]
    AllProvidersExhausted {
        symbol: String,
        data_type: DataType,
        attempts: usize,
    },

    #[error("request {id} moved to dead-letter lane after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        id: WorkId,
        attempts: u32,
        last_error: String,
    },

    #[error("provider '{provider}' is not registered or disabled")]
    InvalidProvider { provider: String },

    #[error("caller is not allowed to {action}")]
    Forbidden { action: &'static str },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("gateway is shutting down")]
    Shutdown,
}

impl GatewayError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AdmissionRejected { .. } => "gateway.admission_rejected",
            Self::RateLimited { .. } => "gateway.rate_limited",
            Self::CircuitOpen { .. } => "gateway.circuit_open",
            Self::Upstream(_) => "gateway.upstream_failure",
            Self::AllProvidersExhausted { .. } => "gateway.all_providers_exhausted",
            Self::RetriesExhausted { .. } => "gateway.retries_exhausted",
            Self::InvalidProvider { .. } => "gateway.invalid_provider",
            Self::Forbidden { .. } => "gateway.forbidden",
            Self::Validation(_) => "gateway.invalid_request",
            Self::Shutdown => "gateway.shutdown",
        }
    }

    /// Whether the queue's retry path should pick this failure up again.
    pub const fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::CircuitOpen { .. }
                | Self::Upstream(_)
                | Self::AllProvidersExhausted { .. }
        )
    }
}

/// Failures while loading or validating the gateway configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}
