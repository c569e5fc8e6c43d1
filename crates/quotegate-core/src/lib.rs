//! # Quotegate Core
//!
//! Admission, routing and resilience layer in front of rate-limited market
//! data providers.
//!
//! ## Overview
//!
//! Requests for a symbol and [`DataType`] enter a bounded three-lane
//! [`AdmissionQueue`]. Worker tasks drain it in strict priority order and ask
//! the [`SmartRouter`] for a ranked list of providers. Each attempt passes the
//! provider's [`CircuitBreaker`] and rate limiter before any network call, and
//! every outcome feeds the [`HealthMonitor`] that the router scores from.
//! Successful responses land in an [`AdaptiveCache`] whose TTLs follow market
//! hours.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Market-hours-aware response cache |
//! | [`circuit_breaker`] | Per-provider sliding-window breakers |
//! | [`config`] | TOML configuration and validation |
//! | [`domain`] | Symbols, data types, work items, payloads |
//! | [`error`] | Validation, upstream, gateway and config errors |
//! | [`health`] | Per-provider health, counters and cost |
//! | [`http_client`] | HTTP client abstraction |
//! | [`market_hours`] | Trading session clock |
//! | [`orchestrator`] | [`Gateway`] wiring, workers and dispatch |
//! | [`queue`] | Priority admission with retry and dead letters |
//! | [`rate_limiter`] | Per-provider token buckets |
//! | [`registry`] | Provider descriptors |
//! | [`retry`] | Backoff policy |
//! | [`routing`] | Multi-factor provider scoring |
//! | [`upstream`] | Provider request building and response parsing |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use quotegate_core::{DataType, Gateway, GatewayConfig, GatewayResponse, Priority, Symbol};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Gateway::builder(GatewayConfig::default()).build()?;
//!     gateway.start();
//!
//!     let submission = gateway.submit(Symbol::parse("AAPL")?, DataType::Price, Priority::High)?;
//!     if let GatewayResponse::Data(payload) = submission.wait().await? {
//!         println!("{} bars from {}", payload.bars.len(), payload.provider);
//!     }
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Security
//!
//! - API keys are read from environment variables and never logged
//! - Administrative operations require a caller with [`Role::Admin`]

mod background;

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod domain;
pub mod error;
pub mod health;
pub mod http_client;
pub mod market_hours;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod routing;
pub mod upstream;

// Cache
pub use cache::{AdaptiveCache, CacheStats};

// Circuit breaker
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerBank, CircuitBreakerConfig, CircuitBreakerMetrics,
    CircuitState,
};

// Configuration
pub use config::{
    CacheConfig, GatewayConfig, HealthConfig, LoggingConfig, MarketHoursConfig, ProviderConfig,
    QueueConfig,
};

// Domain models
pub use domain::{
    Caller, DataType, MarketPayload, OhlcvBar, Priority, Role, Symbol, WorkId, WorkItem, WorkState,
    DEFAULT_REGION,
};

// Error types
pub use error::{ConfigError, GatewayError, UpstreamError, UpstreamErrorKind, ValidationError};

// Health
pub use health::{CostReport, HealthMonitor, HealthStatus, HealthSummary, ProviderHealth};

// HTTP client types
pub use http_client::{HttpClient, HttpError, HttpRequest, HttpResponse, NoopHttpClient, ReqwestHttpClient};

// Market hours
pub use market_hours::{FixedSession, MarketHours, MarketSession};

// Orchestration
pub use orchestrator::{
    AttemptOutcome, Gateway, GatewayBuilder, GatewaySnapshot, SkipReason, WARM_DATA_TYPES,
};

// Admission queue
pub use queue::{AdmissionQueue, GatewayResponse, LaneStats, QueueStats, Submission, WorkResult};

// Rate limiting
pub use rate_limiter::{RateLimitConfig, RateLimiterBank, RateLimiterState};

// Providers
pub use provider::ProviderId;
pub use registry::{ProviderDescriptor, ProviderRegistry};

// Retry
pub use retry::{Backoff, RetryPolicy};

// Routing
pub use routing::{ProviderScore, RoutingRecommendation, SmartRouter};

// Upstream
pub use upstream::{Fetched, UpstreamClient};
