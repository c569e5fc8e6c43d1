//! The gateway: admission, dispatch over ranked providers, fallback and admin surface.
//!
//! A worker takes the next item from the [`AdmissionQueue`], asks the
//! [`SmartRouter`] for candidates (registry order when nothing is scored) and
//! walks them in order. Each candidate yields an [`AttemptOutcome`]; skips and
//! failures move on to the next one. When every candidate is exhausted the
//! cache is consulted once more for data that has expired but not been swept.
//! Only then does the item go back to the queue's retry path.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::background;
use crate::cache::{AdaptiveCache, CacheStats};
use crate::circuit_breaker::{CircuitBreakerBank, CircuitBreakerMetrics};
use crate::config::GatewayConfig;
use crate::domain::{Caller, DataType, Priority, Symbol, WorkId, WorkItem, DEFAULT_REGION};
use crate::error::{GatewayError, UpstreamError};
use crate::health::{CostReport, HealthMonitor, HealthSummary, ProviderHealth};
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::market_hours::{MarketHours, MarketSession};
use crate::provider::ProviderId;
use crate::queue::{AdmissionQueue, GatewayResponse, QueueStats, Submission};
use crate::rate_limiter::{RateLimiterBank, RateLimiterState};
use crate::registry::ProviderRegistry;
use crate::routing::{RoutingRecommendation, SmartRouter};
use crate::upstream::{Fetched, UpstreamClient};

/// Data types fetched by [`Gateway::warm_cache`].
pub const WARM_DATA_TYPES: [DataType; 3] = [DataType::Price, DataType::Volume, DataType::Technical];

/// Why a candidate was passed over without an upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CircuitOpen,
    RateLimited,
    /// Not registered, or disabled in configuration.
    Unavailable,
}

/// How an attempt obtains its rate permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateWait {
    /// Request path: skip the provider if no token is available now.
    Never,
    /// Background path: wait up to the provider's call timeout.
    UpToCallTimeout,
}

/// Result of trying one provider for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(Fetched),
    Skipped(SkipReason),
    Failed(UpstreamError),
}

/// Everything the admin surface reports in one serializable document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewaySnapshot {
    pub queue: QueueStats,
    pub rate_limiters: BTreeMap<ProviderId, RateLimiterState>,
    pub circuit_breakers: BTreeMap<ProviderId, CircuitBreakerMetrics>,
    pub cache: CacheStats,
    pub health: HealthSummary,
    pub providers: Vec<ProviderHealth>,
    pub costs: CostReport,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

/// Assembles a [`Gateway`] from configuration.
///
/// Production deployments only need the config; tests swap in a scripted
/// [`HttpClient`] and a fixed [`MarketSession`].
pub struct GatewayBuilder {
    config: GatewayConfig,
    http: Option<Arc<dyn HttpClient>>,
    session: Option<Arc<dyn MarketSession>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            http: None,
            session: None,
        }
    }

    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_session(mut self, session: Arc<dyn MarketSession>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn build(self) -> Result<Arc<Gateway>, GatewayError> {
        let config = self.config;
        config.validate()?;

        let registry = Arc::new(ProviderRegistry::from_config(&config)?);
        let session: Arc<dyn MarketSession> = match self.session {
            Some(session) => session,
            None => Arc::new(MarketHours::from_config(&config.market_hours)?),
        };
        let http: Arc<dyn HttpClient> = match self.http {
            Some(http) => http,
            None => Arc::new(ReqwestHttpClient::new()),
        };

        let breakers = CircuitBreakerBank::new(
            registry
                .enabled()
                .map(|descriptor| (&descriptor.id, descriptor.circuit_breaker)),
        );
        let limiters = RateLimiterBank::new(
            registry
                .enabled()
                .map(|descriptor| (&descriptor.id, descriptor.rate_limit)),
        );
        let health = Arc::new(HealthMonitor::new(&registry));
        let router = SmartRouter::new(
            Arc::clone(&registry),
            Arc::clone(&health),
            Arc::clone(&session),
        );
        let (shutdown, _) = watch::channel(false);

        info!(
            providers = registry.len(),
            enabled = registry.enabled().count(),
            "gateway assembled"
        );

        Ok(Arc::new(Gateway {
            probe_symbol: Symbol::parse(&config.health.probe_symbol)?,
            popular_symbols: config.cache.popular_symbols()?,
            queue: Arc::new(AdmissionQueue::new(&config.queue)),
            cache: AdaptiveCache::new(Arc::clone(&session)),
            upstream: UpstreamClient::new(http),
            breakers,
            limiters,
            health,
            router,
            registry,
            session,
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

/// Request gateway in front of the configured market data providers.
#[derive(Debug)]
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ProviderRegistry>,
    session: Arc<dyn MarketSession>,
    queue: Arc<AdmissionQueue>,
    breakers: CircuitBreakerBank,
    limiters: RateLimiterBank,
    health: Arc<HealthMonitor>,
    router: SmartRouter,
    cache: AdaptiveCache,
    upstream: UpstreamClient,
    probe_symbol: Symbol,
    popular_symbols: Vec<Symbol>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Spawns the worker pool and every background task.
    pub fn start(self: &Arc<Self>) {
        self.start_workers();
        let spawned = background::spawn_all(self, self.shutdown.subscribe());
        self.tasks
            .lock()
            .expect("gateway task lock is not poisoned")
            .extend(spawned);
    }

    /// Spawns only the worker pool; background probes and sweeps stay off.
    pub fn start_workers(self: &Arc<Self>) {
        let workers = self.config.queue.workers;
        let mut tasks = self.tasks.lock().expect("gateway task lock is not poisoned");
        for worker in 0..workers {
            let gateway = Arc::clone(self);
            tasks.push(tokio::spawn(async move { gateway.run_worker(worker).await }));
        }
        info!(workers, "worker pool started");
    }

    /// Closes admission, stops background tasks and waits for workers to
    /// finish the items they hold. Queued items resolve as [`GatewayError::Shutdown`].
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.queue.close();
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("gateway task lock is not poisoned"));
        for task in tasks {
            if let Err(error) = task.await {
                warn!(error = %error, "gateway task ended abnormally");
            }
        }
        info!("gateway stopped");
    }

    async fn run_worker(&self, worker: usize) {
        debug!(worker, "worker started");
        while let Some(mut item) = self.queue.dequeue().await {
            if !self.queue.begin(&mut item) {
                continue;
            }
            match self.process(&mut item).await {
                Ok(response) => self.queue.complete(item, response),
                Err(error) => self.queue.handle_failure(item, error),
            }
        }
        debug!(worker, "worker stopped");
    }

    /// Admits a request on behalf of the gateway itself.
    pub fn submit(
        &self,
        symbol: Symbol,
        data_type: DataType,
        priority: Priority,
    ) -> Result<Submission, GatewayError> {
        self.submit_as(Caller::system(), symbol, data_type, priority)
    }

    pub fn submit_as(
        &self,
        caller: Caller,
        symbol: Symbol,
        data_type: DataType,
        priority: Priority,
    ) -> Result<Submission, GatewayError> {
        self.submit_item(WorkItem::new(symbol, data_type, priority, caller))
    }

    pub fn submit_item(&self, item: WorkItem) -> Result<Submission, GatewayError> {
        info!(
            id = %item.id,
            caller = %item.caller.id,
            symbol = %item.symbol,
            data_type = %item.data_type,
            priority = %item.priority,
            "request submitted"
        );
        self.queue.submit(item)
    }

    pub fn cancel(&self, id: WorkId) -> bool {
        self.queue.cancel(id)
    }

    pub fn estimated_wait(&self, priority: Priority) -> Duration {
        self.queue.estimated_wait(priority)
    }

    /// Serves one work item: ranked providers first, then stale cache.
    pub async fn process(&self, item: &mut WorkItem) -> Result<GatewayResponse, GatewayError> {
        let candidates = self.candidates(&item.symbol, item.data_type, &item.region);
        let mut skips = Vec::new();
        let mut failures = 0usize;

        for provider in &candidates {
            match self.attempt_provider(provider, &item.symbol, item.data_type).await {
                AttemptOutcome::Success(fetched) => {
                    item.provider = Some(provider.clone());
                    return Ok(match fetched {
                        Fetched::Data(payload) => {
                            let payload = Arc::new(payload);
                            self.cache.put(Arc::clone(&payload));
                            GatewayResponse::Data(payload)
                        }
                        Fetched::NoContent => GatewayResponse::NoContent,
                    });
                }
                AttemptOutcome::Skipped(reason) => {
                    debug!(id = %item.id, provider = %provider, reason = ?reason, "provider skipped");
                    skips.push((provider, reason));
                }
                AttemptOutcome::Failed(error) => {
                    warn!(id = %item.id, provider = %provider, error = %error, "provider attempt failed");
                    failures += 1;
                }
            }
        }

        if let Some(stale) = self.cache.get_stale(&item.symbol, item.data_type) {
            warn!(
                id = %item.id,
                symbol = %item.symbol,
                provider = %stale.provider,
                "all providers exhausted, serving cached data"
            );
            item.provider = Some(stale.provider.clone());
            return Ok(GatewayResponse::Data(stale));
        }

        // Nothing was actually called: surface the single reason if there is one.
        if failures == 0 {
            if let Some((first, reason)) = skips.first() {
                if skips.iter().all(|(_, other)| other == reason) {
                    match reason {
                        SkipReason::RateLimited => {
                            return Err(GatewayError::RateLimited {
                                provider: (*first).clone(),
                            })
                        }
                        SkipReason::CircuitOpen => {
                            return Err(GatewayError::CircuitOpen {
                                provider: (*first).clone(),
                            })
                        }
                        SkipReason::Unavailable => {}
                    }
                }
            }
        }

        Err(GatewayError::AllProvidersExhausted {
            symbol: item.symbol.to_string(),
            data_type: item.data_type,
            attempts: candidates.len(),
        })
    }

    /// Router ranking, or every enabled provider in priority order when the
    /// router has nothing scored yet.
    pub fn candidates(&self, symbol: &Symbol, data_type: DataType, region: &str) -> Vec<ProviderId> {
        let ranked: Vec<ProviderId> = self
            .router
            .rank(symbol, data_type, region)
            .into_iter()
            .map(|score| score.provider)
            .collect();
        if !ranked.is_empty() {
            return ranked;
        }
        self.registry
            .enabled()
            .map(|descriptor| descriptor.id.clone())
            .collect()
    }

    /// One guarded call: breaker permit, then rate budget, then the upstream
    /// request. Health, breaker, counters and cost are updated here.
    pub async fn attempt_provider(
        &self,
        provider: &ProviderId,
        symbol: &Symbol,
        data_type: DataType,
    ) -> AttemptOutcome {
        self.attempt(provider, symbol, data_type, RateWait::Never).await
    }

    async fn attempt(
        &self,
        provider: &ProviderId,
        symbol: &Symbol,
        data_type: DataType,
        rate_wait: RateWait,
    ) -> AttemptOutcome {
        let Some(descriptor) = self.registry.get(provider).filter(|descriptor| descriptor.enabled) else {
            return AttemptOutcome::Skipped(SkipReason::Unavailable);
        };
        let Some(breaker) = self.breakers.get(provider) else {
            return AttemptOutcome::Skipped(SkipReason::Unavailable);
        };
        let Some(permit) = breaker.try_acquire() else {
            return AttemptOutcome::Skipped(SkipReason::CircuitOpen);
        };
        let permitted = match rate_wait {
            RateWait::Never => self.limiters.try_acquire(provider),
            RateWait::UpToCallTimeout => {
                self.limiters
                    .acquire_within(provider, descriptor.timeout)
                    .await
            }
        };
        if !permitted {
            return AttemptOutcome::Skipped(SkipReason::RateLimited);
        }

        self.health.record_attempt(provider);
        let started = Instant::now();
        match self.upstream.fetch(descriptor, symbol, data_type).await {
            Ok(fetched) => {
                permit.success();
                self.health.record_success(provider, started.elapsed());
                AttemptOutcome::Success(fetched)
            }
            Err(error) => {
                permit.failure();
                self.health.record_error(&error);
                AttemptOutcome::Failed(error)
            }
        }
    }

    /// Fetches the warm-up data types for `symbol` into the cache outside the
    /// queue, waiting for rate budget instead of skipping providers. Returns
    /// how many were cached.
    pub async fn warm_cache(&self, symbol: &Symbol) -> usize {
        self.warm(symbol, &WARM_DATA_TYPES).await
    }

    pub(crate) async fn warm(&self, symbol: &Symbol, data_types: &[DataType]) -> usize {
        let mut cached = 0;
        for data_type in data_types {
            for provider in self.candidates(symbol, *data_type, DEFAULT_REGION) {
                match self
                    .attempt(&provider, symbol, *data_type, RateWait::UpToCallTimeout)
                    .await
                {
                    AttemptOutcome::Success(Fetched::Data(payload)) => {
                        self.cache.put(Arc::new(payload));
                        cached += 1;
                        break;
                    }
                    AttemptOutcome::Success(Fetched::NoContent) => break,
                    AttemptOutcome::Skipped(_) | AttemptOutcome::Failed(_) => {}
                }
            }
        }
        info!(symbol = %symbol, cached, "cache warmed");
        cached
    }

    /// Runs one health probe against `provider` now.
    pub async fn check_provider(&self, provider: &ProviderId) -> Result<ProviderHealth, GatewayError> {
        let descriptor = self
            .registry
            .get(provider)
            .filter(|descriptor| descriptor.enabled)
            .ok_or_else(|| GatewayError::InvalidProvider {
                provider: provider.to_string(),
            })?;
        // The outcome is recorded on the health record either way.
        let _ = self
            .health
            .probe(
                &self.upstream,
                descriptor,
                &self.probe_symbol,
                self.config.health.probe_timeout(),
            )
            .await;
        self.health
            .health(provider)
            .ok_or_else(|| GatewayError::InvalidProvider {
                provider: provider.to_string(),
            })
    }

    pub fn routing_recommendations(
        &self,
        symbol: &Symbol,
        data_type: DataType,
        region: &str,
    ) -> RoutingRecommendation {
        self.router.recommendations(symbol, data_type, region)
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        GatewaySnapshot {
            queue: self.queue.stats(),
            rate_limiters: self.limiters.snapshot(),
            circuit_breakers: self.breakers.snapshot(),
            cache: self.cache.stats(),
            health: self.health.summary(),
            providers: self.health.all(),
            costs: self.health.cost_report(),
            generated_at: OffsetDateTime::now_utc(),
        }
    }

    /// Human-readable warnings derived from the current snapshot.
    pub fn alerts(&self) -> Vec<String> {
        let queue = self.queue.stats();
        let mut alerts = Vec::new();

        for lane in &queue.lanes {
            // Warn at 10% / 20% / 50% of capacity for high / medium / low.
            let threshold = match lane.priority {
                Priority::High => lane.capacity / 10,
                Priority::Medium => lane.capacity / 5,
                Priority::Low => lane.capacity / 2,
            };
            if lane.size > threshold {
                alerts.push(format!(
                    "{} priority queue is getting full ({}/{})",
                    lane.priority, lane.size, lane.capacity
                ));
            }
        }
        if queue.total > 0 && queue.success_rate < 90.0 {
            alerts.push(format!("success rate is below 90% ({:.1}%)", queue.success_rate));
        }
        if queue.dead_letter > 0 {
            alerts.push(format!("{} requests in dead-letter lane", queue.dead_letter));
        }
        for provider in self.breakers.open_circuits() {
            alerts.push(format!("circuit breaker open for provider '{provider}'"));
        }
        alerts
    }

    pub fn dead_letters(&self) -> Vec<WorkItem> {
        self.queue.dead_letters()
    }

    pub fn clear_dead_letters(&self, caller: &Caller) -> Result<usize, GatewayError> {
        require_admin(caller, "clear the dead-letter lane")?;
        Ok(self.queue.clear_dead_letters())
    }

    pub fn reset_rate_limiter(&self, caller: &Caller, provider: &ProviderId) -> Result<(), GatewayError> {
        require_admin(caller, "reset a rate limiter")?;
        self.limiters.reset(provider)
    }

    pub fn clear_cache(&self, caller: &Caller) -> Result<usize, GatewayError> {
        require_admin(caller, "clear the cache")?;
        Ok(self.cache.clear_all())
    }

    pub fn evict_cache(
        &self,
        caller: &Caller,
        symbol: &Symbol,
        data_type: DataType,
    ) -> Result<bool, GatewayError> {
        require_admin(caller, "evict cache entries")?;
        Ok(self.cache.evict(symbol, data_type))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn cache(&self) -> &AdaptiveCache {
        &self.cache
    }

    pub fn queue(&self) -> &AdmissionQueue {
        &self.queue
    }

    pub fn session(&self) -> &dyn MarketSession {
        self.session.as_ref()
    }

    pub(crate) fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    pub(crate) fn probe_symbol(&self) -> &Symbol {
        &self.probe_symbol
    }

    pub(crate) fn popular_symbols(&self) -> &[Symbol] {
        &self.popular_symbols
    }
}

fn require_admin(caller: &Caller, action: &'static str) -> Result<(), GatewayError> {
    if caller.is_admin() {
        Ok(())
    } else {
        warn!(caller = %caller.id, action, "admin action refused");
        Err(GatewayError::Forbidden { action })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Role;
    use crate::http_client::NoopHttpClient;
    use crate::market_hours::FixedSession;

    fn gateway() -> Arc<Gateway> {
        Gateway::builder(GatewayConfig::default())
            .with_http_client(Arc::new(NoopHttpClient))
            .with_session(Arc::new(FixedSession(false)))
            .build()
            .expect("default config builds")
    }

    #[test]
    fn candidates_fall_back_to_registry_order() {
        let gateway = gateway();
        let symbol = Symbol::parse("AAPL").expect("valid symbol");
        let order: Vec<String> = gateway
            .candidates(&symbol, DataType::Price, "US")
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(order, ["yahoo-finance", "alpha-vantage", "twelve-data", "polygon"]);
    }

    #[test]
    fn admin_actions_require_admin_role() {
        let gateway = gateway();
        let viewer = Caller::new("viewer-1", Role::Viewer);

        let error = gateway.clear_cache(&viewer).expect_err("viewer is refused");
        assert_eq!(error.code(), "gateway.forbidden");
        assert!(gateway
            .reset_rate_limiter(&viewer, &ProviderId::from_static("polygon"))
            .is_err());
        assert_eq!(gateway.clear_dead_letters(&Caller::system()), Ok(0));
    }

    #[test]
    fn reset_of_unknown_provider_is_invalid() {
        let gateway = gateway();
        let error = gateway
            .reset_rate_limiter(&Caller::system(), &ProviderId::from_static("nasdaq"))
            .expect_err("unknown provider");
        assert_eq!(error.code(), "gateway.invalid_provider");
    }

    #[tokio::test]
    async fn empty_provider_answers_are_no_content() {
        let gateway = gateway();
        let mut item = WorkItem::new(
            Symbol::parse("AAPL").expect("valid symbol"),
            DataType::Price,
            Priority::High,
            Caller::system(),
        );

        let response = gateway.process(&mut item).await.expect("served");

        assert_eq!(response, GatewayResponse::NoContent);
        assert_eq!(item.provider.as_ref().map(ProviderId::as_str), Some("yahoo-finance"));
        assert!(gateway.cache().is_empty());
    }

    #[tokio::test]
    async fn fresh_gateway_raises_no_alerts() {
        let gateway = gateway();
        assert!(gateway.alerts().is_empty());
        let snapshot = gateway.snapshot();
        assert_eq!(snapshot.rate_limiters.len(), 4);
        assert_eq!(snapshot.circuit_breakers.len(), 4);
        assert_eq!(snapshot.providers.len(), 4);
    }
}
