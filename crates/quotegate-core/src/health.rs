//! Per-provider health, latency and cost bookkeeping.
//!
//! Live traffic and the background probe feed the same records. Each provider
//! has its own lock, so workers calling different providers never contend.
//! Hourly and daily request counters are plain atomics reset on a schedule and
//! do not feed the rolling statistics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::domain::Symbol;
use crate::error::UpstreamError;
use crate::provider::ProviderId;
use crate::registry::{ProviderDescriptor, ProviderRegistry};
use crate::upstream::UpstreamClient;

const HEALTHY_SUCCESS_RATE: f64 = 95.0;
const FAST_LATENCY_MS: f64 = 1_000.0;
const COST_EFFECTIVE_PER_REQUEST: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Slow,
    Unknown,
    Maintenance,
}

/// Rolling health record of one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub provider: ProviderId,
    pub status: HealthStatus,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeout_count: u64,
    /// Percentage of successful requests, `0.0` before the first request.
    pub success_rate: f64,
    /// Incremental mean over successful requests.
    pub average_latency_ms: f64,
    pub last_latency_ms: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_checked_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub cost_per_request: f64,
    /// Live attempts charged at `cost_per_request`. Probes are not charged.
    pub charged_requests: u64,
    pub total_cost: f64,
    pub requests_this_hour: u64,
    pub requests_today: u64,
}

impl ProviderHealth {
    fn new(provider: ProviderId, cost_per_request: f64) -> Self {
        Self {
            provider,
            status: HealthStatus::Unknown,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            timeout_count: 0,
            success_rate: 0.0,
            average_latency_ms: 0.0,
            last_latency_ms: 0,
            last_success_at: None,
            last_checked_at: None,
            last_error: None,
            cost_per_request,
            charged_requests: 0,
            total_cost: 0.0,
            requests_this_hour: 0,
            requests_today: 0,
        }
    }

    /// Eligible for routing.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy && self.success_rate >= HEALTHY_SUCCESS_RATE
    }

    pub fn is_fast(&self) -> bool {
        self.average_latency_ms < FAST_LATENCY_MS
    }

    pub fn is_cost_effective(&self) -> bool {
        self.cost_per_request < COST_EFFECTIVE_PER_REQUEST
    }

    fn refresh_success_rate(&mut self) {
        if self.total_requests > 0 {
            self.success_rate = self.successful_requests as f64 * 100.0 / self.total_requests as f64;
        }
    }
}

#[derive(Debug)]
struct HealthSlot {
    record: Mutex<ProviderHealth>,
    hourly: AtomicU64,
    daily: AtomicU64,
}

impl HealthSlot {
    fn update<R>(&self, apply: impl FnOnce(&mut ProviderHealth) -> R) -> R {
        let mut record = self
            .record
            .lock()
            .expect("provider health lock is not poisoned");
        apply(&mut record)
    }

    fn snapshot(&self) -> ProviderHealth {
        let mut record = self.update(|record| record.clone());
        record.requests_this_hour = self.hourly.load(Ordering::Relaxed);
        record.requests_today = self.daily.load(Ordering::Relaxed);
        record
    }
}

/// System-wide aggregate across monitored providers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub total_providers: usize,
    pub healthy_providers: usize,
    pub unhealthy_providers: usize,
    pub health_percentage: f64,
    pub average_latency_ms: f64,
    pub average_success_rate: f64,
    pub total_cost: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderCost {
    pub provider: ProviderId,
    pub cost_per_request: f64,
    pub charged_requests: u64,
    pub total_cost: f64,
}

/// Which used providers are cheapest and most expensive, and what moving all
/// of the expensive provider's traffic to the cheapest would have saved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostReport {
    pub most_cost_effective: Option<ProviderId>,
    pub most_expensive: Option<ProviderId>,
    pub total_cost: f64,
    pub potential_savings: f64,
    pub providers: Vec<ProviderCost>,
}

/// Health records for every enabled provider, in registry order.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    order: Vec<ProviderId>,
    slots: HashMap<ProviderId, HealthSlot>,
}

impl HealthMonitor {
    pub fn new(registry: &ProviderRegistry) -> Self {
        let mut order = Vec::new();
        let mut slots = HashMap::new();
        for descriptor in registry.enabled() {
            order.push(descriptor.id.clone());
            slots.insert(
                descriptor.id.clone(),
                HealthSlot {
                    record: Mutex::new(ProviderHealth::new(
                        descriptor.id.clone(),
                        descriptor.cost_per_request,
                    )),
                    hourly: AtomicU64::new(0),
                    daily: AtomicU64::new(0),
                },
            );
            info!(provider = %descriptor.id, "health monitoring initialized");
        }
        Self { order, slots }
    }

    pub fn record_success(&self, provider: &ProviderId, latency: Duration) {
        let Some(slot) = self.slots.get(provider) else {
            return;
        };
        let latency_ms = latency.as_millis() as u64;
        slot.update(|record| {
            record.total_requests += 1;
            record.successful_requests += 1;
            record.last_success_at = Some(OffsetDateTime::now_utc());
            record.last_latency_ms = latency_ms;
            let n = record.successful_requests as f64;
            record.average_latency_ms =
                (record.average_latency_ms * (n - 1.0) + latency_ms as f64) / n;
            record.refresh_success_rate();
            record.status = HealthStatus::Healthy;
            record.last_error = None;
        });
    }

    pub fn record_failure(&self, provider: &ProviderId, error: &str) {
        let Some(slot) = self.slots.get(provider) else {
            return;
        };
        slot.update(|record| {
            record.total_requests += 1;
            record.failed_requests += 1;
            record.refresh_success_rate();
            record.status = HealthStatus::Unhealthy;
            record.last_error = Some(error.to_owned());
        });
    }

    pub fn record_timeout(&self, provider: &ProviderId) {
        let Some(slot) = self.slots.get(provider) else {
            return;
        };
        slot.update(|record| {
            record.total_requests += 1;
            record.timeout_count += 1;
            record.refresh_success_rate();
            record.status = HealthStatus::Slow;
        });
    }

    /// Routes an upstream failure to the timeout or failure counter.
    pub fn record_error(&self, error: &UpstreamError) {
        if error.is_timeout() {
            self.record_timeout(error.provider());
        } else {
            self.record_failure(error.provider(), error.message());
        }
    }

    /// Bumps the hourly/daily counters and charges one request. Called for every
    /// live attempt, successful or not.
    pub fn record_attempt(&self, provider: &ProviderId) {
        let Some(slot) = self.slots.get(provider) else {
            return;
        };
        slot.hourly.fetch_add(1, Ordering::Relaxed);
        slot.daily.fetch_add(1, Ordering::Relaxed);
        slot.update(|record| {
            record.charged_requests += 1;
            record.total_cost += record.cost_per_request;
        });
    }

    pub fn health(&self, provider: &ProviderId) -> Option<ProviderHealth> {
        self.slots.get(provider).map(HealthSlot::snapshot)
    }

    pub fn is_healthy(&self, provider: &ProviderId) -> bool {
        self.slots
            .get(provider)
            .is_some_and(|slot| slot.update(|record| record.is_healthy()))
    }

    pub fn all(&self) -> Vec<ProviderHealth> {
        self.order
            .iter()
            .filter_map(|provider| self.health(provider))
            .collect()
    }

    pub fn summary(&self) -> HealthSummary {
        let records = self.all();
        let total_providers = records.len();
        let healthy_providers = records.iter().filter(|record| record.is_healthy()).count();
        let average = |value: fn(&ProviderHealth) -> f64| {
            if records.is_empty() {
                0.0
            } else {
                records.iter().map(value).sum::<f64>() / total_providers as f64
            }
        };

        HealthSummary {
            total_providers,
            healthy_providers,
            unhealthy_providers: total_providers - healthy_providers,
            health_percentage: if total_providers > 0 {
                healthy_providers as f64 * 100.0 / total_providers as f64
            } else {
                0.0
            },
            average_latency_ms: average(|record| record.average_latency_ms),
            average_success_rate: average(|record| record.success_rate),
            total_cost: records.iter().map(|record| record.total_cost).sum(),
            generated_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn cost_report(&self) -> CostReport {
        let records = self.all();
        let used: Vec<&ProviderHealth> = records
            .iter()
            .filter(|record| record.charged_requests > 0)
            .collect();

        // First provider in registry order wins ties.
        let cheapest = used.iter().copied().reduce(|best, record| {
            if record.cost_per_request < best.cost_per_request {
                record
            } else {
                best
            }
        });
        let most_expensive = used.iter().copied().reduce(|worst, record| {
            if record.cost_per_request > worst.cost_per_request {
                record
            } else {
                worst
            }
        });

        let potential_savings = match (cheapest, most_expensive) {
            (Some(cheap), Some(expensive)) => {
                expensive.charged_requests as f64
                    * (expensive.cost_per_request - cheap.cost_per_request)
            }
            _ => 0.0,
        };

        CostReport {
            most_cost_effective: cheapest.map(|record| record.provider.clone()),
            most_expensive: most_expensive.map(|record| record.provider.clone()),
            total_cost: records.iter().map(|record| record.total_cost).sum(),
            potential_savings,
            providers: records
                .iter()
                .map(|record| ProviderCost {
                    provider: record.provider.clone(),
                    cost_per_request: record.cost_per_request,
                    charged_requests: record.charged_requests,
                    total_cost: record.total_cost,
                })
                .collect(),
        }
    }

    /// Issues one probe request and records its outcome like live traffic,
    /// without touching the hourly/daily counters or cost.
    pub async fn probe(
        &self,
        upstream: &UpstreamClient,
        descriptor: &ProviderDescriptor,
        probe_symbol: &Symbol,
        timeout: Duration,
    ) -> Result<Duration, UpstreamError> {
        let outcome = upstream.probe(descriptor, probe_symbol, timeout).await;
        match &outcome {
            Ok(latency) => {
                self.record_success(&descriptor.id, *latency);
                debug!(provider = %descriptor.id, latency_ms = latency.as_millis() as u64, "health probe succeeded");
            }
            Err(error) => {
                self.record_error(error);
                warn!(provider = %descriptor.id, error = %error, "health probe failed");
            }
        }
        if let Some(slot) = self.slots.get(&descriptor.id) {
            slot.update(|record| record.last_checked_at = Some(OffsetDateTime::now_utc()));
        }
        outcome
    }

    pub fn reset_hourly(&self) {
        for slot in self.slots.values() {
            slot.hourly.store(0, Ordering::Relaxed);
        }
        info!("hourly request counters reset");
    }

    pub fn reset_daily(&self) {
        for slot in self.slots.values() {
            slot.daily.store(0, Ordering::Relaxed);
        }
        info!("daily request counters reset");
    }
}
