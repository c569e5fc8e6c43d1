use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::GatewayError;
use crate::provider::ProviderId;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Request budget for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Continuous refill rate; fractional values allow e.g. 5 requests per minute.
    pub requests_per_second: f64,
    /// Bucket capacity.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 1.0,
            burst: 1,
        }
    }
}

impl RateLimitConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if !(self.requests_per_second.is_finite() && self.requests_per_second > 0.0) {
            return Err(String::from("rate_limit.requests_per_second must be positive"));
        }
        if self.burst == 0 {
            return Err(String::from("rate_limit.burst must be positive"));
        }
        Ok(())
    }

    fn quota(&self) -> Quota {
        let burst = NonZeroU32::new(self.burst).unwrap_or(NonZeroU32::MIN);
        let period = Duration::from_secs_f64(1.0 / self.requests_per_second)
            .max(Duration::from_nanos(1));
        match Quota::with_period(period) {
            Some(quota) => quota.allow_burst(burst),
            None => Quota::per_second(burst),
        }
    }
}

/// Observability view of one provider's limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterState {
    pub requests_per_second: f64,
    pub burst: u32,
    pub registered: bool,
    pub granted: u64,
    pub denied: u64,
}

#[derive(Debug)]
struct LimiterSlot {
    config: RateLimitConfig,
    limiter: RwLock<Arc<DirectRateLimiter>>,
    granted: AtomicU64,
    denied: AtomicU64,
}

impl LimiterSlot {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            limiter: RwLock::new(Arc::new(RateLimiter::direct(config.quota()))),
            granted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    fn limiter(&self) -> Arc<DirectRateLimiter> {
        Arc::clone(
            &self
                .limiter
                .read()
                .expect("rate limiter slot lock is not poisoned"),
        )
    }
}

/// One token bucket per enabled provider.
///
/// Providers absent from the bank (unknown or disabled) never receive a permit.
#[derive(Debug, Default)]
pub struct RateLimiterBank {
    slots: BTreeMap<ProviderId, LimiterSlot>,
}

impl RateLimiterBank {
    pub fn new<'a>(providers: impl IntoIterator<Item = (&'a ProviderId, RateLimitConfig)>) -> Self {
        let slots = providers
            .into_iter()
            .map(|(id, config)| {
                info!(
                    provider = %id,
                    requests_per_second = config.requests_per_second,
                    burst = config.burst,
                    "rate limiter initialized"
                );
                (id.clone(), LimiterSlot::new(config))
            })
            .collect();
        Self { slots }
    }

    /// Takes one token if it is available right now. Never waits.
    pub fn try_acquire(&self, provider: &ProviderId) -> bool {
        let Some(slot) = self.slots.get(provider) else {
            return false;
        };

        let granted = slot.limiter().check().is_ok();
        if granted {
            slot.granted.fetch_add(1, Ordering::Relaxed);
        } else {
            slot.denied.fetch_add(1, Ordering::Relaxed);
            debug!(provider = %provider, "rate budget exhausted");
        }
        granted
    }

    /// Waits for a token and returns how long that took.
    pub async fn acquire(&self, provider: &ProviderId) -> Result<Duration, GatewayError> {
        let slot = self
            .slots
            .get(provider)
            .ok_or_else(|| GatewayError::InvalidProvider {
                provider: provider.to_string(),
            })?;

        let started = Instant::now();
        slot.limiter().until_ready().await;
        slot.granted.fetch_add(1, Ordering::Relaxed);

        let waited = started.elapsed();
        debug!(provider = %provider, waited_ms = waited.as_millis() as u64, "rate permit acquired");
        Ok(waited)
    }

    /// Waits at most `max_wait` for a token. `false` if none arrived in time
    /// or the provider has no limiter.
    pub async fn acquire_within(&self, provider: &ProviderId, max_wait: Duration) -> bool {
        match tokio::time::timeout(max_wait, self.acquire(provider)).await {
            Ok(acquired) => acquired.is_ok(),
            Err(_) => {
                if let Some(slot) = self.slots.get(provider) {
                    slot.denied.fetch_add(1, Ordering::Relaxed);
                }
                debug!(provider = %provider, max_wait_ms = max_wait.as_millis() as u64, "no rate permit in time");
                false
            }
        }
    }

    /// Configured refill rate, `0.0` for providers without a limiter.
    pub fn rate(&self, provider: &ProviderId) -> f64 {
        self.slots
            .get(provider)
            .map_or(0.0, |slot| slot.config.requests_per_second)
    }

    pub fn is_registered(&self, provider: &ProviderId) -> bool {
        self.slots.contains_key(provider)
    }

    /// Replaces the provider's bucket with a full one.
    pub fn reset(&self, provider: &ProviderId) -> Result<(), GatewayError> {
        let slot = self
            .slots
            .get(provider)
            .ok_or_else(|| GatewayError::InvalidProvider {
                provider: provider.to_string(),
            })?;

        *slot
            .limiter
            .write()
            .expect("rate limiter slot lock is not poisoned") =
            Arc::new(RateLimiter::direct(slot.config.quota()));
        info!(provider = %provider, "rate limiter reset");
        Ok(())
    }

    pub fn snapshot(&self) -> BTreeMap<ProviderId, RateLimiterState> {
        self.slots
            .iter()
            .map(|(id, slot)| {
                (
                    id.clone(),
                    RateLimiterState {
                        requests_per_second: slot.config.requests_per_second,
                        burst: slot.config.burst,
                        registered: true,
                        granted: slot.granted.load(Ordering::Relaxed),
                        denied: slot.denied.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}
