use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::provider::ProviderId;

/// Runtime circuit state for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker thresholds and timers, as configured per provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Percentage of failed calls in the window that opens the circuit.
    pub failure_rate_threshold: f64,
    pub sliding_window_size: u32,
    pub minimum_number_of_calls: u32,
    pub wait_duration_in_open_state_ms: u64,
    pub permitted_calls_in_half_open_state: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            sliding_window_size: 10,
            minimum_number_of_calls: 5,
            wait_duration_in_open_state_ms: 30_000,
            permitted_calls_in_half_open_state: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn wait_duration(&self) -> Duration {
        Duration::from_millis(self.wait_duration_in_open_state_ms)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            return Err(String::from(
                "circuit_breaker.failure_rate_threshold must be in (0, 100]",
            ));
        }
        if self.sliding_window_size == 0 || self.minimum_number_of_calls == 0 {
            return Err(String::from(
                "circuit_breaker window and minimum calls must be positive",
            ));
        }
        if self.minimum_number_of_calls > self.sliding_window_size {
            return Err(String::from(
                "circuit_breaker.minimum_number_of_calls cannot exceed sliding_window_size",
            ));
        }
        if self.permitted_calls_in_half_open_state == 0 {
            return Err(String::from(
                "circuit_breaker.permitted_calls_in_half_open_state must be positive",
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of one breaker for the admin surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// Failure percentage over the window; `None` until the minimum call count is reached.
    pub failure_rate: Option<f64>,
    pub successful_calls: u32,
    pub failed_calls: u32,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    /// Most recent outcomes, `true` for a failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_issued: u32,
    half_open_succeeded: u32,
    /// Bumped on every transition so permits from an older state are ignored.
    epoch: u64,
}

impl CircuitInner {
    fn failures(&self) -> u32 {
        self.window.iter().filter(|failed| **failed).count() as u32
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        f64::from(self.failures()) * 100.0 / self.window.len() as f64
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.epoch = self.epoch.wrapping_add(1);
        self.half_open_issued = 0;
        self.half_open_succeeded = 0;
        match to {
            CircuitState::Open => self.opened_at = Some(Instant::now()),
            CircuitState::HalfOpen => self.opened_at = None,
            CircuitState::Closed => {
                self.opened_at = None;
                self.window.clear();
            }
        }
    }
}

/// Count-based sliding-window circuit breaker shared by every worker.
///
/// `CLOSED -> OPEN` once at least `minimum_number_of_calls` outcomes are in the
/// window and the failure rate reaches the threshold. `OPEN -> HALF_OPEN` only
/// when a caller asks for permission after the cool-down. In `HALF_OPEN` a
/// trial failure reopens the circuit and the circuit closes once every
/// permitted trial call has succeeded.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: ProviderId,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(provider: ProviderId, config: CircuitBreakerConfig) -> Self {
        Self {
            provider,
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(config.sliding_window_size as usize),
                opened_at: None,
                half_open_issued: 0,
                half_open_succeeded: 0,
                epoch: 0,
            }),
        }
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Asks to place one call. `None` means the call must be short-circuited.
    ///
    /// Dropping the permit without recording an outcome hands a half-open
    /// trial slot back.
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");

        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_some_and(|opened_at| opened_at.elapsed() >= self.config.wait_duration());
                if !cooled_down {
                    return None;
                }
                inner.transition(CircuitState::HalfOpen);
                info!(provider = %self.provider, "circuit half-open, admitting trial calls");
                inner.half_open_issued = 1;
            }
            CircuitState::HalfOpen => {
                if inner.half_open_issued >= self.config.permitted_calls_in_half_open_state {
                    return None;
                }
                inner.half_open_issued += 1;
            }
        }

        Some(CallPermit {
            breaker: self,
            epoch: inner.epoch,
            settled: false,
        })
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .expect("circuit breaker lock is not poisoned")
            .state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        let failed_calls = inner.failures();
        let evaluated = inner.window.len() >= self.config.minimum_number_of_calls as usize;
        CircuitBreakerMetrics {
            state: inner.state,
            failure_rate: evaluated.then(|| inner.failure_rate()),
            successful_calls: inner.window.len() as u32 - failed_calls,
            failed_calls,
        }
    }

    fn record(&self, epoch: u64, failed: bool) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");

        match inner.state {
            CircuitState::Closed => {
                if inner.window.len() == self.config.sliding_window_size as usize {
                    inner.window.pop_front();
                }
                inner.window.push_back(failed);

                let evaluated = inner.window.len() >= self.config.minimum_number_of_calls as usize;
                let failure_rate = inner.failure_rate();
                if evaluated && failure_rate >= self.config.failure_rate_threshold {
                    inner.transition(CircuitState::Open);
                    warn!(
                        provider = %self.provider,
                        failure_rate,
                        cool_down_ms = self.config.wait_duration_in_open_state_ms,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen if inner.epoch == epoch => {
                if failed {
                    inner.transition(CircuitState::Open);
                    warn!(provider = %self.provider, "trial call failed, circuit reopened");
                } else {
                    inner.half_open_succeeded += 1;
                    if inner.half_open_succeeded >= self.config.permitted_calls_in_half_open_state {
                        inner.transition(CircuitState::Closed);
                        info!(provider = %self.provider, "circuit closed");
                    }
                }
            }
            // Outcomes of calls admitted before the last transition.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn release(&self, epoch: u64) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");
        if inner.state == CircuitState::HalfOpen && inner.epoch == epoch {
            inner.half_open_issued = inner.half_open_issued.saturating_sub(1);
        }
    }
}

/// Permission to place one guarded call. Record the outcome with
/// [`CallPermit::success`] or [`CallPermit::failure`].
#[derive(Debug)]
#[must_use = "an unused permit is released on drop"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record(self.epoch, false);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record(self.epoch, true);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.epoch);
        }
    }
}

/// One breaker per provider, created at startup.
#[derive(Debug, Default)]
pub struct CircuitBreakerBank {
    breakers: BTreeMap<ProviderId, CircuitBreaker>,
}

impl CircuitBreakerBank {
    pub fn new<'a>(providers: impl IntoIterator<Item = (&'a ProviderId, CircuitBreakerConfig)>) -> Self {
        Self {
            breakers: providers
                .into_iter()
                .map(|(id, config)| (id.clone(), CircuitBreaker::new(id.clone(), config)))
                .collect(),
        }
    }

    pub fn get(&self, provider: &ProviderId) -> Option<&CircuitBreaker> {
        self.breakers.get(provider)
    }

    pub fn snapshot(&self) -> BTreeMap<ProviderId, CircuitBreakerMetrics> {
        self.breakers
            .iter()
            .map(|(id, breaker)| (id.clone(), breaker.metrics()))
            .collect()
    }

    pub fn open_circuits(&self) -> Vec<ProviderId> {
        self.breakers
            .iter()
            .filter(|(_, breaker)| breaker.state() == CircuitState::Open)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new(ProviderId::parse("alpha-vantage").expect("valid id"), config)
    }

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_rate_threshold: 50.0,
            sliding_window_size: 4,
            minimum_number_of_calls: 4,
            wait_duration_in_open_state_ms: 1_000,
            permitted_calls_in_half_open_state: 2,
        }
    }

    fn fail(breaker: &CircuitBreaker) {
        breaker.try_acquire().expect("permitted").failure();
    }

    fn succeed(breaker: &CircuitBreaker) {
        breaker.try_acquire().expect("permitted").success();
    }

    #[tokio::test(start_paused = true)]
    async fn stays_closed_below_minimum_calls() {
        let breaker = breaker(config());
        fail(&breaker);
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().failure_rate, None);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_short_circuits() {
        let breaker = breaker(config());
        succeed(&breaker);
        succeed(&breaker);
        fail(&breaker);
        fail(&breaker);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_over_old_outcomes() {
        let breaker = breaker(config());
        fail(&breaker);
        succeed(&breaker);
        succeed(&breaker);
        succeed(&breaker);
        succeed(&breaker);

        let metrics = breaker.metrics();
        assert_eq!(metrics.failed_calls, 0);
        assert_eq!(metrics.successful_calls, 4);
        assert_eq!(metrics.failure_rate, Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn half_opens_only_after_cool_down_then_closes_on_trials() {
        let breaker = breaker(config());
        for _ in 0..4 {
            fail(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(breaker.try_acquire().is_none());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        let first = breaker.try_acquire().expect("first trial");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let second = breaker.try_acquire().expect("second trial");
        assert!(breaker.try_acquire().is_none(), "only two trials permitted");

        first.success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        second.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_failure_reopens() {
        let breaker = breaker(config());
        for _ in 0..4 {
            fail(&breaker);
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_permit_returns_trial_slot() {
        let breaker = breaker(CircuitBreakerConfig {
            permitted_calls_in_half_open_state: 1,
            ..config()
        });
        for _ in 0..4 {
            fail(&breaker);
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        drop(breaker.try_acquire().expect("trial"));
        assert!(breaker.try_acquire().is_some());
    }

    #[test]
    fn rejects_minimum_calls_above_window() {
        let invalid = CircuitBreakerConfig {
            minimum_number_of_calls: 11,
            ..CircuitBreakerConfig::default()
        };
        assert!(invalid.validate().is_err());
        assert!(CircuitBreakerConfig::default().validate().is_ok());
    }
}
