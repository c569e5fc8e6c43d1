//! Multi-factor provider selection.
//!
//! Only providers that are enabled and currently healthy are scored:
//!
//! | Factor | Weight | Source |
//! |--------|--------|--------|
//! | health | 0.40 | success rate, latency, recency, status |
//! | specialization | 0.25 | static table per data type, 0.5 when unknown |
//! | coverage | 0.15 | 1.0 when the region is covered, else 0.5 |
//! | time of day | 0.10 | fast providers while trading, cheap ones otherwise |
//! | cost | 0.10 | `max(0, 1 - cost * 100)` |
//!
//! Equal totals keep registry order (ascending priority, then id).

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::domain::{DataType, Symbol};
use crate::health::{HealthMonitor, HealthStatus, ProviderHealth};
use crate::market_hours::MarketSession;
use crate::provider::ProviderId;
use crate::registry::{ProviderDescriptor, ProviderRegistry};

const HEALTH_WEIGHT: f64 = 0.40;
const SPECIALIZATION_WEIGHT: f64 = 0.25;
const COVERAGE_WEIGHT: f64 = 0.15;
const TIME_OF_DAY_WEIGHT: f64 = 0.10;
const COST_WEIGHT: f64 = 0.10;

const NEUTRAL_SPECIALIZATION: f64 = 0.5;
const PARTIAL_COVERAGE: f64 = 0.5;
const LATENCY_CEILING_MS: f64 = 5_000.0;
const RECENCY_HORIZON_MINUTES: f64 = 60.0;

/// Score of one provider for one routing decision, with its components.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderScore {
    pub provider: ProviderId,
    pub total: f64,
    pub health: f64,
    pub specialization: f64,
    pub coverage: f64,
    pub time_of_day: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingRecommendation {
    pub symbol: Symbol,
    pub data_type: DataType,
    pub region: String,
    pub market_open: bool,
    pub recommended: Option<ProviderId>,
    /// Highest score first.
    pub ranked: Vec<ProviderScore>,
}

/// Ranks providers from live health data and the static descriptor tables.
#[derive(Debug, Clone)]
pub struct SmartRouter {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthMonitor>,
    session: Arc<dyn MarketSession>,
}

impl SmartRouter {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthMonitor>,
        session: Arc<dyn MarketSession>,
    ) -> Self {
        Self {
            registry,
            health,
            session,
        }
    }

    pub fn select_best_provider(
        &self,
        symbol: &Symbol,
        data_type: DataType,
        region: &str,
    ) -> Option<ProviderId> {
        let best = self
            .rank(symbol, data_type, region)
            .into_iter()
            .next()
            .map(|score| score.provider);

        match &best {
            Some(provider) => info!(
                provider = %provider,
                symbol = %symbol,
                data_type = %data_type,
                region,
                "provider selected"
            ),
            None => warn!(symbol = %symbol, data_type = %data_type, "no healthy provider to route to"),
        }
        best
    }

    pub fn recommendations(
        &self,
        symbol: &Symbol,
        data_type: DataType,
        region: &str,
    ) -> RoutingRecommendation {
        let ranked = self.rank(symbol, data_type, region);
        RoutingRecommendation {
            symbol: symbol.clone(),
            data_type,
            region: region.to_owned(),
            market_open: self.session.is_open(),
            recommended: ranked.first().map(|score| score.provider.clone()),
            ranked,
        }
    }

    /// Healthy, enabled providers ordered by descending score.
    pub fn rank(&self, symbol: &Symbol, data_type: DataType, region: &str) -> Vec<ProviderScore> {
        let now = OffsetDateTime::now_utc();
        let market_open = self.session.is_open_at(now);

        let mut scores: Vec<ProviderScore> = self
            .registry
            .enabled()
            .filter_map(|descriptor| {
                let health = self.health.health(&descriptor.id)?;
                health.is_healthy().then(|| {
                    score_provider(descriptor, &health, data_type, region, market_open, now)
                })
            })
            .collect();

        // Stable: equal totals keep registry order.
        scores.sort_by(|left, right| right.total.total_cmp(&left.total));

        for score in &scores {
            debug!(symbol = %symbol, provider = %score.provider, score = score.total, "provider scored");
        }
        scores
    }
}

pub fn score_provider(
    descriptor: &ProviderDescriptor,
    health: &ProviderHealth,
    data_type: DataType,
    region: &str,
    market_open: bool,
    now: OffsetDateTime,
) -> ProviderScore {
    let health_score = health_score(health, now);
    let specialization = descriptor
        .specialization(data_type)
        .unwrap_or(NEUTRAL_SPECIALIZATION);
    let coverage = if descriptor.covers(region) {
        1.0
    } else {
        PARTIAL_COVERAGE
    };
    let time_of_day = match (market_open, health.is_fast(), health.is_cost_effective()) {
        (true, true, _) => 1.0,
        (true, false, _) => 0.7,
        (false, _, true) => 1.0,
        (false, _, false) => 0.8,
    };
    let cost = (1.0 - descriptor.cost_per_request * 100.0).max(0.0);

    ProviderScore {
        provider: descriptor.id.clone(),
        total: HEALTH_WEIGHT * health_score
            + SPECIALIZATION_WEIGHT * specialization
            + COVERAGE_WEIGHT * coverage
            + TIME_OF_DAY_WEIGHT * time_of_day
            + COST_WEIGHT * cost,
        health: health_score,
        specialization,
        coverage,
        time_of_day,
        cost,
    }
}

/// Blend of success rate (0.4), latency (0.3), recency of the last success
/// (0.2) and a flat bonus for `HEALTHY` status (0.1), capped at 1.0.
pub fn health_score(health: &ProviderHealth, now: OffsetDateTime) -> f64 {
    let mut score = 0.4 * health.success_rate / 100.0;
    score += 0.3 * (1.0 - health.average_latency_ms / LATENCY_CEILING_MS).max(0.0);
    if let Some(last_success) = health.last_success_at {
        let minutes = (now - last_success).as_seconds_f64().max(0.0) / 60.0;
        score += 0.2 * (1.0 - minutes / RECENCY_HORIZON_MINUTES).max(0.0);
    }
    if health.status == HealthStatus::Healthy {
        score += 0.1;
    }
    score.min(1.0)
}
