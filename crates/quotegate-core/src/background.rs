//! Periodic tasks started with the gateway and stopped by its shutdown signal.
//!
//! | Task | Schedule |
//! |------|----------|
//! | health probes | `health.probe_interval_secs` |
//! | hourly/daily counter reset | top of every hour, daily at midnight UTC |
//! | cache sweep | `cache.sweep_interval_secs` |
//! | market-open flush | `cache.market_check_interval_secs` |
//! | prefetch of popular symbols | `cache.prefetch_interval_secs`, market closed only |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::orchestrator::Gateway;

pub(crate) fn spawn_all(
    gateway: &Arc<Gateway>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let tasks = vec![
        tokio::spawn(probe_providers(Arc::clone(gateway), shutdown.clone())),
        tokio::spawn(reset_counters(Arc::clone(gateway), shutdown.clone())),
        tokio::spawn(sweep_cache(Arc::clone(gateway), shutdown.clone())),
        tokio::spawn(watch_market_open(Arc::clone(gateway), shutdown.clone())),
        tokio::spawn(prefetch_popular(Arc::clone(gateway), shutdown)),
    ];
    info!(tasks = tasks.len(), "background tasks started");
    tasks
}

/// Runs `tick` on every interval tick until shutdown is signalled.
async fn every<F, Fut>(mut ticker: Interval, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => tick().await,
        }
    }
}

/// First tick after one full period.
fn delayed_interval(period: Duration) -> Interval {
    tokio::time::interval_at(tokio::time::Instant::now() + period, period)
}

async fn probe_providers(gateway: Arc<Gateway>, shutdown: watch::Receiver<bool>) {
    let period = gateway.config().health.probe_interval();
    let timeout = gateway.config().health.probe_timeout();
    // Probe right away so the router has scored candidates early.
    every(tokio::time::interval(period), shutdown, || {
        let gateway = Arc::clone(&gateway);
        async move {
            for descriptor in gateway.registry().enabled() {
                let _ = gateway
                    .health()
                    .probe(gateway.upstream(), descriptor, gateway.probe_symbol(), timeout)
                    .await;
            }
            debug!("health probe round finished");
        }
    })
    .await;
}

async fn reset_counters(gateway: Arc<Gateway>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let now = OffsetDateTime::now_utc();
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(until_next_hour(now)) => {
                gateway.health().reset_hourly();
                if OffsetDateTime::now_utc().hour() == 0 {
                    gateway.health().reset_daily();
                }
            }
        }
    }
}

fn until_next_hour(now: OffsetDateTime) -> Duration {
    let into_hour = u64::from(now.minute()) * 60 + u64::from(now.second());
    Duration::from_secs(3_600 - into_hour)
}

async fn sweep_cache(gateway: Arc<Gateway>, shutdown: watch::Receiver<bool>) {
    let period = gateway.config().cache.sweep_interval();
    every(delayed_interval(period), shutdown, || {
        gateway.cache().sweep_expired();
        async {}
    })
    .await;
}

async fn watch_market_open(gateway: Arc<Gateway>, shutdown: watch::Receiver<bool>) {
    let period = gateway.config().cache.market_check_interval();
    let mut was_open = gateway.session().is_open();
    every(delayed_interval(period), shutdown, || {
        let open = gateway.session().is_open();
        if open && !was_open {
            gateway.cache().flush_for_market_open();
        }
        was_open = open;
        async {}
    })
    .await;
}

async fn prefetch_popular(gateway: Arc<Gateway>, shutdown: watch::Receiver<bool>) {
    let period = gateway.config().cache.prefetch_interval();
    let jitter = gateway.config().cache.prefetch_jitter();
    let data_types = gateway.config().cache.prefetch_data_types.clone();
    let stop = shutdown.clone();

    every(delayed_interval(period), shutdown, || {
        let gateway = Arc::clone(&gateway);
        let data_types = data_types.clone();
        let stop = stop.clone();
        async move {
            if gateway.session().is_open() {
                debug!("market open, prefetch skipped");
                return;
            }
            let mut warmers = JoinSet::new();
            for symbol in gateway.popular_symbols().to_vec() {
                let gateway = Arc::clone(&gateway);
                let data_types = data_types.clone();
                let mut stop = stop.clone();
                let delay = stagger(jitter);
                warmers.spawn(async move {
                    tokio::select! {
                        _ = stop.changed() => {}
                        _ = tokio::time::sleep(delay) => {
                            gateway.warm(&symbol, &data_types).await;
                        }
                    }
                });
            }
            while warmers.join_next().await.is_some() {}
            info!("popular symbols prefetched");
        }
    })
    .await;
}

fn stagger(jitter: Duration) -> Duration {
    let millis = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(fastrand::u64(0..=millis))
}
