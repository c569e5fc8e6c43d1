//! In-memory response cache with content-aware, market-hours-aware expiry.
//!
//! The TTL of an entry is fixed when it is written: volatile data types get
//! short lifetimes while the market trades and longer ones when it is closed.
//! Expired entries are rejected on read and removed by [`AdaptiveCache::sweep_expired`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::domain::{DataType, MarketPayload, Symbol};
use crate::market_hours::MarketSession;

const MINUTE: Duration = Duration::from_secs(60);

/// TTL for `data_type` written while the market is `market_open`.
pub fn ttl_for(data_type: DataType, market_open: bool) -> Duration {
    match (data_type, market_open) {
        (DataType::RealTime, true) => MINUTE,
        (DataType::RealTime, false) => 5 * MINUTE,
        (DataType::Price, true) => 2 * MINUTE,
        (DataType::Price, false) => 10 * MINUTE,
        (DataType::Fundamentals, _) => 60 * MINUTE,
        (DataType::Technical, _) => 15 * MINUTE,
        (DataType::News, _) => 30 * MINUTE,
        (DataType::Historical, _) => 24 * 60 * MINUTE,
        _ => 5 * MINUTE,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    symbol: Symbol,
    data_type: DataType,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Arc<MarketPayload>,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) < self.ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub market_open: bool,
}

/// Sharded cache keyed by `(symbol, data type)`.
#[derive(Debug)]
pub struct AdaptiveCache {
    entries: DashMap<CacheKey, CacheEntry>,
    session: Arc<dyn MarketSession>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AdaptiveCache {
    pub fn new(session: Arc<dyn MarketSession>) -> Self {
        Self {
            entries: DashMap::new(),
            session,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fresh entry for the key, or `None`.
    pub fn get(&self, symbol: &Symbol, data_type: DataType) -> Option<Arc<MarketPayload>> {
        let key = CacheKey {
            symbol: symbol.clone(),
            data_type,
        };
        let fresh = self
            .entries
            .get(&key)
            .filter(|entry| entry.is_fresh(Instant::now()))
            .map(|entry| Arc::clone(&entry.payload));

        match &fresh {
            Some(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(symbol = %symbol, data_type = %data_type, "cache hit");
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(symbol = %symbol, data_type = %data_type, "cache miss");
            }
        }
        fresh
    }

    /// Entry for the key even if its TTL has elapsed, as long as the sweeper
    /// has not removed it yet. Does not count as a hit or miss.
    pub fn get_stale(&self, symbol: &Symbol, data_type: DataType) -> Option<Arc<MarketPayload>> {
        let key = CacheKey {
            symbol: symbol.clone(),
            data_type,
        };
        self.entries
            .get(&key)
            .map(|entry| Arc::clone(&entry.payload))
    }

    /// Stores `payload` under its own symbol and data type. Returns the TTL chosen.
    pub fn put(&self, payload: Arc<MarketPayload>) -> Duration {
        let ttl = ttl_for(payload.data_type, self.session.is_open());
        let key = CacheKey {
            symbol: payload.symbol.clone(),
            data_type: payload.data_type,
        };
        debug!(
            symbol = %key.symbol,
            data_type = %key.data_type,
            ttl_secs = ttl.as_secs(),
            "cached response"
        );
        self.entries.insert(
            key,
            CacheEntry {
                payload,
                inserted_at: Instant::now(),
                ttl,
            },
        );
        ttl
    }

    pub fn evict(&self, symbol: &Symbol, data_type: DataType) -> bool {
        let key = CacheKey {
            symbol: symbol.clone(),
            data_type,
        };
        let removed = self.entries.remove(&key).is_some();
        if removed {
            info!(symbol = %symbol, data_type = %data_type, "cache entry evicted");
        }
        removed
    }

    /// Drops every entry. Returns how many were removed.
    pub fn clear_all(&self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        info!(removed, "cache cleared");
        removed
    }

    /// Removes entries whose TTL has elapsed. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            info!(removed, "expired cache entries swept");
        }
        removed
    }

    /// Invalidates everything cached before the session opened.
    pub fn flush_for_market_open(&self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        info!(removed, "market opened, cache flushed");
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn market_open(&self) -> bool {
        self.session.is_open()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            market_open: self.session.is_open(),
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::domain::OhlcvBar;
    use crate::market_hours::FixedSession;
    use crate::provider::ProviderId;

    fn payload(symbol: &str, data_type: DataType) -> Arc<MarketPayload> {
        let symbol = Symbol::parse(symbol).expect("valid symbol");
        let bar = OhlcvBar::new(
            symbol.clone(),
            datetime!(2024-01-02 15:00 UTC),
            10.0,
            11.0,
            9.0,
            10.5,
            1_000,
        )
        .expect("valid bar");
        Arc::new(MarketPayload {
            symbol,
            data_type,
            provider: ProviderId::from_static("polygon"),
            bars: vec![bar],
            retrieved_at: datetime!(2024-01-02 15:00 UTC),
        })
    }

    #[test]
    fn ttl_table_tracks_market_hours_for_volatile_types() {
        assert_eq!(ttl_for(DataType::RealTime, true), Duration::from_secs(60));
        assert_eq!(ttl_for(DataType::RealTime, false), Duration::from_secs(300));
        assert_eq!(ttl_for(DataType::Price, true), Duration::from_secs(120));
        assert_eq!(ttl_for(DataType::Price, false), Duration::from_secs(600));
        assert_eq!(ttl_for(DataType::Historical, true), ttl_for(DataType::Historical, false));
        assert_eq!(ttl_for(DataType::Options, true), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_miss_but_stay_until_swept() {
        let cache = AdaptiveCache::new(Arc::new(FixedSession(true)));
        let aapl = Symbol::parse("AAPL").expect("valid symbol");
        cache.put(payload("AAPL", DataType::RealTime));

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(cache.get(&aapl, DataType::RealTime).is_none());
        assert!(cache.get_stale(&aapl, DataType::RealTime).is_some());
        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.get_stale(&aapl, DataType::RealTime).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_fresh_entries() {
        let cache = AdaptiveCache::new(Arc::new(FixedSession(false)));
        cache.put(payload("AAPL", DataType::Price));
        cache.put(payload("MSFT", DataType::Fundamentals));

        tokio::time::advance(Duration::from_secs(11 * 60)).await;

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn keys_are_per_symbol_and_data_type() {
        let cache = AdaptiveCache::new(Arc::new(FixedSession(false)));
        let aapl = Symbol::parse("aapl").expect("valid symbol");
        cache.put(payload("AAPL", DataType::Price));

        assert!(cache.get(&aapl, DataType::Price).is_some());
        assert!(cache.get(&aapl, DataType::News).is_none());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
        assert!(!stats.market_open);
    }

    #[test]
    fn evict_and_flush_remove_entries() {
        let cache = AdaptiveCache::new(Arc::new(FixedSession(false)));
        let aapl = Symbol::parse("AAPL").expect("valid symbol");
        cache.put(payload("AAPL", DataType::Price));
        cache.put(payload("AAPL", DataType::News));

        assert!(cache.evict(&aapl, DataType::Price));
        assert!(!cache.evict(&aapl, DataType::Price));
        assert_eq!(cache.flush_for_market_open(), 1);
        assert!(cache.is_empty());
    }
}
