use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::{DataType, Symbol};
use crate::provider::ProviderId;
use crate::ValidationError;

/// One OHLCV observation handed to downstream analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub symbol: Symbol,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl OhlcvBar {
    pub fn new(
        symbol: Symbol,
        timestamp: OffsetDateTime,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: u64,
    ) -> Result<Self, ValidationError> {
        validate_price("open", open)?;
        validate_price("high", high)?;
        validate_price("low", low)?;
        validate_price("close", close)?;

        if high < low {
            return Err(ValidationError::InvalidBarRange);
        }
        if open < low || open > high || close < low || close > high {
            return Err(ValidationError::InvalidBarBounds);
        }

        Ok(Self {
            symbol,
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        })
    }
}

/// Normalized provider response stored in the cache and returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketPayload {
    pub symbol: Symbol,
    pub data_type: DataType,
    pub provider: ProviderId,
    pub bars: Vec<OhlcvBar>,
    #[serde(with = "time::serde::rfc3339")]
    pub retrieved_at: OffsetDateTime,
}

impl MarketPayload {
    pub fn latest(&self) -> Option<&OhlcvBar> {
        self.bars.iter().max_by_key(|bar| bar.timestamp)
    }
}

fn validate_price(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NonFiniteValue { field });
    }
    if value < 0.0 {
        return Err(ValidationError::NegativeValue { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn aapl() -> Symbol {
        Symbol::parse("AAPL").expect("valid symbol")
    }

    #[test]
    fn rejects_inverted_range() {
        let bar = OhlcvBar::new(aapl(), datetime!(2024-01-02 14:30 UTC), 10.0, 9.0, 11.0, 10.0, 1);
        assert_eq!(bar, Err(ValidationError::InvalidBarRange));
    }

    #[test]
    fn rejects_close_outside_bounds() {
        let bar = OhlcvBar::new(aapl(), datetime!(2024-01-02 14:30 UTC), 10.0, 11.0, 9.0, 12.0, 1);
        assert_eq!(bar, Err(ValidationError::InvalidBarBounds));
    }

    #[test]
    fn rejects_nan_prices() {
        let bar = OhlcvBar::new(aapl(), datetime!(2024-01-02 14:30 UTC), f64::NAN, 11.0, 9.0, 10.0, 1);
        assert_eq!(bar, Err(ValidationError::NonFiniteValue { field: "open" }));
    }

    #[test]
    fn latest_picks_newest_bar() {
        let older = OhlcvBar::new(aapl(), datetime!(2024-01-02 14:30 UTC), 10.0, 11.0, 9.0, 10.5, 100)
            .expect("valid bar");
        let newer = OhlcvBar::new(aapl(), datetime!(2024-01-03 14:30 UTC), 10.5, 12.0, 10.0, 11.5, 200)
            .expect("valid bar");
        let payload = MarketPayload {
            symbol: aapl(),
            data_type: DataType::Historical,
            provider: ProviderId::parse("polygon").expect("valid id"),
            bars: vec![newer.clone(), older],
            retrieved_at: datetime!(2024-01-03 15:00 UTC),
        };
        assert_eq!(payload.latest(), Some(&newer));
    }
}
