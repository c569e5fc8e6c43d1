//! Trading-session clock used for cache expiry, routing preferences and the
//! market-open cache flush.

use std::fmt::Debug;

use time::macros::format_description;
use time::{OffsetDateTime, Time, UtcOffset, Weekday};

use crate::config::MarketHoursConfig;
use crate::ValidationError;

/// Answers whether the market is currently trading.
pub trait MarketSession: Debug + Send + Sync {
    fn is_open_at(&self, at: OffsetDateTime) -> bool;

    fn is_open(&self) -> bool {
        self.is_open_at(OffsetDateTime::now_utc())
    }
}

/// Regular session between `open` and `close` local time at a fixed UTC offset.
///
/// The offset does not follow daylight saving; configure `-04:00` for summer
/// trading in New York.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketHours {
    open: Time,
    close: Time,
    offset: UtcOffset,
    weekdays_only: bool,
}

impl Default for MarketHours {
    fn default() -> Self {
        Self {
            open: time::macros::time!(09:30),
            close: time::macros::time!(16:00),
            offset: time::macros::offset!(-05:00),
            weekdays_only: true,
        }
    }
}

impl MarketHours {
    pub fn new(open: Time, close: Time, offset: UtcOffset, weekdays_only: bool) -> Self {
        Self {
            open,
            close,
            offset,
            weekdays_only,
        }
    }

    pub fn from_config(config: &MarketHoursConfig) -> Result<Self, ValidationError> {
        let clock = format_description!("[hour]:[minute]");
        let offset_format = format_description!("[offset_hour sign:mandatory]:[offset_minute]");

        let open = Time::parse(config.open.trim(), clock)
            .map_err(|error| invalid(format!("market_hours.open '{}': {error}", config.open)))?;
        let close = Time::parse(config.close.trim(), clock)
            .map_err(|error| invalid(format!("market_hours.close '{}': {error}", config.close)))?;
        let offset = UtcOffset::parse(config.utc_offset.trim(), offset_format).map_err(|error| {
            invalid(format!(
                "market_hours.utc_offset '{}': {error}",
                config.utc_offset
            ))
        })?;

        if open >= close {
            return Err(invalid(String::from(
                "market_hours.open must be earlier than market_hours.close",
            )));
        }

        Ok(Self::new(open, close, offset, config.weekdays_only))
    }
}

impl MarketSession for MarketHours {
    fn is_open_at(&self, at: OffsetDateTime) -> bool {
        let local = at.to_offset(self.offset);
        if self.weekdays_only && matches!(local.weekday(), Weekday::Saturday | Weekday::Sunday) {
            return false;
        }
        let now = local.time();
        now > self.open && now < self.close
    }
}

/// Session with a fixed answer, for tests and offline tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSession(pub bool);

impl MarketSession for FixedSession {
    fn is_open_at(&self, _at: OffsetDateTime) -> bool {
        self.0
    }
}

fn invalid(message: String) -> ValidationError {
    ValidationError::InvalidConfig { message }
}
