//! Provider calls: URL rendering, timeout, status check and response parsing.
//!
//! Each provider answers with its own JSON shape; [`ResponseFormat`] selects
//! the parser that turns it into [`OhlcvBar`]s. A body that cannot be parsed
//! is reported as an [`UpstreamError`] exactly like a network failure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{DataType, MarketPayload, OhlcvBar, Symbol};
use crate::error::UpstreamError;
use crate::http_client::{HttpClient, HttpRequest};
use crate::registry::ProviderDescriptor;

/// JSON layout a provider responds with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    YahooChart,
    AlphaVantageDaily,
    TwelveDataSeries,
    PolygonAggregates,
    /// `[{"timestamp": "...", "open": .., ...}]` or `{"bars": [...]}`.
    #[default]
    OhlcvJson,
}

/// Result of a successful (2xx) provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Data(MarketPayload),
    /// The provider answered but had nothing for this symbol.
    NoContent,
}

/// Issues data and probe requests against provider descriptors.
#[derive(Clone)]
pub struct UpstreamClient {
    http: Arc<dyn HttpClient>,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient").finish_non_exhaustive()
    }
}

impl UpstreamClient {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self { http }
    }

    pub async fn fetch(
        &self,
        provider: &ProviderDescriptor,
        symbol: &Symbol,
        data_type: DataType,
    ) -> Result<Fetched, UpstreamError> {
        let url = provider.request_url(symbol, data_type);
        let body = self.get(provider, url, provider.timeout).await?;

        let bars = parse_bars(provider.response_format, symbol, &body)
            .map_err(|message| UpstreamError::parse(provider.id.clone(), message))?;
        if bars.is_empty() {
            debug!(provider = %provider.id, symbol = %symbol, "provider returned no bars");
            return Ok(Fetched::NoContent);
        }

        Ok(Fetched::Data(MarketPayload {
            symbol: symbol.clone(),
            data_type,
            provider: provider.id.clone(),
            bars,
            retrieved_at: OffsetDateTime::now_utc(),
        }))
    }

    /// Lightweight health request. Returns the observed latency.
    pub async fn probe(
        &self,
        provider: &ProviderDescriptor,
        probe_symbol: &Symbol,
        timeout: Duration,
    ) -> Result<Duration, UpstreamError> {
        let started = Instant::now();
        self.get(provider, provider.health_url(probe_symbol), timeout)
            .await?;
        Ok(started.elapsed())
    }

    async fn get(
        &self,
        provider: &ProviderDescriptor,
        url: String,
        timeout: Duration,
    ) -> Result<String, UpstreamError> {
        let request = HttpRequest::get(url).with_timeout(timeout);
        let response = tokio::time::timeout(timeout, self.http.execute(request))
            .await
            .map_err(|_| UpstreamError::timeout(provider.id.clone(), timeout))?
            .map_err(|error| {
                if error.is_timeout() {
                    UpstreamError::timeout(provider.id.clone(), timeout)
                } else {
                    UpstreamError::transport(provider.id.clone(), error.message())
                }
            })?;

        if !response.is_success() {
            return Err(UpstreamError::status(provider.id.clone(), response.status));
        }
        Ok(response.body)
    }
}

/// Parses a 2xx body. An empty body, `null`, `{}` or `[]` yields no bars.
pub fn parse_bars(
    format: ResponseFormat,
    symbol: &Symbol,
    body: &str,
) -> Result<Vec<OhlcvBar>, String> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value =
        serde_json::from_str(body).map_err(|error| format!("invalid JSON body: {error}"))?;
    let is_blank = match &value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    };
    if is_blank {
        return Ok(Vec::new());
    }

    match format {
        ResponseFormat::YahooChart => parse_yahoo_chart(symbol, value),
        ResponseFormat::AlphaVantageDaily => parse_alpha_vantage(symbol, value),
        ResponseFormat::TwelveDataSeries => parse_twelve_data(symbol, value),
        ResponseFormat::PolygonAggregates => parse_polygon(symbol, value),
        ResponseFormat::OhlcvJson => parse_ohlcv_json(value),
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value, what: &str) -> Result<T, String> {
    serde_json::from_value(value).map_err(|error| format!("unexpected {what} shape: {error}"))
}

fn bar(
    symbol: &Symbol,
    timestamp: OffsetDateTime,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
) -> Result<OhlcvBar, String> {
    let volume = if volume.is_finite() && volume > 0.0 {
        volume.round() as u64
    } else {
        0
    };
    OhlcvBar::new(symbol.clone(), timestamp, open, high, low, close, volume)
        .map_err(|error| format!("invalid bar at {timestamp}: {error}"))
}

#[derive(Debug, Deserialize)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Debug, Deserialize)]
struct YahooChart {
    #[serde(default)]
    result: Option<Vec<YahooChartResult>>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct YahooChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: YahooIndicators,
}

#[derive(Debug, Deserialize)]
struct YahooIndicators {
    quote: Vec<YahooQuote>,
}

#[derive(Debug, Deserialize)]
struct YahooQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

fn parse_yahoo_chart(symbol: &Symbol, value: Value) -> Result<Vec<OhlcvBar>, String> {
    let response: YahooChartResponse = decode(value, "yahoo chart")?;
    if let Some(error) = response.chart.error.filter(|error| !error.is_null()) {
        return Err(format!("yahoo chart error: {error}"));
    }

    let Some(result) = response.chart.result.and_then(|results| results.into_iter().next()) else {
        return Ok(Vec::new());
    };
    let Some(quote) = result.indicators.quote.first() else {
        return Ok(Vec::new());
    };

    let mut bars = Vec::with_capacity(result.timestamp.len());
    for (i, ts) in result.timestamp.iter().enumerate() {
        // Yahoo pads halted intervals with nulls.
        let (Some(Some(open)), Some(Some(high)), Some(Some(low)), Some(Some(close))) = (
            quote.open.get(i),
            quote.high.get(i),
            quote.low.get(i),
            quote.close.get(i),
        ) else {
            continue;
        };
        let timestamp = OffsetDateTime::from_unix_timestamp(*ts)
            .map_err(|error| format!("invalid yahoo timestamp {ts}: {error}"))?;
        let volume = quote.volume.get(i).copied().flatten().unwrap_or(0.0);
        bars.push(bar(symbol, timestamp, *open, *high, *low, *close, volume)?);
    }
    Ok(bars)
}

#[derive(Debug, Deserialize)]
struct AlphaVantageDaily {
    #[serde(rename = "Time Series (Daily)", default)]
    series: Option<BTreeMap<String, AlphaVantageBar>>,
    #[serde(rename = "Error Message", default)]
    error: Option<String>,
    #[serde(rename = "Note", default)]
    note: Option<String>,
    #[serde(rename = "Information", default)]
    information: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlphaVantageBar {
    #[serde(rename = "1. open")]
    open: String,
    #[serde(rename = "2. high")]
    high: String,
    #[serde(rename = "3. low")]
    low: String,
    #[serde(rename = "4. close")]
    close: String,
    #[serde(rename = "5. volume")]
    volume: String,
}

fn parse_alpha_vantage(symbol: &Symbol, value: Value) -> Result<Vec<OhlcvBar>, String> {
    let response: AlphaVantageDaily = decode(value, "alpha vantage")?;
    if let Some(message) = response.error.or(response.note).or(response.information) {
        return Err(format!("alpha vantage refused request: {message}"));
    }

    response
        .series
        .unwrap_or_default()
        .iter()
        .map(|(day, row)| {
            bar(
                symbol,
                parse_timestamp(day)?,
                number(&row.open)?,
                number(&row.high)?,
                number(&row.low)?,
                number(&row.close)?,
                number(&row.volume)?,
            )
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct TwelveDataSeries {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    values: Vec<TwelveDataBar>,
}

#[derive(Debug, Deserialize)]
struct TwelveDataBar {
    datetime: String,
    open: String,
    high: String,
    low: String,
    close: String,
    #[serde(default)]
    volume: Option<String>,
}

fn parse_twelve_data(symbol: &Symbol, value: Value) -> Result<Vec<OhlcvBar>, String> {
    let response: TwelveDataSeries = decode(value, "twelve data")?;
    if response.status.as_deref() == Some("error") {
        return Err(format!(
            "twelve data error: {}",
            response.message.unwrap_or_default()
        ));
    }

    response
        .values
        .iter()
        .map(|row| {
            let volume = match &row.volume {
                Some(volume) => number(volume)?,
                None => 0.0,
            };
            bar(
                symbol,
                parse_timestamp(&row.datetime)?,
                number(&row.open)?,
                number(&row.high)?,
                number(&row.low)?,
                number(&row.close)?,
                volume,
            )
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct PolygonAggregates {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    results: Vec<PolygonBar>,
}

#[derive(Debug, Deserialize)]
struct PolygonBar {
    /// Unix milliseconds.
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    #[serde(default)]
    v: f64,
}

fn parse_polygon(symbol: &Symbol, value: Value) -> Result<Vec<OhlcvBar>, String> {
    let response: PolygonAggregates = decode(value, "polygon")?;
    if response.status.as_deref() == Some("ERROR") {
        return Err(format!(
            "polygon error: {}",
            response.error.unwrap_or_default()
        ));
    }

    response
        .results
        .iter()
        .map(|row| {
            let timestamp =
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(row.t) * 1_000_000)
                    .map_err(|error| format!("invalid polygon timestamp {}: {error}", row.t))?;
            bar(symbol, timestamp, row.o, row.h, row.l, row.c, row.v)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OhlcvDocument {
    Bars(Vec<OhlcvBar>),
    Wrapped { bars: Vec<OhlcvBar> },
}

fn parse_ohlcv_json(value: Value) -> Result<Vec<OhlcvBar>, String> {
    let bars = match decode::<OhlcvDocument>(value, "ohlcv")? {
        OhlcvDocument::Bars(bars) | OhlcvDocument::Wrapped { bars } => bars,
    };
    bars.into_iter()
        .map(|raw| {
            OhlcvBar::new(
                raw.symbol,
                raw.timestamp,
                raw.open,
                raw.high,
                raw.low,
                raw.close,
                raw.volume,
            )
            .map_err(|error| format!("invalid bar: {error}"))
        })
        .collect()
}

fn number(raw: &str) -> Result<f64, String> {
    raw.trim()
        .parse::<f64>()
        .map_err(|error| format!("invalid number '{raw}': {error}"))
}

/// Accepts `YYYY-MM-DD` (midnight UTC) and `YYYY-MM-DD HH:MM:SS` (UTC).
fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, String> {
    let raw = raw.trim();
    let date_time = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    if let Ok(parsed) = PrimitiveDateTime::parse(raw, date_time) {
        return Ok(parsed.assume_utc());
    }
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .map(|date| date.midnight().assume_utc())
        .map_err(|error| format!("invalid date '{raw}': {error}"))
}
