use crate::error::{LevelsError, LevelsResult};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone};
use chrono_tz::{Tz, US::Eastern};
use serde::Deserialize;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

/// A single 5-minute bar, stamped in US/Eastern time.
#[derive(Debug, Clone, PartialEq)]
pub struct IntradayBar {
    pub timestamp: DateTime<Tz>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Anything that can hand back intraday bars for a date range.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_intraday_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> LevelsResult<Vec<IntradayBar>>;
}

#[derive(Debug, Deserialize)]
struct PolygonAggregatesResponse {
    status: Option<String>,
    #[serde(rename = "resultsCount")]
    results_count: Option<i64>,
    results: Option<Vec<PolygonAggregate>>,
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PolygonAggregate {
    #[serde(rename = "t")]
    timestamp: i64, // Unix milliseconds
    #[serde(rename = "o")]
    open: f64,
    #[serde(rename = "h")]
    high: f64,
    #[serde(rename = "l")]
    low: f64,
    #[serde(rename = "c")]
    close: f64,
    #[serde(rename = "v")]
    volume: f64, // Polygon sometimes returns volume as float
}

/// Client for the Polygon.io aggregates endpoint.
///
/// SPY is used as the proxy for SPX. Bars are requested at 5-minute resolution,
/// adjusted and sorted ascending. The free tier answers with a `DELAYED` status,
/// which is accepted the same as `OK`.
pub struct PolygonClient {
    api_key: String,
    base_url: String,
    max_retries: usize,
    backoff_base_ms: u64,
    client: reqwest::Client,
}

impl PolygonClient {
    /// Creates a new Polygon client.
    ///
    /// # Arguments
    /// * `api_key`: Polygon API key, sent as the `apiKey` query parameter
    /// * `base_url`: REST root without a trailing slash, e.g. `https://api.polygon.io`
    /// * `max_retries`: Extra attempts after a network error, 429 or 5xx response
    ///
    /// # Returns
    /// A client that backs off exponentially from 500ms, capped at 10s per wait
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, max_retries: usize) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            max_retries,
            backoff_base_ms: 500,
            client: reqwest::Client::new(),
        }
    }

    fn aggregates_url(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> String {
        format!(
            "{}/v2/aggs/ticker/{}/range/5/minute/{}/{}",
            self.base_url, symbol, start, end
        )
    }

    async fn fetch_once(&self, url: &str) -> LevelsResult<Vec<IntradayBar>> {
        let response = self
            .client
            .get(url)
            .query(&[
                ("apiKey", self.api_key.as_str()),
                ("adjusted", "true"),
                ("sort", "asc"),
                ("limit", "50000"),
            ])
            .send()
            .await?;

        let status = response.status();
        tracing::info!(status_code = status.as_u16(), "Polygon response received");

        let body = response.text().await?;

        if status.as_u16() == 429 || status.is_server_error() {
            return Err(LevelsError::api_error(status.as_u16(), snippet(&body)));
        }

        match parse_aggregates_response(status.as_u16(), &body) {
            Err(LevelsError::Parse { .. }) if !status.is_success() => {
                Err(LevelsError::api_error(status.as_u16(), snippet(&body)))
            }
            other => other,
        }
    }
}

#[async_trait]
impl MarketDataSource for PolygonClient {
    async fn fetch_intraday_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> LevelsResult<Vec<IntradayBar>> {
        let url = self.aggregates_url(symbol, start, end);
        tracing::info!(%symbol, %start, %end, "Fetching 5-minute bars");

        let retry_strategy = ExponentialBackoff::from_millis(self.backoff_base_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries);

        RetryIf::start(
            retry_strategy,
            || self.fetch_once(&url),
            |e: &LevelsError| {
                let retry = e.is_retryable();
                if retry {
                    tracing::warn!("Retryable fetch error: {}", e);
                }
                retry
            },
        )
        .await
    }
}

/// Parses a Polygon aggregates body into Eastern-time bars.
///
/// Only `OK` and `DELAYED` statuses are treated as data. Any other status becomes
/// an API error carrying Polygon's `error` or `message` text. A body without
/// results yields an empty vector.
pub fn parse_aggregates_response(status_code: u16, body: &str) -> LevelsResult<Vec<IntradayBar>> {
    let response: PolygonAggregatesResponse = serde_json::from_str(body)
        .map_err(|e| LevelsError::parse_error(format!("invalid aggregates body: {}", e)))?;

    let status = response.status.as_deref().unwrap_or("No status");
    tracing::info!(
        status,
        results_count = response.results_count.unwrap_or(0),
        "Polygon aggregates status"
    );

    if !matches!(status, "OK" | "DELAYED") {
        let message = response
            .error
            .or(response.message)
            .unwrap_or_else(|| format!("Unexpected status: {}", status));
        return Err(LevelsError::api_error(status_code, message));
    }

    let results = match response.results {
        Some(results) if !results.is_empty() => results,
        _ => {
            tracing::warn!("No results in API response");
            return Ok(Vec::new());
        }
    };

    let mut bars = Vec::with_capacity(results.len());
    for aggregate in results {
        let timestamp = Eastern
            .timestamp_millis_opt(aggregate.timestamp)
            .single()
            .ok_or_else(|| {
                LevelsError::parse_error(format!("invalid bar timestamp {}", aggregate.timestamp))
            })?;

        bars.push(IntradayBar {
            timestamp,
            open: aggregate.open,
            high: aggregate.high,
            low: aggregate.low,
            close: aggregate.close,
            volume: aggregate.volume.max(0.0) as u64,
        });
    }

    tracing::info!("Successfully fetched {} data points", bars.len());
    Ok(bars)
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}
