//! Vendor REST client for historical aggregates and snapshots

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use types::bar::{BarSource, MarketBar, Timespan};

#[derive(Debug, Error)]
pub enum VendorError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("upstream returned {status}: {detail}")]
    Status { status: u16, detail: String },
}

impl VendorError {
    /// Flatten to the detail string used for error classification.
    pub fn detail(&self) -> String {
        self.to_string()
    }
}

/// One aggregate row on the vendor wire. Timestamps are epoch values,
/// usually milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct AggRow {
    #[serde(rename = "t")]
    pub timestamp: f64,
    #[serde(rename = "o", default)]
    pub open: f64,
    #[serde(rename = "h", default)]
    pub high: f64,
    #[serde(rename = "l", default)]
    pub low: f64,
    #[serde(rename = "c", default)]
    pub close: f64,
    #[serde(rename = "v", default)]
    pub volume: f64,
    #[serde(rename = "vw", default)]
    pub vwap: Option<f64>,
    #[serde(rename = "n", default)]
    pub trades: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AggsResponse {
    #[serde(default)]
    results: Vec<AggRow>,
}

#[derive(Debug, Deserialize)]
struct SnapshotsResponse {
    #[serde(default)]
    tickers: Vec<Value>,
}

/// Vendor aggregates/snapshots API.
#[async_trait]
pub trait AggsClient: Send + Sync {
    async fn list_aggs(
        &self,
        ticker: &str,
        multiplier: u32,
        timespan: Timespan,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AggRow>, VendorError>;

    /// Raw snapshot payloads; the shape varies by vendor plan, so mapping
    /// to [`types::bar::MarketSnapshot`] is left to the caller.
    async fn list_snapshots(&self, tickers: &[String]) -> Result<Vec<Value>, VendorError>;
}

/// HTTP implementation of [`AggsClient`].
pub struct RestAggsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RestAggsClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl AggsClient for RestAggsClient {
    async fn list_aggs(
        &self,
        ticker: &str,
        multiplier: u32,
        timespan: Timespan,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AggRow>, VendorError> {
        let url = format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            self.base_url, ticker, multiplier, timespan, from, to,
        );
        debug!(%ticker, %timespan, multiplier, "fetching vendor aggregates");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[
                ("adjusted", "true"),
                ("sort", "asc"),
                ("limit", "50000"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(VendorError::Status {
                status: status.as_u16(),
                detail,
            });
        }

        let payload: AggsResponse = response.json().await?;
        Ok(payload.results)
    }

    async fn list_snapshots(&self, tickers: &[String]) -> Result<Vec<Value>, VendorError> {
        let url = format!(
            "{}/v2/snapshot/locale/us/markets/stocks/tickers",
            self.base_url,
        );
        let joined = tickers.join(",");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("tickers", joined.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(VendorError::Status {
                status: status.as_u16(),
                detail,
            });
        }

        let payload: SnapshotsResponse = response.json().await?;
        Ok(payload.tickers)
    }
}

/// Map vendor rows to bars, dropping rows whose timestamp cannot be read.
pub fn map_agg_rows(
    ticker: &str,
    timespan: Timespan,
    multiplier: u32,
    rows: &[AggRow],
) -> Vec<MarketBar> {
    rows.iter()
        .filter_map(|row| {
            let start_at = epoch_to_utc(row.timestamp)?;
            Some(MarketBar {
                ticker: ticker.to_string(),
                timespan,
                multiplier,
                start_at,
                end_at: None,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
                vwap: row.vwap,
                trades: row.trades,
                source: BarSource::Rest,
                is_final: true,
            })
        })
        .collect()
}

/// Interpret a numeric epoch as seconds, normalizing millisecond and
/// nanosecond inputs by magnitude.
pub fn epoch_to_utc(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let abs = value.abs();
    let seconds = if abs >= 10_000_000_000_000.0 {
        value / 1_000_000_000.0
    } else if abs >= 10_000_000_000.0 {
        value / 1_000.0
    } else {
        value
    };
    DateTime::<Utc>::from_timestamp_millis((seconds * 1_000.0) as i64)
}
