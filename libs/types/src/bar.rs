//! OHLCV market bar types
//!
//! A `MarketBar` is one aggregation bucket for one ticker: the baseline
//! tiers store day and minute bars keyed by `(ticker, start_at)`, the
//! minute-aggregate tier stores 5/15/60-minute buckets keyed by
//! `(ticker, multiplier, start_at)` and carries the bucket end plus a
//! finality flag. A bar is mutable only while its bucket is still open;
//! once `is_final` is set the row must not change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bar timespan supported by the storage tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timespan {
    Minute,
    Day,
}

impl Timespan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timespan::Minute => "minute",
            Timespan::Day => "day",
        }
    }

    /// Parse a normalized (trimmed, lowercased) timespan string.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "minute" => Some(Timespan::Minute),
            "day" => Some(Timespan::Day),
            _ => None,
        }
    }
}

impl fmt::Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance tag recording where a bar (or bar set) came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarSource {
    /// Fetched from the vendor REST aggregates endpoint.
    #[serde(rename = "REST")]
    Rest,
    /// Served from a baseline storage tier.
    #[serde(rename = "DB")]
    Db,
    /// Served from the precomputed minute-aggregate tier.
    #[serde(rename = "DB_AGG")]
    DbAgg,
    /// Finalized aggregate rows spliced with the currently open bucket.
    #[serde(rename = "DB_AGG_MIXED")]
    DbAggMixed,
    /// Produced by the live websocket feed.
    #[serde(rename = "WS")]
    Ws,
}

impl BarSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarSource::Rest => "REST",
            BarSource::Db => "DB",
            BarSource::DbAgg => "DB_AGG",
            BarSource::DbAggMixed => "DB_AGG_MIXED",
            BarSource::Ws => "WS",
        }
    }
}

impl fmt::Display for BarSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single OHLCV bar.
///
/// Prices and volume are `f64` to match the vendor wire format; `end_at`
/// and `is_final` are only meaningful for aggregate buckets (baseline day
/// and minute rows are final by construction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketBar {
    pub ticker: String,
    pub timespan: Timespan,
    pub multiplier: u32,
    /// Bucket start, UTC.
    pub start_at: DateTime<Utc>,
    /// Bucket end, UTC. Present on aggregate buckets only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vwap: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trades: Option<u64>,
    pub source: BarSource,
    /// Whether the bucket this bar covers has closed.
    #[serde(default = "default_final")]
    pub is_final: bool,
}

fn default_final() -> bool {
    true
}

impl MarketBar {
    /// Validate OHLC integrity: the high must dominate open/close and the
    /// low must be dominated by them, and volume cannot be negative.
    pub fn is_valid(&self) -> bool {
        self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
            && self.high >= self.low
            && self.volume >= 0.0
    }
}

/// A point-in-time market snapshot for one ticker, mapped from the loose
/// vendor snapshot payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub ticker: String,
    pub last: f64,
    pub change: f64,
    pub change_pct: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume: u64,
    pub updated_at: DateTime<Utc>,
    pub market_status: String,
    pub source: String,
}
