//! Tiered bar storage
//!
//! Three tiers, each keyed by its natural key:
//! - day baseline: `(ticker, start_at)`, one row per trade date
//! - minute baseline: `(ticker, start_at)`
//! - minute aggregates: `(ticker, multiplier, bucket_start_at)`
//!
//! Upserts replace on key conflict; retention deletes by trade date so a
//! whole exchange-local day is dropped at once. `MemoryBarStore` is the
//! in-process implementation used by the service and its tests.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use types::bar::MarketBar;
use types::errors::MarketDataError;

use crate::calendar::market_trade_date;

/// Min/max `start_at` held for a tier, used to decide whether a query can
/// be answered locally.
pub type RangeCoverage = (DateTime<Utc>, DateTime<Utc>);

#[async_trait]
pub trait BarStore: Send + Sync {
    async fn list_day_bars(
        &self,
        ticker: &str,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<MarketBar>, MarketDataError>;

    async fn list_minute_bars(
        &self,
        ticker: &str,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<MarketBar>, MarketDataError>;

    async fn list_minute_agg_bars(
        &self,
        ticker: &str,
        multiplier: u32,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        final_only: bool,
        limit: Option<usize>,
    ) -> Result<Vec<MarketBar>, MarketDataError>;

    /// Minute rows inside one half-open bucket window `[start, end)`.
    async fn list_minute_bars_for_bucket(
        &self,
        ticker: &str,
        bucket_start_at: DateTime<Utc>,
        bucket_end_at: DateTime<Utc>,
    ) -> Result<Vec<MarketBar>, MarketDataError>;

    async fn day_range_coverage(
        &self,
        ticker: &str,
    ) -> Result<Option<RangeCoverage>, MarketDataError>;

    async fn minute_range_coverage(
        &self,
        ticker: &str,
    ) -> Result<Option<RangeCoverage>, MarketDataError>;

    /// Distinct tickers with minute rows inside the window, ascending.
    async fn list_minute_tickers(
        &self,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<Vec<String>, MarketDataError>;

    async fn upsert_day_bars(&self, bars: &[MarketBar]) -> Result<(), MarketDataError>;

    async fn upsert_minute_bars(&self, bars: &[MarketBar]) -> Result<(), MarketDataError>;

    async fn upsert_minute_agg_bars(&self, bars: &[MarketBar]) -> Result<(), MarketDataError>;

    /// Delete minute rows whose trade date precedes `keep_from`, returning
    /// the number of rows removed.
    async fn delete_minute_bars_before(
        &self,
        keep_from: NaiveDate,
    ) -> Result<u64, MarketDataError>;

    async fn delete_minute_agg_before(
        &self,
        keep_from: NaiveDate,
    ) -> Result<u64, MarketDataError>;
}

type TickerSeries = HashMap<String, BTreeMap<DateTime<Utc>, MarketBar>>;
type AggSeries = HashMap<(String, u32), BTreeMap<DateTime<Utc>, MarketBar>>;

/// In-memory tiered store.
#[derive(Default)]
pub struct MemoryBarStore {
    day: RwLock<TickerSeries>,
    minute: RwLock<TickerSeries>,
    minute_agg: RwLock<AggSeries>,
}

impl MemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn collect_range(
    series: Option<&BTreeMap<DateTime<Utc>, MarketBar>>,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    limit: Option<usize>,
) -> Vec<MarketBar> {
    let Some(series) = series else {
        return Vec::new();
    };
    let iter = series.range(start_at..=end_at).map(|(_, bar)| bar.clone());
    match limit {
        Some(limit) if limit > 0 => iter.take(limit).collect(),
        _ => iter.collect(),
    }
}

fn coverage_of(series: Option<&BTreeMap<DateTime<Utc>, MarketBar>>) -> Option<RangeCoverage> {
    let series = series?;
    let first = series.keys().next()?;
    let last = series.keys().next_back()?;
    Some((*first, *last))
}

#[async_trait]
impl BarStore for MemoryBarStore {
    async fn list_day_bars(
        &self,
        ticker: &str,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<MarketBar>, MarketDataError> {
        let day = self.day.read().await;
        Ok(collect_range(day.get(ticker), start_at, end_at, limit))
    }

    async fn list_minute_bars(
        &self,
        ticker: &str,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<MarketBar>, MarketDataError> {
        let minute = self.minute.read().await;
        Ok(collect_range(minute.get(ticker), start_at, end_at, limit))
    }

    async fn list_minute_agg_bars(
        &self,
        ticker: &str,
        multiplier: u32,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        final_only: bool,
        limit: Option<usize>,
    ) -> Result<Vec<MarketBar>, MarketDataError> {
        let agg = self.minute_agg.read().await;
        let key = (ticker.to_string(), multiplier);
        let mut bars = collect_range(agg.get(&key), start_at, end_at, None);
        if final_only {
            bars.retain(|bar| bar.is_final);
        }
        if let Some(limit) = limit {
            if limit > 0 {
                bars.truncate(limit);
            }
        }
        Ok(bars)
    }

    async fn list_minute_bars_for_bucket(
        &self,
        ticker: &str,
        bucket_start_at: DateTime<Utc>,
        bucket_end_at: DateTime<Utc>,
    ) -> Result<Vec<MarketBar>, MarketDataError> {
        let minute = self.minute.read().await;
        let Some(series) = minute.get(ticker) else {
            return Ok(Vec::new());
        };
        Ok(series
            .range(bucket_start_at..bucket_end_at)
            .map(|(_, bar)| bar.clone())
            .collect())
    }

    async fn day_range_coverage(
        &self,
        ticker: &str,
    ) -> Result<Option<RangeCoverage>, MarketDataError> {
        let day = self.day.read().await;
        Ok(coverage_of(day.get(ticker)))
    }

    async fn minute_range_coverage(
        &self,
        ticker: &str,
    ) -> Result<Option<RangeCoverage>, MarketDataError> {
        let minute = self.minute.read().await;
        Ok(coverage_of(minute.get(ticker)))
    }

    async fn list_minute_tickers(
        &self,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<Vec<String>, MarketDataError> {
        let minute = self.minute.read().await;
        let mut tickers: Vec<String> = minute
            .iter()
            .filter(|(_, series)| series.range(start_at..=end_at).next().is_some())
            .map(|(ticker, _)| ticker.clone())
            .collect();
        tickers.sort();
        Ok(tickers)
    }

    async fn upsert_day_bars(&self, bars: &[MarketBar]) -> Result<(), MarketDataError> {
        let mut day = self.day.write().await;
        for bar in bars {
            day.entry(bar.ticker.clone())
                .or_default()
                .insert(bar.start_at, bar.clone());
        }
        Ok(())
    }

    async fn upsert_minute_bars(&self, bars: &[MarketBar]) -> Result<(), MarketDataError> {
        let mut minute = self.minute.write().await;
        for bar in bars {
            minute
                .entry(bar.ticker.clone())
                .or_default()
                .insert(bar.start_at, bar.clone());
        }
        Ok(())
    }

    async fn upsert_minute_agg_bars(&self, bars: &[MarketBar]) -> Result<(), MarketDataError> {
        let mut agg = self.minute_agg.write().await;
        for bar in bars {
            agg.entry((bar.ticker.clone(), bar.multiplier))
                .or_default()
                .insert(bar.start_at, bar.clone());
        }
        Ok(())
    }

    async fn delete_minute_bars_before(
        &self,
        keep_from: NaiveDate,
    ) -> Result<u64, MarketDataError> {
        let mut minute = self.minute.write().await;
        Ok(prune_before(&mut minute, keep_from))
    }

    async fn delete_minute_agg_before(
        &self,
        keep_from: NaiveDate,
    ) -> Result<u64, MarketDataError> {
        let mut agg = self.minute_agg.write().await;
        let mut deleted = 0u64;
        for series in agg.values_mut() {
            let before = series.len();
            series.retain(|start_at, _| market_trade_date(*start_at) >= keep_from);
            deleted += (before - series.len()) as u64;
        }
        agg.retain(|_, series| !series.is_empty());
        Ok(deleted)
    }
}

fn prune_before(store: &mut TickerSeries, keep_from: NaiveDate) -> u64 {
    let mut deleted = 0u64;
    for series in store.values_mut() {
        let before = series.len();
        series.retain(|start_at, _| market_trade_date(*start_at) >= keep_from);
        deleted += (before - series.len()) as u64;
    }
    store.retain(|_, series| !series.is_empty());
    deleted
}
