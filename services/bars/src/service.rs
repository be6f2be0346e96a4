//! Tiered bar query service
//!
//! Routes each query to a storage tier, backfilling from the vendor on a
//! coverage miss:
//! - `day × 1` and `minute × 1` go to the baseline tiers
//! - `minute × {5,15,60}` reads finalized precomputed aggregates and
//!   splices in the currently open bucket recomputed from minute rows
//! - everything else goes straight to the vendor
//!
//! Background maintenance lives here too: precomputing finalized
//! aggregates and enforcing minute-tier retention by trade date.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use types::bar::{BarSource, MarketBar, MarketSnapshot, Timespan};
use types::errors::MarketDataError;
use types::symbol::normalize_ticker;

use crate::aggregation::{
    aggregate_bucket, aggregate_minute_bars, resolve_current_open_bucket,
};
use crate::calendar::market_trade_date;
use crate::policy;
use crate::snapshot::to_market_snapshot;
use crate::store::{BarStore, RangeCoverage};
use crate::vendor::{map_agg_rows, AggsClient};

/// Maximum tickers per snapshot request.
pub const MAX_SNAPSHOT_TICKERS: usize = 50;

#[derive(Debug, Clone)]
pub struct BarServiceConfig {
    /// Default lookback for day-bar queries without an explicit start.
    pub daily_lookback_days: i64,
    /// Default lookback for minute-bar queries without an explicit start.
    pub intraday_lookback_days: i64,
    /// Fall through to the vendor when the aggregate tier has nothing.
    pub enable_direct_fallback: bool,
}

impl Default for BarServiceConfig {
    fn default() -> Self {
        Self {
            daily_lookback_days: 365,
            intraday_lookback_days: 7,
            enable_direct_fallback: true,
        }
    }
}

/// Caller-facing query parameters, unvalidated.
#[derive(Debug, Clone)]
pub struct BarsParams {
    pub ticker: String,
    pub timespan: String,
    pub multiplier: u32,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub limit: Option<usize>,
}

/// Query result plus where the bars came from.
#[derive(Debug, Clone)]
pub struct BarsQueryResult {
    pub bars: Vec<MarketBar>,
    pub data_source: BarSource,
}

/// Row counts removed by one retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionOutcome {
    pub minute_deleted: u64,
    pub minute_agg_deleted: u64,
}

#[derive(Debug, Clone)]
struct BarsQuery {
    ticker: String,
    timespan: Timespan,
    multiplier: u32,
    start_date: NaiveDate,
    end_date: NaiveDate,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    limit: Option<usize>,
}

pub struct BarService {
    store: Arc<dyn BarStore>,
    vendor: Option<Arc<dyn AggsClient>>,
    config: BarServiceConfig,
}

impl BarService {
    pub fn new(
        store: Arc<dyn BarStore>,
        vendor: Option<Arc<dyn AggsClient>>,
        config: BarServiceConfig,
    ) -> Self {
        Self {
            store,
            vendor,
            config,
        }
    }

    pub async fn list_bars(&self, params: BarsParams) -> Result<Vec<MarketBar>, MarketDataError> {
        Ok(self.list_bars_with_meta(params).await?.bars)
    }

    pub async fn list_bars_with_meta(
        &self,
        params: BarsParams,
    ) -> Result<BarsQueryResult, MarketDataError> {
        self.list_bars_with_meta_at(params, Utc::now()).await
    }

    /// Same as [`Self::list_bars_with_meta`] with an injected clock; the
    /// clock drives default date ranges and open-bucket finality.
    pub async fn list_bars_with_meta_at(
        &self,
        params: BarsParams,
        now: DateTime<Utc>,
    ) -> Result<BarsQueryResult, MarketDataError> {
        let query = self.build_query(params, now)?;
        match (query.timespan, query.multiplier) {
            (Timespan::Day, 1) => self.list_day_baseline(&query).await,
            (Timespan::Minute, 1) => self.list_minute_baseline(&query).await,
            (Timespan::Minute, m) if policy::is_supported_minute_agg_multiplier(m) => {
                self.list_minute_aggregated(&query, now).await
            }
            _ => self.list_direct_fallback(&query).await,
        }
    }

    /// Warm the baseline tiers for a ticker using the default lookbacks.
    pub async fn prefetch_default(&self, ticker: &str) -> Result<(), MarketDataError> {
        let normalized = normalize_ticker(ticker)
            .ok_or_else(|| MarketDataError::InvalidTicker(ticker.to_string()))?;

        let today = market_trade_date(Utc::now());
        self.list_bars(BarsParams {
            ticker: normalized.clone(),
            timespan: Timespan::Day.as_str().to_string(),
            multiplier: 1,
            start_date: Some(today - Duration::days(self.config.daily_lookback_days)),
            end_date: Some(today),
            limit: None,
        })
        .await?;
        self.list_bars(BarsParams {
            ticker: normalized,
            timespan: Timespan::Minute.as_str().to_string(),
            multiplier: 1,
            start_date: Some(today - Duration::days(self.config.intraday_lookback_days)),
            end_date: Some(today),
            limit: None,
        })
        .await?;
        Ok(())
    }

    /// Fetch point-in-time snapshots for up to [`MAX_SNAPSHOT_TICKERS`]
    /// tickers. Snapshots always come from the vendor.
    pub async fn list_snapshots(
        &self,
        tickers: &[String],
    ) -> Result<Vec<MarketSnapshot>, MarketDataError> {
        let normalized = normalize_snapshot_tickers(tickers)?;
        let vendor = self.require_vendor()?;

        let payload = vendor
            .list_snapshots(&normalized)
            .await
            .map_err(|err| MarketDataError::from_vendor_detail(err.detail()))?;

        Ok(payload.iter().filter_map(to_market_snapshot).collect())
    }

    /// Aggregate finalized minute bars into the precomputed tier for every
    /// ticker with recent minute data. Returns the number of rows written.
    pub async fn precompute_minute_aggregates(
        &self,
        multiplier: u32,
        lookback_trade_days: i64,
        now: DateTime<Utc>,
    ) -> Result<usize, MarketDataError> {
        if !policy::is_supported_minute_agg_multiplier(multiplier) {
            return Err(MarketDataError::InvalidMultiplier {
                timespan: Timespan::Minute.as_str().to_string(),
                multiplier,
            });
        }
        if lookback_trade_days < 1 {
            return Err(MarketDataError::InvalidRange(
                "lookback_trade_days must be >= 1".to_string(),
            ));
        }

        let keep_from = market_trade_date(now) - Duration::days(lookback_trade_days - 1);
        let start_at = day_start_utc(keep_from);
        let tickers = self.store.list_minute_tickers(start_at, now).await?;

        let mut produced = 0usize;
        for ticker in tickers {
            let minute_bars = self
                .store
                .list_minute_bars(&ticker, start_at, now, None)
                .await?;
            let aggregated = aggregate_minute_bars(
                &ticker,
                multiplier,
                &minute_bars,
                BarSource::DbAgg,
                now,
                false,
            )?;
            if aggregated.is_empty() {
                continue;
            }
            self.store.upsert_minute_agg_bars(&aggregated).await?;
            produced += aggregated.len();
        }

        info!(multiplier, produced, "precomputed minute aggregates");
        Ok(produced)
    }

    /// Drop minute and minute-aggregate rows older than the retention
    /// window, measured in trade days.
    pub async fn enforce_minute_retention(
        &self,
        keep_trade_days: i64,
        now: DateTime<Utc>,
    ) -> Result<RetentionOutcome, MarketDataError> {
        if keep_trade_days < 1 {
            return Err(MarketDataError::InvalidRange(
                "keep_trade_days must be >= 1".to_string(),
            ));
        }

        let keep_from = market_trade_date(now) - Duration::days(keep_trade_days - 1);
        let minute_deleted = self.store.delete_minute_bars_before(keep_from).await?;
        let minute_agg_deleted = self.store.delete_minute_agg_before(keep_from).await?;
        if minute_deleted > 0 || minute_agg_deleted > 0 {
            info!(minute_deleted, minute_agg_deleted, %keep_from, "enforced minute retention");
        }
        Ok(RetentionOutcome {
            minute_deleted,
            minute_agg_deleted,
        })
    }

    fn build_query(
        &self,
        params: BarsParams,
        now: DateTime<Utc>,
    ) -> Result<BarsQuery, MarketDataError> {
        let ticker = normalize_ticker(&params.ticker)
            .ok_or_else(|| MarketDataError::InvalidTicker(params.ticker.clone()))?;
        let timespan = Timespan::parse(&params.timespan)
            .ok_or_else(|| MarketDataError::InvalidTimespan(params.timespan.clone()))?;
        if !policy::is_valid_multiplier(params.multiplier) {
            return Err(MarketDataError::InvalidMultiplier {
                timespan: timespan.as_str().to_string(),
                multiplier: params.multiplier,
            });
        }

        let end_date = params.end_date.unwrap_or_else(|| now.date_naive());
        let start_date = params.start_date.unwrap_or_else(|| {
            let lookback = match timespan {
                Timespan::Minute => self.config.intraday_lookback_days,
                Timespan::Day => self.config.daily_lookback_days,
            };
            end_date - Duration::days(lookback)
        });
        if end_date < start_date {
            return Err(MarketDataError::InvalidRange(
                "end date must be on or after start date".to_string(),
            ));
        }
        if policy::is_range_too_large(timespan, params.multiplier, start_date, end_date) {
            return Err(MarketDataError::RangeTooLarge(format!(
                "{} {}x{} bars over {} to {}",
                ticker, params.multiplier, timespan, start_date, end_date,
            )));
        }

        Ok(BarsQuery {
            ticker,
            timespan,
            multiplier: params.multiplier,
            start_date,
            end_date,
            start_at: day_start_utc(start_date),
            end_at: day_end_utc(end_date),
            limit: params.limit,
        })
    }

    async fn list_day_baseline(
        &self,
        query: &BarsQuery,
    ) -> Result<BarsQueryResult, MarketDataError> {
        let coverage = self.store.day_range_coverage(&query.ticker).await?;
        if coverage_contains(coverage, query.start_at, query.end_at) {
            let bars = self
                .store
                .list_day_bars(&query.ticker, query.start_at, query.end_at, query.limit)
                .await?;
            return Ok(BarsQueryResult {
                bars,
                data_source: BarSource::Db,
            });
        }

        let fetched = self
            .fetch_from_vendor(&query.ticker, Timespan::Day, 1, query.start_date, query.end_date)
            .await?;
        if !fetched.is_empty() {
            self.store.upsert_day_bars(&fetched).await?;
        }

        let bars = self
            .store
            .list_day_bars(&query.ticker, query.start_at, query.end_at, query.limit)
            .await?;
        Ok(BarsQueryResult {
            bars,
            data_source: if fetched.is_empty() {
                BarSource::Db
            } else {
                BarSource::Rest
            },
        })
    }

    async fn list_minute_baseline(
        &self,
        query: &BarsQuery,
    ) -> Result<BarsQueryResult, MarketDataError> {
        let coverage = self.store.minute_range_coverage(&query.ticker).await?;
        if coverage_contains(coverage, query.start_at, query.end_at) {
            let bars = self
                .store
                .list_minute_bars(&query.ticker, query.start_at, query.end_at, query.limit)
                .await?;
            return Ok(BarsQueryResult {
                bars,
                data_source: BarSource::Db,
            });
        }

        let fetched = self
            .fetch_from_vendor(
                &query.ticker,
                Timespan::Minute,
                1,
                query.start_date,
                query.end_date,
            )
            .await?;
        if !fetched.is_empty() {
            self.store.upsert_minute_bars(&fetched).await?;
        }

        let bars = self
            .store
            .list_minute_bars(&query.ticker, query.start_at, query.end_at, query.limit)
            .await?;
        Ok(BarsQueryResult {
            bars,
            data_source: if fetched.is_empty() {
                BarSource::Db
            } else {
                BarSource::Rest
            },
        })
    }

    async fn list_minute_aggregated(
        &self,
        query: &BarsQuery,
        now: DateTime<Utc>,
    ) -> Result<BarsQueryResult, MarketDataError> {
        self.ensure_minute_baseline_coverage(query).await?;

        let finalized = self
            .store
            .list_minute_agg_bars(
                &query.ticker,
                query.multiplier,
                query.start_at,
                query.end_at,
                true,
                None,
            )
            .await?;

        let mut realtime_item: Option<MarketBar> = None;
        if let Some((bucket_start, bucket_end)) =
            resolve_current_open_bucket(now, query.multiplier)?
        {
            let intersects = query.start_at < bucket_end && bucket_start <= query.end_at;
            if intersects {
                let cutoff = bucket_end
                    .min(now + Duration::microseconds(1))
                    .min(query.end_at + Duration::microseconds(1));
                if cutoff > bucket_start {
                    let minute_items = self
                        .store
                        .list_minute_bars_for_bucket(&query.ticker, bucket_start, cutoff)
                        .await?;
                    realtime_item = aggregate_bucket(
                        &query.ticker,
                        query.multiplier,
                        &minute_items,
                        bucket_start,
                        bucket_end,
                        BarSource::DbAggMixed,
                        false,
                    );
                }
            }
        }

        let has_realtime = realtime_item.is_some();
        let merged = merge_aggregated_bars(
            finalized,
            realtime_item,
            query.start_at,
            query.end_at,
            query.limit,
        );
        if !merged.is_empty() {
            return Ok(BarsQueryResult {
                bars: merged,
                data_source: if has_realtime {
                    BarSource::DbAggMixed
                } else {
                    BarSource::DbAgg
                },
            });
        }

        if self.config.enable_direct_fallback {
            debug!(ticker = %query.ticker, multiplier = query.multiplier, "aggregate tier empty, using direct fallback");
            return self.list_direct_fallback(query).await;
        }
        Ok(BarsQueryResult {
            bars: Vec::new(),
            data_source: BarSource::DbAgg,
        })
    }

    async fn list_direct_fallback(
        &self,
        query: &BarsQuery,
    ) -> Result<BarsQueryResult, MarketDataError> {
        let bars = self
            .fetch_from_vendor(
                &query.ticker,
                query.timespan,
                query.multiplier,
                query.start_date,
                query.end_date,
            )
            .await?;
        Ok(BarsQueryResult {
            bars: apply_limit(bars, query.limit),
            data_source: BarSource::Rest,
        })
    }

    /// Backfill the minute baseline when the requested window exceeds
    /// current coverage; a vendor round trip that yields nothing leaves
    /// the tier untouched.
    async fn ensure_minute_baseline_coverage(
        &self,
        query: &BarsQuery,
    ) -> Result<(), MarketDataError> {
        let coverage = self.store.minute_range_coverage(&query.ticker).await?;
        if coverage_contains(coverage, query.start_at, query.end_at) {
            return Ok(());
        }

        let fetched = self
            .fetch_from_vendor(
                &query.ticker,
                Timespan::Minute,
                1,
                query.start_date,
                query.end_date,
            )
            .await?;
        if fetched.is_empty() {
            return Ok(());
        }
        self.store.upsert_minute_bars(&fetched).await
    }

    async fn fetch_from_vendor(
        &self,
        ticker: &str,
        timespan: Timespan,
        multiplier: u32,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<MarketBar>, MarketDataError> {
        let vendor = self.require_vendor()?;
        let rows = vendor
            .list_aggs(ticker, multiplier, timespan, start_date, end_date)
            .await
            .map_err(|err| {
                warn!(%ticker, %timespan, multiplier, error = %err, "vendor fetch failed");
                MarketDataError::from_vendor_detail(err.detail())
            })?;
        Ok(map_agg_rows(ticker, timespan, multiplier, &rows))
    }

    fn require_vendor(&self) -> Result<&Arc<dyn AggsClient>, MarketDataError> {
        self.vendor.as_ref().ok_or_else(|| {
            MarketDataError::UpstreamUnavailable("vendor client not configured".to_string())
        })
    }
}

fn day_start_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn day_end_utc(date: NaiveDate) -> DateTime<Utc> {
    // Inclusive end of day with microsecond resolution.
    day_start_utc(date) + Duration::days(1) - Duration::microseconds(1)
}

fn coverage_contains(
    coverage: Option<RangeCoverage>,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
) -> bool {
    match coverage {
        Some((first, last)) => first <= start_at && last >= end_at,
        None => false,
    }
}

fn merge_aggregated_bars(
    finalized: Vec<MarketBar>,
    realtime_item: Option<MarketBar>,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    limit: Option<usize>,
) -> Vec<MarketBar> {
    let mut merged: Vec<MarketBar> = finalized
        .into_iter()
        .filter(|bar| start_at <= bar.start_at && bar.start_at <= end_at)
        .collect();

    if let Some(item) = realtime_item {
        if start_at <= item.start_at && item.start_at <= end_at {
            merged.retain(|bar| bar.start_at != item.start_at);
            merged.push(item);
        }
    }

    merged.sort_by_key(|bar| bar.start_at);
    apply_limit(merged, limit)
}

fn apply_limit(mut bars: Vec<MarketBar>, limit: Option<usize>) -> Vec<MarketBar> {
    if let Some(limit) = limit {
        if limit > 0 {
            bars.truncate(limit);
        }
    }
    bars
}

fn normalize_snapshot_tickers(tickers: &[String]) -> Result<Vec<String>, MarketDataError> {
    let mut unique: Vec<String> = Vec::new();
    for raw in tickers {
        if raw.trim().is_empty() {
            continue;
        }
        let symbol = normalize_ticker(raw)
            .ok_or_else(|| MarketDataError::InvalidTicker(raw.clone()))?;
        if !unique.contains(&symbol) {
            unique.push(symbol);
        }
    }
    if unique.is_empty() || unique.len() > MAX_SNAPSHOT_TICKERS {
        return Err(MarketDataError::InvalidTicker(format!(
            "expected 1..={MAX_SNAPSHOT_TICKERS} tickers, got {}",
            unique.len()
        )));
    }
    Ok(unique)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBarStore;
    use crate::vendor::{AggRow, VendorError};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockVendor {
        rows: Vec<AggRow>,
        calls: AtomicUsize,
        fail_with: Option<String>,
    }

    impl MockVendor {
        fn with_rows(rows: Vec<AggRow>) -> Self {
            Self {
                rows,
                calls: AtomicUsize::new(0),
                fail_with: None,
            }
        }

        fn failing(detail: &str) -> Self {
            Self {
                rows: Vec::new(),
                calls: AtomicUsize::new(0),
                fail_with: Some(detail.to_string()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AggsClient for MockVendor {
        async fn list_aggs(
            &self,
            _ticker: &str,
            _multiplier: u32,
            _timespan: Timespan,
            _from: NaiveDate,
            _to: NaiveDate,
        ) -> Result<Vec<AggRow>, VendorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(detail) = &self.fail_with {
                return Err(VendorError::Status {
                    status: 502,
                    detail: detail.clone(),
                });
            }
            Ok(self.rows.clone())
        }

        async fn list_snapshots(&self, tickers: &[String]) -> Result<Vec<Value>, VendorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(detail) = &self.fail_with {
                return Err(VendorError::Status {
                    status: 502,
                    detail: detail.clone(),
                });
            }
            Ok(tickers
                .iter()
                .map(|t| json!({"ticker": t, "last": 100.0}))
                .collect())
        }
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0).unwrap()
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn minute_row(start_at: DateTime<Utc>, close: f64) -> AggRow {
        AggRow {
            timestamp: start_at.timestamp_millis() as f64,
            open: close - 0.5,
            high: close + 0.5,
            low: close - 1.0,
            close,
            volume: 100.0,
            vwap: None,
            trades: Some(5),
        }
    }

    fn minute_bar(start_at: DateTime<Utc>, close: f64) -> MarketBar {
        MarketBar {
            ticker: "AAPL".to_string(),
            timespan: Timespan::Minute,
            multiplier: 1,
            start_at,
            end_at: None,
            open: close - 0.5,
            high: close + 0.5,
            low: close - 1.0,
            close,
            volume: 100.0,
            vwap: None,
            trades: Some(5),
            source: BarSource::Rest,
            is_final: true,
        }
    }

    fn params(timespan: &str, multiplier: u32, start: u32, end: u32) -> BarsParams {
        BarsParams {
            ticker: "aapl".to_string(),
            timespan: timespan.to_string(),
            multiplier,
            start_date: Some(date(start)),
            end_date: Some(date(end)),
            limit: None,
        }
    }

    fn service(
        store: Arc<MemoryBarStore>,
        vendor: Arc<MockVendor>,
    ) -> BarService {
        BarService::new(store, Some(vendor), BarServiceConfig::default())
    }

    #[tokio::test]
    async fn test_minute_baseline_coverage_miss_fetches_and_upserts() {
        let store = Arc::new(MemoryBarStore::new());
        let vendor = Arc::new(MockVendor::with_rows(vec![
            minute_row(at(8, 14, 30), 100.0),
            minute_row(at(8, 14, 31), 101.0),
        ]));
        let svc = service(store.clone(), vendor.clone());

        let result = svc
            .list_bars_with_meta_at(params("minute", 1, 8, 8), at(8, 21, 0))
            .await
            .unwrap();
        assert_eq!(result.data_source, BarSource::Rest);
        assert_eq!(result.bars.len(), 2);
        assert_eq!(vendor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_minute_baseline_served_from_storage_when_covered() {
        let store = Arc::new(MemoryBarStore::new());
        // Stored rows bracket the whole queried window.
        store
            .upsert_minute_bars(&[minute_bar(at(8, 0, 0), 100.0), minute_bar(at(9, 0, 0), 101.0)])
            .await
            .unwrap();
        let vendor = Arc::new(MockVendor::with_rows(Vec::new()));
        let svc = service(store, vendor.clone());

        let result = svc
            .list_bars_with_meta_at(params("minute", 1, 8, 8), at(9, 21, 0))
            .await
            .unwrap();
        assert_eq!(result.data_source, BarSource::Db);
        assert_eq!(result.bars.len(), 1);
        assert_eq!(vendor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_day_baseline_served_from_storage_when_covered() {
        let store = Arc::new(MemoryBarStore::new());
        let mut day_bar = minute_bar(at(5, 0, 0), 100.0);
        day_bar.timespan = Timespan::Day;
        let mut day_bar2 = minute_bar(at(9, 0, 0), 101.0);
        day_bar2.timespan = Timespan::Day;
        store.upsert_day_bars(&[day_bar, day_bar2]).await.unwrap();

        let vendor = Arc::new(MockVendor::with_rows(Vec::new()));
        let svc = service(store, vendor.clone());
        // Coverage spans Jan 5 through Jan 9, so a Jan 5-8 query never
        // touches the vendor.
        let result = svc
            .list_bars_with_meta_at(params("day", 1, 5, 8), at(9, 21, 0))
            .await
            .unwrap();
        assert_eq!(result.data_source, BarSource::Db);
        assert_eq!(result.bars.len(), 1);
        assert_eq!(vendor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_aggregated_read_splices_open_bucket() {
        let store = Arc::new(MemoryBarStore::new());
        // Minute coverage for Jan 8; a finalized 5m aggregate plus fresh
        // minute rows inside the bucket that is open at 14:37.
        store
            .upsert_minute_bars(&[
                minute_bar(at(8, 14, 30), 100.0),
                minute_bar(at(8, 14, 35), 102.0),
                minute_bar(at(8, 14, 36), 103.0),
                minute_bar(at(8, 20, 59), 110.0),
            ])
            .await
            .unwrap();
        let mut finalized = minute_bar(at(8, 14, 30), 101.0);
        finalized.multiplier = 5;
        finalized.end_at = Some(at(8, 14, 35));
        finalized.source = BarSource::DbAgg;
        store.upsert_minute_agg_bars(&[finalized]).await.unwrap();

        let vendor = Arc::new(MockVendor::with_rows(Vec::new()));
        let svc = service(store, vendor.clone());
        let result = svc
            .list_bars_with_meta_at(params("minute", 5, 8, 8), at(8, 14, 37))
            .await
            .unwrap();

        assert_eq!(result.data_source, BarSource::DbAggMixed);
        assert_eq!(result.bars.len(), 2);
        let open_bucket = &result.bars[1];
        assert_eq!(open_bucket.start_at, at(8, 14, 35));
        assert!(!open_bucket.is_final);
        assert_eq!(open_bucket.source, BarSource::DbAggMixed);
        // 14:36 row included, 20:59 row is outside the bucket.
        assert_eq!(open_bucket.close, 103.0);
    }

    #[tokio::test]
    async fn test_aggregated_read_without_session_is_final_only() {
        let store = Arc::new(MemoryBarStore::new());
        store
            .upsert_minute_bars(&[minute_bar(at(8, 14, 30), 100.0)])
            .await
            .unwrap();
        let mut finalized = minute_bar(at(8, 14, 30), 101.0);
        finalized.multiplier = 5;
        finalized.source = BarSource::DbAgg;
        store.upsert_minute_agg_bars(&[finalized]).await.unwrap();

        let vendor = Arc::new(MockVendor::with_rows(Vec::new()));
        let svc = service(store, vendor);
        // 23:00 UTC is after the close: no open bucket to splice.
        let result = svc
            .list_bars_with_meta_at(params("minute", 5, 8, 8), at(8, 23, 0))
            .await
            .unwrap();
        assert_eq!(result.data_source, BarSource::DbAgg);
        assert_eq!(result.bars.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_aggregate_tier_falls_back_to_vendor() {
        let store = Arc::new(MemoryBarStore::new());
        let vendor = Arc::new(MockVendor::with_rows(vec![minute_row(
            at(8, 14, 30),
            100.0,
        )]));
        let svc = service(store, vendor.clone());

        let result = svc
            .list_bars_with_meta_at(params("minute", 15, 8, 8), at(8, 23, 0))
            .await
            .unwrap();
        assert_eq!(result.data_source, BarSource::Rest);
        assert!(!result.bars.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_combination_uses_direct_fallback() {
        let store = Arc::new(MemoryBarStore::new());
        let vendor = Arc::new(MockVendor::with_rows(vec![minute_row(
            at(8, 14, 30),
            100.0,
        )]));
        let svc = service(store, vendor.clone());

        let result = svc
            .list_bars_with_meta_at(params("day", 5, 1, 8), at(8, 23, 0))
            .await
            .unwrap();
        assert_eq!(result.data_source, BarSource::Rest);
        assert_eq!(vendor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let store = Arc::new(MemoryBarStore::new());
        let vendor = Arc::new(MockVendor::with_rows(Vec::new()));
        let svc = service(store, vendor);
        let now = at(8, 15, 0);

        let mut bad_ticker = params("minute", 1, 8, 8);
        bad_ticker.ticker = "not a ticker".to_string();
        assert!(matches!(
            svc.list_bars_with_meta_at(bad_ticker, now).await,
            Err(MarketDataError::InvalidTicker(_))
        ));

        assert!(matches!(
            svc.list_bars_with_meta_at(params("week", 1, 8, 8), now).await,
            Err(MarketDataError::InvalidTimespan(_))
        ));

        assert!(matches!(
            svc.list_bars_with_meta_at(params("minute", 0, 8, 8), now).await,
            Err(MarketDataError::InvalidMultiplier { .. })
        ));

        assert!(matches!(
            svc.list_bars_with_meta_at(params("minute", 1, 9, 8), now).await,
            Err(MarketDataError::InvalidRange(_))
        ));

        assert!(matches!(
            svc.list_bars_with_meta_at(params("minute", 1, 1, 31), now).await,
            Err(MarketDataError::RangeTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_vendor_rate_limit_classified() {
        let store = Arc::new(MemoryBarStore::new());
        let vendor = Arc::new(MockVendor::failing("429 too many requests"));
        let svc = service(store, vendor);

        let err = svc
            .list_bars_with_meta_at(params("minute", 1, 8, 8), at(8, 15, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, MarketDataError::RateLimited(_)));
    }

    #[tokio::test]
    async fn test_missing_vendor_is_upstream_unavailable() {
        let store = Arc::new(MemoryBarStore::new());
        let svc = BarService::new(store, None, BarServiceConfig::default());

        let err = svc
            .list_bars_with_meta_at(params("minute", 1, 8, 8), at(8, 15, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, MarketDataError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn test_precompute_writes_finalized_buckets() {
        let store = Arc::new(MemoryBarStore::new());
        store
            .upsert_minute_bars(&[
                minute_bar(at(8, 14, 30), 100.0),
                minute_bar(at(8, 14, 31), 101.0),
                minute_bar(at(8, 14, 35), 102.0),
            ])
            .await
            .unwrap();
        let vendor = Arc::new(MockVendor::with_rows(Vec::new()));
        let svc = service(store.clone(), vendor);

        // At 14:38 the 14:30 bucket closed and the 14:35 bucket is open.
        let produced = svc
            .precompute_minute_aggregates(5, 10, at(8, 14, 38))
            .await
            .unwrap();
        assert_eq!(produced, 1);

        let rows = store
            .list_minute_agg_bars("AAPL", 5, at(8, 0, 0), at(8, 23, 0), true, None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].start_at, at(8, 14, 30));
        assert_eq!(rows[0].source, BarSource::DbAgg);
    }

    #[tokio::test]
    async fn test_retention_outcome_counts() {
        let store = Arc::new(MemoryBarStore::new());
        store
            .upsert_minute_bars(&[
                minute_bar(at(2, 14, 30), 100.0),
                minute_bar(at(8, 14, 30), 101.0),
            ])
            .await
            .unwrap();
        let vendor = Arc::new(MockVendor::with_rows(Vec::new()));
        let svc = service(store, vendor);

        let outcome = svc
            .enforce_minute_retention(3, at(8, 21, 0))
            .await
            .unwrap();
        assert_eq!(outcome.minute_deleted, 1);
        assert_eq!(outcome.minute_agg_deleted, 0);

        assert!(svc.enforce_minute_retention(0, at(8, 21, 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_ticker_normalization() {
        let store = Arc::new(MemoryBarStore::new());
        let vendor = Arc::new(MockVendor::with_rows(Vec::new()));
        let svc = service(store, vendor);

        let snapshots = svc
            .list_snapshots(&["aapl".to_string(), " AAPL ".to_string(), "msft".to_string()])
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].ticker, "AAPL");
        assert_eq!(snapshots[1].ticker, "MSFT");

        assert!(svc.list_snapshots(&[]).await.is_err());
        assert!(svc.list_snapshots(&["bad ticker".to_string()]).await.is_err());

        let too_many: Vec<String> = (0..51).map(|i| format!("{}", ticker_for(i))).collect();
        assert!(svc.list_snapshots(&too_many).await.is_err());
    }

    fn ticker_for(i: usize) -> String {
        let letters = ['A', 'B', 'C', 'D', 'E', 'F', 'G', 'H'];
        format!(
            "{}{}{}",
            letters[i % 8],
            letters[(i / 8) % 8],
            letters[(i / 64) % 8]
        )
    }
}
