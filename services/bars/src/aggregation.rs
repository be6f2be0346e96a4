//! Session-aligned bucket math and minute-bar aggregation
//!
//! Buckets are half-open `[start, end)` windows of `multiplier` minutes
//! anchored at the session open. The last bucket of a day is truncated at
//! the session close, and points outside the session are clamped onto its
//! first or last bucket so every instant maps to exactly one bucket.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use types::bar::{BarSource, MarketBar, Timespan};
use types::errors::MarketDataError;

use crate::calendar::{as_market_time, session_bounds};

/// UTC bounds of the bucket containing `point`.
pub fn resolve_bucket_bounds(
    point: DateTime<Utc>,
    multiplier: u32,
) -> Result<(DateTime<Utc>, DateTime<Utc>), MarketDataError> {
    if multiplier < 1 {
        return Err(MarketDataError::InvalidMultiplier {
            timespan: Timespan::Minute.as_str().to_string(),
            multiplier,
        });
    }

    let local_point = as_market_time(point);
    let (session_open, session_close) = session_bounds(local_point.date_naive());

    let last_usable = session_close - Duration::microseconds(1);
    let clamped = local_point.clamp(session_open, last_usable);
    let elapsed_minutes = (clamped - session_open).num_minutes();
    let bucket_index = elapsed_minutes / i64::from(multiplier);

    let bucket_start = session_open + Duration::minutes(bucket_index * i64::from(multiplier));
    let bucket_end = (bucket_start + Duration::minutes(i64::from(multiplier))).min(session_close);
    Ok((
        bucket_start.with_timezone(&Utc),
        bucket_end.with_timezone(&Utc),
    ))
}

/// UTC bounds of the bucket that is open right now, or `None` when the
/// session is closed.
pub fn resolve_current_open_bucket(
    now: DateTime<Utc>,
    multiplier: u32,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, MarketDataError> {
    let local_now = as_market_time(now);
    let (session_open, session_close) = session_bounds(local_now.date_naive());
    if local_now < session_open || local_now >= session_close {
        return Ok(None);
    }
    resolve_bucket_bounds(now, multiplier).map(Some)
}

/// A bucket is final once its end has passed.
pub fn is_bucket_final(bucket_end: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    bucket_end <= now
}

/// Collapse the minute bars of one bucket into a single aggregate bar.
///
/// Returns `None` for an empty bucket. The volume-weighted price uses each
/// bar's vwap when present and its close otherwise; zero total volume
/// yields no vwap.
pub fn aggregate_bucket(
    ticker: &str,
    multiplier: u32,
    bars: &[MarketBar],
    bucket_start: DateTime<Utc>,
    bucket_end: DateTime<Utc>,
    source: BarSource,
    is_final: bool,
) -> Option<MarketBar> {
    if bars.is_empty() {
        return None;
    }

    let mut sorted: Vec<&MarketBar> = bars.iter().collect();
    sorted.sort_by_key(|bar| bar.start_at);
    let first = sorted[0];
    let last = sorted[sorted.len() - 1];

    let high = sorted.iter().map(|bar| bar.high).fold(f64::MIN, f64::max);
    let low = sorted.iter().map(|bar| bar.low).fold(f64::MAX, f64::min);
    let total_volume: f64 = sorted.iter().map(|bar| bar.volume).sum();
    let trades: u64 = sorted.iter().map(|bar| bar.trades.unwrap_or(0)).sum();

    let weighted_base: f64 = sorted
        .iter()
        .map(|bar| bar.vwap.unwrap_or(bar.close) * bar.volume)
        .sum();
    let vwap = if total_volume > 0.0 {
        Some(weighted_base / total_volume)
    } else {
        None
    };

    Some(MarketBar {
        ticker: ticker.to_string(),
        timespan: Timespan::Minute,
        multiplier,
        start_at: bucket_start,
        end_at: Some(bucket_end),
        open: first.open,
        high,
        low,
        close: last.close,
        volume: total_volume,
        vwap,
        trades: Some(trades),
        source,
        is_final,
    })
}

/// Group minute bars into buckets and aggregate each one.
///
/// Buckets whose end lies in the future are skipped unless
/// `include_unfinished` is set; the result is ordered by bucket start.
pub fn aggregate_minute_bars(
    ticker: &str,
    multiplier: u32,
    bars: &[MarketBar],
    source: BarSource,
    now: DateTime<Utc>,
    include_unfinished: bool,
) -> Result<Vec<MarketBar>, MarketDataError> {
    let mut grouped: BTreeMap<(DateTime<Utc>, DateTime<Utc>), Vec<MarketBar>> = BTreeMap::new();
    for bar in bars {
        let bounds = resolve_bucket_bounds(bar.start_at, multiplier)?;
        grouped.entry(bounds).or_default().push(bar.clone());
    }

    let mut aggregated = Vec::new();
    for ((bucket_start, bucket_end), bucket_bars) in grouped {
        let is_final = is_bucket_final(bucket_end, now);
        if !include_unfinished && !is_final {
            continue;
        }
        if let Some(item) = aggregate_bucket(
            ticker,
            multiplier,
            &bucket_bars,
            bucket_start,
            bucket_end,
            source,
            is_final,
        ) {
            aggregated.push(item);
        }
    }
    Ok(aggregated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn minute_bar(start_at: DateTime<Utc>, open: f64, close: f64, volume: f64) -> MarketBar {
        MarketBar {
            ticker: "AAPL".to_string(),
            timespan: Timespan::Minute,
            multiplier: 1,
            start_at,
            end_at: None,
            open,
            high: open.max(close) + 0.5,
            low: open.min(close) - 0.5,
            close,
            volume,
            vwap: None,
            trades: Some(10),
            source: BarSource::Rest,
            is_final: true,
        }
    }

    fn jan8(hour: u32, minute: u32) -> DateTime<Utc> {
        // 2024-01-08 is a Monday in EST (UTC-5); session is 14:30-21:00 UTC.
        Utc.with_ymd_and_hms(2024, 1, 8, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_bucket_bounds_aligned_to_open() {
        // 14:37 UTC = 09:37 local → second 5-minute bucket (09:35-09:40).
        let (start, end) = resolve_bucket_bounds(jan8(14, 37), 5).unwrap();
        assert_eq!(start, jan8(14, 35));
        assert_eq!(end, jan8(14, 40));
    }

    #[test]
    fn test_bucket_bounds_clamped_before_open() {
        let (start, end) = resolve_bucket_bounds(jan8(12, 0), 15).unwrap();
        assert_eq!(start, jan8(14, 30));
        assert_eq!(end, jan8(14, 45));
    }

    #[test]
    fn test_bucket_bounds_clamped_after_close() {
        // After-close points map onto the last bucket of the day.
        let (start, end) = resolve_bucket_bounds(jan8(22, 0), 60).unwrap();
        assert_eq!(start, jan8(20, 30));
        assert_eq!(end, jan8(21, 0));
    }

    #[test]
    fn test_last_bucket_truncated_at_close() {
        // 60-minute buckets from 09:30: the 15:30-16:30 bucket is cut at 16:00.
        let (start, end) = resolve_bucket_bounds(jan8(20, 45), 60).unwrap();
        assert_eq!(start, jan8(20, 30));
        assert_eq!(end, jan8(21, 0));
    }

    #[test]
    fn test_zero_multiplier_rejected() {
        assert!(resolve_bucket_bounds(jan8(15, 0), 0).is_err());
    }

    #[test]
    fn test_current_open_bucket_outside_session() {
        assert_eq!(resolve_current_open_bucket(jan8(12, 0), 5).unwrap(), None);
        assert_eq!(resolve_current_open_bucket(jan8(21, 0), 5).unwrap(), None);
    }

    #[test]
    fn test_current_open_bucket_during_session() {
        let bucket = resolve_current_open_bucket(jan8(15, 2), 5).unwrap();
        assert_eq!(bucket, Some((jan8(15, 0), jan8(15, 5))));
    }

    #[test]
    fn test_aggregate_bucket_empty() {
        let result = aggregate_bucket(
            "AAPL",
            5,
            &[],
            jan8(14, 30),
            jan8(14, 35),
            BarSource::DbAgg,
            true,
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_aggregate_bucket_ohlcv() {
        let bars = vec![
            minute_bar(jan8(14, 31), 101.0, 102.0, 200.0),
            minute_bar(jan8(14, 30), 100.0, 101.0, 100.0),
            minute_bar(jan8(14, 32), 102.0, 103.0, 300.0),
        ];
        let agg = aggregate_bucket(
            "AAPL",
            5,
            &bars,
            jan8(14, 30),
            jan8(14, 35),
            BarSource::DbAgg,
            true,
        )
        .unwrap();

        // Open from the earliest bar, close from the latest, despite input order.
        assert_eq!(agg.open, 100.0);
        assert_eq!(agg.close, 103.0);
        assert_eq!(agg.high, 103.5);
        assert_eq!(agg.low, 99.5);
        assert_eq!(agg.volume, 600.0);
        assert_eq!(agg.trades, Some(30));
        assert!(agg.is_final);
        assert_eq!(agg.end_at, Some(jan8(14, 35)));
    }

    #[test]
    fn test_aggregate_bucket_vwap_falls_back_to_close() {
        let mut with_vwap = minute_bar(jan8(14, 30), 100.0, 100.0, 100.0);
        with_vwap.vwap = Some(100.0);
        let without_vwap = minute_bar(jan8(14, 31), 104.0, 104.0, 100.0);

        let agg = aggregate_bucket(
            "AAPL",
            5,
            &[with_vwap, without_vwap],
            jan8(14, 30),
            jan8(14, 35),
            BarSource::DbAgg,
            true,
        )
        .unwrap();
        assert_eq!(agg.vwap, Some(102.0));
    }

    #[test]
    fn test_aggregate_bucket_zero_volume_has_no_vwap() {
        let bars = vec![minute_bar(jan8(14, 30), 100.0, 100.0, 0.0)];
        let agg = aggregate_bucket(
            "AAPL",
            5,
            &bars,
            jan8(14, 30),
            jan8(14, 35),
            BarSource::DbAgg,
            true,
        )
        .unwrap();
        assert_eq!(agg.vwap, None);
    }

    #[test]
    fn test_aggregate_minute_bars_skips_open_bucket() {
        let bars = vec![
            minute_bar(jan8(14, 30), 100.0, 101.0, 100.0),
            minute_bar(jan8(14, 35), 101.0, 102.0, 100.0),
        ];
        // now = 14:38: the 14:30 bucket closed, the 14:35 bucket is still open.
        let out = aggregate_minute_bars("AAPL", 5, &bars, BarSource::DbAgg, jan8(14, 38), false)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start_at, jan8(14, 30));

        let with_open =
            aggregate_minute_bars("AAPL", 5, &bars, BarSource::DbAgg, jan8(14, 38), true).unwrap();
        assert_eq!(with_open.len(), 2);
        assert!(!with_open[1].is_final);
    }

    #[test]
    fn test_aggregate_minute_bars_sorted_by_start() {
        let bars = vec![
            minute_bar(jan8(15, 0), 103.0, 104.0, 100.0),
            minute_bar(jan8(14, 30), 100.0, 101.0, 100.0),
        ];
        let out = aggregate_minute_bars("AAPL", 5, &bars, BarSource::DbAgg, jan8(16, 0), false)
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].start_at < out[1].start_at);
    }
}
