//! Loose mapping from vendor snapshot payloads to [`MarketSnapshot`]
//!
//! Snapshot shapes differ between vendor plans, so every field is read
//! through an ordered list of candidate keys. Keys may be dotted paths
//! into nested objects (`"day.open"`, `"last_trade.price"`).

use chrono::{DateTime, Utc};
use serde_json::Value;
use types::bar::MarketSnapshot;

use crate::vendor::epoch_to_utc;

/// Map one raw snapshot payload. Returns `None` when no ticker can be
/// extracted; missing numeric fields default to zero.
pub fn to_market_snapshot(raw: &Value) -> Option<MarketSnapshot> {
    let ticker = extract_str(raw, &["ticker", "symbol"])?;

    let updated_at = extract_datetime(raw, &["updated_at", "updated", "timestamp", "t"])
        .unwrap_or_else(Utc::now);

    Some(MarketSnapshot {
        ticker: ticker.to_ascii_uppercase(),
        last: extract_f64(raw, &["last", "price", "last_trade.price"]),
        change: extract_f64(raw, &["change", "todays_change", "todaysChange"]),
        change_pct: extract_f64(
            raw,
            &[
                "change_pct",
                "todays_change_perc",
                "todaysChangePerc",
                "todays_change_percent",
            ],
        ),
        open: extract_f64(raw, &["open", "day.open"]),
        high: extract_f64(raw, &["high", "day.high"]),
        low: extract_f64(raw, &["low", "day.low"]),
        volume: extract_f64(raw, &["volume", "day.volume"]) as u64,
        updated_at,
        market_status: extract_str(raw, &["market_status"]).unwrap_or_else(|| "unknown".to_string()),
        source: extract_str(raw, &["source"])
            .unwrap_or_else(|| "REST".to_string())
            .to_ascii_uppercase(),
    })
}

/// Walk a dotted path into nested objects.
fn extract_value<'a>(raw: &'a Value, key: &str) -> Option<&'a Value> {
    let mut current = raw;
    for part in key.split('.') {
        current = current.get(part)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn extract_str(raw: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(value) = extract_value(raw, key) {
            let text = match value {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            };
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn extract_f64(raw: &Value, keys: &[&str]) -> f64 {
    for key in keys {
        if let Some(value) = extract_value(raw, key) {
            if let Some(number) = value.as_f64() {
                return number;
            }
            if let Some(parsed) = value.as_str().and_then(|s| s.trim().parse::<f64>().ok()) {
                return parsed;
            }
        }
    }
    0.0
}

fn extract_datetime(raw: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    let value = keys.iter().find_map(|key| extract_value(raw, key))?;

    if let Some(number) = value.as_f64() {
        return epoch_to_utc(number);
    }
    let text = value.as_str()?.trim();
    if text.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_payload() {
        let raw = json!({
            "ticker": "aapl",
            "last": 187.5,
            "change": 1.2,
            "change_pct": 0.6,
            "open": 186.0,
            "high": 188.0,
            "low": 185.5,
            "volume": 1_000_000,
            "updated_at": "2024-01-08T15:00:00Z",
            "market_status": "open",
        });
        let snapshot = to_market_snapshot(&raw).unwrap();
        assert_eq!(snapshot.ticker, "AAPL");
        assert_eq!(snapshot.last, 187.5);
        assert_eq!(snapshot.volume, 1_000_000);
        assert_eq!(snapshot.market_status, "open");
        assert_eq!(snapshot.source, "REST");
    }

    #[test]
    fn test_nested_vendor_payload() {
        let raw = json!({
            "ticker": "MSFT",
            "todaysChange": -2.0,
            "todaysChangePerc": -0.5,
            "day": {"open": 400.0, "high": 404.0, "low": 398.0, "volume": 5_000_000},
            "last_trade": {"price": 401.25},
            "updated": 1_704_726_000_000_000_000i64, // ns epoch
        });
        let snapshot = to_market_snapshot(&raw).unwrap();
        assert_eq!(snapshot.last, 401.25);
        assert_eq!(snapshot.open, 400.0);
        assert_eq!(snapshot.change, -2.0);
        assert_eq!(snapshot.volume, 5_000_000);
    }

    #[test]
    fn test_missing_ticker_rejected() {
        assert!(to_market_snapshot(&json!({"last": 1.0})).is_none());
    }
}
