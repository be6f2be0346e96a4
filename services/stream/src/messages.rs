//! Mapping upstream feed events to bus messages
//!
//! The upstream feed batches compact events (`ev` codes `Q`, `T`, `A`,
//! `AM`) with single-letter fields; this module expands them into the
//! named-field envelopes clients consume.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use types::stream::{format_iso, BusMessage, StreamChannel};

/// Map one upstream event to a bus message. Events without a usable
/// symbol or with an unknown code are dropped.
pub fn map_feed_event(event: &Value) -> Option<BusMessage> {
    let event_type = event
        .get("ev")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_uppercase();
    let symbol = event
        .get("sym")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_ascii_uppercase();
    if symbol.is_empty() {
        return None;
    }

    match event_type.as_str() {
        "Q" => Some(BusMessage::market(
            StreamChannel::Quote,
            json!({
                "symbol": symbol,
                "event_ts": to_iso_datetime(event.get("t")),
                "bid": to_float(event.get("bp")),
                "ask": to_float(event.get("ap")),
                "bid_size": to_float(event.get("bs")),
                "ask_size": to_float(event.get("as")),
            }),
        )),
        "T" => {
            let price = to_float(event.get("p"));
            Some(BusMessage::market(
                StreamChannel::Trade,
                json!({
                    "symbol": symbol,
                    "event_ts": to_iso_datetime(event.get("t")),
                    "price": price,
                    "last": price,
                    "size": to_float(event.get("s")),
                }),
            ))
        }
        "A" | "AM" => {
            let close = to_float(event.get("c"));
            Some(BusMessage::market(
                StreamChannel::Aggregate,
                json!({
                    "symbol": symbol,
                    "event_ts": to_iso_datetime(event.get("e")),
                    "start_at": to_iso_datetime(event.get("s")),
                    "end_at": to_iso_datetime(event.get("e")),
                    "timespan": if event_type == "AM" { "minute" } else { "second" },
                    "multiplier": 1,
                    "open": to_float(event.get("o")),
                    "high": to_float(event.get("h")),
                    "low": to_float(event.get("l")),
                    "close": close,
                    "last": close,
                    "volume": to_float(event.get("v")),
                    "vwap": to_float(event.get("vw")),
                }),
            ))
        }
        _ => None,
    }
}

/// Normalize an epoch (s/ms/µs/ns by magnitude) or ISO string to the
/// envelope timestamp format.
pub fn to_iso_datetime(value: Option<&Value>) -> Option<String> {
    let value = value?;
    if let Some(number) = value.as_f64() {
        let abs = number.abs();
        let seconds = if abs >= 1e18 {
            number / 1e9
        } else if abs >= 1e15 {
            number / 1e6
        } else if abs >= 1e12 {
            number / 1e3
        } else {
            number
        };
        let parsed = DateTime::<Utc>::from_timestamp_millis((seconds * 1e3) as i64)?;
        return Some(format_iso(parsed));
    }

    let text = value.as_str()?.trim();
    if text.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| format_iso(dt.with_timezone(&Utc)))
}

pub fn to_float(value: Option<&Value>) -> Option<f64> {
    let value = value?;
    if let Some(number) = value.as_f64() {
        return Some(number);
    }
    value.as_str().and_then(|s| s.trim().parse().ok())
}
