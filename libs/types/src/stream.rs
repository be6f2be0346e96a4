//! Streaming channels, fan-out topics, and the bus message envelope
//!
//! Everything that flows between the realtime publisher, the shared
//! pub/sub broker, and the gateway hubs uses one envelope shape:
//! `{"type": ..., "ts": <ISO-8601 Z>, "source": "WS", "data": {...}}`.
//!
//! Topics are routing keys of the form `<event-prefix>.<symbol>` where the
//! prefixes are the vendor's event codes (`Q` quote, `T` trade, `A`/`AM`
//! aggregates). A client channel maps to one or more prefixes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Client-facing subscription channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamChannel {
    Quote,
    Trade,
    Aggregate,
}

impl StreamChannel {
    pub const ALL: [StreamChannel; 3] = [
        StreamChannel::Quote,
        StreamChannel::Trade,
        StreamChannel::Aggregate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamChannel::Quote => "quote",
            StreamChannel::Trade => "trade",
            StreamChannel::Aggregate => "aggregate",
        }
    }

    /// Parse a normalized channel name.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "quote" => Some(StreamChannel::Quote),
            "trade" => Some(StreamChannel::Trade),
            "aggregate" => Some(StreamChannel::Aggregate),
            _ => None,
        }
    }

    /// Vendor event prefixes carried by this channel.
    pub fn event_prefixes(&self) -> &'static [&'static str] {
        match self {
            StreamChannel::Quote => &["Q"],
            StreamChannel::Trade => &["T"],
            StreamChannel::Aggregate => &["A", "AM"],
        }
    }
}

impl fmt::Display for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the vendor/broker topic set for a symbol/channel combination.
pub fn build_topics<'a, S, C>(symbols: S, channels: C) -> BTreeSet<String>
where
    S: IntoIterator<Item = &'a String>,
    C: IntoIterator<Item = StreamChannel> + Clone,
{
    let mut topics = BTreeSet::new();
    for symbol in symbols {
        for channel in channels.clone() {
            for prefix in channel.event_prefixes() {
                topics.insert(format!("{prefix}.{symbol}"));
            }
        }
    }
    topics
}

/// Envelope type discriminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    SystemStatus,
    SystemError,
    SystemPing,
    Market(StreamChannel),
    Unknown,
}

/// JSON envelope exchanged on the shared broker channel and with stream
/// clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub ts: String,
    pub source: String,
    pub data: Value,
}

impl BusMessage {
    fn new(message_type: impl Into<String>, data: Value) -> Self {
        Self {
            message_type: message_type.into(),
            ts: utc_now_iso(),
            source: "WS".to_string(),
            data,
        }
    }

    pub fn system_status(
        latency: &str,
        connection_state: &str,
        message: Option<&str>,
    ) -> Self {
        let mut data = json!({
            "latency": latency,
            "connection_state": connection_state,
        });
        if let Some(text) = message {
            data["message"] = json!(text);
        }
        Self::new("system.status", data)
    }

    pub fn system_error(code: &str, message: &str) -> Self {
        Self::new("system.error", json!({ "code": code, "message": message }))
    }

    pub fn system_ping() -> Self {
        Self::new("system.ping", json!({}))
    }

    pub fn market(channel: StreamChannel, data: Value) -> Self {
        Self::new(format!("market.{}", channel.as_str()), data)
    }

    pub fn kind(&self) -> MessageKind {
        match self.message_type.trim().to_ascii_lowercase().as_str() {
            "system.status" => MessageKind::SystemStatus,
            "system.error" => MessageKind::SystemError,
            "system.ping" => MessageKind::SystemPing,
            other => match other.strip_prefix("market.") {
                Some(channel) => match StreamChannel::parse(channel) {
                    Some(channel) => MessageKind::Market(channel),
                    None => MessageKind::Unknown,
                },
                None => MessageKind::Unknown,
            },
        }
    }

    /// Symbol carried in the data payload, normalized to uppercase.
    pub fn symbol(&self) -> Option<String> {
        let symbol = self.data.get("symbol")?.as_str()?.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            None
        } else {
            Some(symbol)
        }
    }
}

/// Current UTC time as ISO-8601 with a `Z` suffix (envelope `ts` format).
pub fn utc_now_iso() -> String {
    format_iso(Utc::now())
}

/// Format a UTC instant as ISO-8601 with a `Z` suffix.
pub fn format_iso(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}
