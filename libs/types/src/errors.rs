//! Error taxonomy shared across the platform
//!
//! Every error that can cross a service boundary carries a stable wire
//! code (`MARKET_DATA_*` for the bar service, `STREAM_*` for the live
//! layer) so clients can branch on codes instead of message text.

use thiserror::Error;

/// Errors raised by the tiered bar service and its vendor client.
#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("invalid ticker: {0}")]
    InvalidTicker(String),

    #[error("unsupported timespan: {0}")]
    InvalidTimespan(String),

    #[error("unsupported multiplier {multiplier} for timespan {timespan}")]
    InvalidMultiplier { timespan: String, multiplier: u32 },

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("requested range too large: {0}")]
    RangeTooLarge(String),

    #[error("vendor rate limited: {0}")]
    RateLimited(String),

    #[error("vendor unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("storage failure: {0}")]
    Store(String),
}

impl MarketDataError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            MarketDataError::InvalidTicker(_) => "MARKET_DATA_INVALID_TICKER",
            MarketDataError::InvalidTimespan(_) => "MARKET_DATA_INVALID_TIMESPAN",
            MarketDataError::InvalidMultiplier { .. } => "MARKET_DATA_INVALID_MULTIPLIER",
            MarketDataError::InvalidRange(_) => "MARKET_DATA_INVALID_RANGE",
            MarketDataError::RangeTooLarge(_) => "MARKET_DATA_RANGE_TOO_LARGE",
            MarketDataError::RateLimited(_) => "MARKET_DATA_RATE_LIMITED",
            MarketDataError::UpstreamUnavailable(_) => "MARKET_DATA_UPSTREAM_UNAVAILABLE",
            MarketDataError::Store(_) => "MARKET_DATA_STORE_FAILURE",
        }
    }

    /// Classify a vendor failure message: rate-limit wording maps to
    /// `RateLimited`, everything else to `UpstreamUnavailable`.
    pub fn from_vendor_detail(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let lowered = detail.to_ascii_lowercase();
        if lowered.contains("rate limit") || lowered.contains("429") {
            MarketDataError::RateLimited(detail)
        } else {
            MarketDataError::UpstreamUnavailable(detail)
        }
    }
}

/// Stream action rejection codes, sent inside `system.error` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCode {
    InvalidAction,
    SymbolNotAllowed,
    SubscriptionLimitExceeded,
    ChannelNotAllowed,
    ConnectionNotFound,
    UpstreamUnavailable,
}

impl StreamErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamErrorCode::InvalidAction => "STREAM_INVALID_ACTION",
            StreamErrorCode::SymbolNotAllowed => "STREAM_SYMBOL_NOT_ALLOWED",
            StreamErrorCode::SubscriptionLimitExceeded => "STREAM_SUBSCRIPTION_LIMIT_EXCEEDED",
            StreamErrorCode::ChannelNotAllowed => "STREAM_CHANNEL_NOT_ALLOWED",
            StreamErrorCode::ConnectionNotFound => "STREAM_CONNECTION_NOT_FOUND",
            StreamErrorCode::UpstreamUnavailable => "STREAM_UPSTREAM_UNAVAILABLE",
        }
    }
}

/// A rejected stream action with its wire code and a human message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{}: {}", self.code.as_str(), self.message)]
pub struct StreamError {
    pub code: StreamErrorCode,
    pub message: String,
}

impl StreamError {
    pub fn new(code: StreamErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_error_codes() {
        assert_eq!(
            MarketDataError::RangeTooLarge("too much".into()).code(),
            "MARKET_DATA_RANGE_TOO_LARGE"
        );
        assert_eq!(
            MarketDataError::Store("db down".into()).code(),
            "MARKET_DATA_STORE_FAILURE"
        );
    }

    #[test]
    fn test_vendor_detail_classification() {
        assert!(matches!(
            MarketDataError::from_vendor_detail("Rate Limit hit"),
            MarketDataError::RateLimited(_)
        ));
        assert!(matches!(
            MarketDataError::from_vendor_detail("HTTP 429 from upstream"),
            MarketDataError::RateLimited(_)
        ));
        assert!(matches!(
            MarketDataError::from_vendor_detail("connection refused"),
            MarketDataError::UpstreamUnavailable(_)
        ));
    }

    #[test]
    fn test_stream_error_display() {
        let err = StreamError::new(StreamErrorCode::SymbolNotAllowed, "symbol ZZZ not allowed");
        assert_eq!(
            err.to_string(),
            "STREAM_SYMBOL_NOT_ALLOWED: symbol ZZZ not allowed"
        );
    }
}
