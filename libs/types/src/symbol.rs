//! Ticker symbol normalization and validation
//!
//! Tickers are uppercase US equity symbols, letters and dots only, at most
//! 15 characters (e.g. `AAPL`, `BRK.B`).

/// Maximum ticker length accepted anywhere in the platform.
pub const MAX_TICKER_LEN: usize = 15;

/// Check whether an already-normalized ticker is valid.
pub fn is_valid_ticker(ticker: &str) -> bool {
    !ticker.is_empty()
        && ticker.len() <= MAX_TICKER_LEN
        && ticker.chars().all(|c| c.is_ascii_uppercase() || c == '.')
}

/// Trim and uppercase a raw ticker, returning `None` if the result is not a
/// valid symbol.
pub fn normalize_ticker(raw: &str) -> Option<String> {
    let ticker = raw.trim().to_ascii_uppercase();
    if is_valid_ticker(&ticker) {
        Some(ticker)
    } else {
        None
    }
}
