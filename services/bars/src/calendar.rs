//! Regular-session calendar for US equities
//!
//! All bucket math is done in exchange-local time (America/New_York) so
//! that buckets stay aligned to the 09:30 open across DST transitions,
//! then converted back to UTC at the edges.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;

/// Exchange timezone for the regular session.
pub const MARKET_TZ: Tz = New_York;

/// Regular session open, exchange-local.
pub fn session_open_time() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).unwrap()
}

/// Regular session close, exchange-local.
pub fn session_close_time() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).unwrap()
}

/// Trade date a UTC instant belongs to (its exchange-local calendar date).
pub fn market_trade_date(point: DateTime<Utc>) -> NaiveDate {
    point.with_timezone(&MARKET_TZ).date_naive()
}

/// Convert a UTC instant to exchange-local time.
pub fn as_market_time(point: DateTime<Utc>) -> DateTime<Tz> {
    point.with_timezone(&MARKET_TZ)
}

/// Regular session bounds for a trade date, exchange-local.
pub fn session_bounds(trade_date: NaiveDate) -> (DateTime<Tz>, DateTime<Tz>) {
    (
        localize(trade_date, session_open_time()),
        localize(trade_date, session_close_time()),
    )
}

/// Resolve a local wall-clock time on a trade date to an exchange-local
/// instant. Session times never fall inside the 02:00 DST gap, so the
/// ambiguous/missing branches only defend against pathological inputs.
fn localize(trade_date: NaiveDate, time: NaiveTime) -> DateTime<Tz> {
    let naive = trade_date.and_time(time);
    match MARKET_TZ.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(earliest, _) => earliest,
        chrono::LocalResult::None => MARKET_TZ.from_utc_datetime(&naive),
    }
}
