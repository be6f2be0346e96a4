//! Request guardrails for bar queries

use chrono::NaiveDate;
use types::bar::Timespan;

/// Minute-aggregate multipliers served from the precomputed tier.
pub const SUPPORTED_MINUTE_AGG_MULTIPLIERS: [u32; 3] = [5, 15, 60];

pub const MIN_MULTIPLIER: u32 = 1;
pub const MAX_MULTIPLIER: u32 = 60;

/// Upper bound on the estimated number of bars one query may produce.
pub const MAX_ESTIMATED_POINTS: i64 = 5_000;

pub fn is_valid_multiplier(multiplier: u32) -> bool {
    (MIN_MULTIPLIER..=MAX_MULTIPLIER).contains(&multiplier)
}

pub fn is_supported_minute_agg_multiplier(multiplier: u32) -> bool {
    SUPPORTED_MINUTE_AGG_MULTIPLIERS.contains(&multiplier)
}

/// Estimate the number of points in a date range and check it against the
/// ceiling. A single-day range is never too large.
pub fn is_range_too_large(
    timespan: Timespan,
    multiplier: u32,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> bool {
    let days = (end_date - start_date).num_days();
    if days <= 0 {
        return false;
    }

    let multiplier = i64::from(multiplier.max(1));
    let estimated_points = match timespan {
        Timespan::Minute => days * 24 * 60 / multiplier,
        Timespan::Day => days / multiplier,
    };
    estimated_points > MAX_ESTIMATED_POINTS
}
