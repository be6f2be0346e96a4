//! Market Bars Service
//!
//! Serves OHLCV bars from tiered storage, falling back to the vendor REST
//! aggregates API when local coverage is missing:
//!
//! ```text
//!            list_bars
//!                │
//!        ┌───────┴────────┐
//!        │ route by       │
//!        │ timespan/mult  │
//!        └───┬───┬───┬────┘
//!            │   │   │
//!        day×1 min×1 min×{5,15,60}      anything else
//!            │   │   │                       │
//!         baseline tiers   agg tier + open bucket   direct vendor
//!                │               │
//!          coverage miss → vendor fetch → upsert → re-read
//! ```
//!
//! Aggregate buckets are aligned to the regular US equity session
//! (09:30–16:00 America/New_York); the open bucket is recomputed from
//! minute rows on every read and never persisted as final.

pub mod aggregation;
pub mod calendar;
pub mod policy;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod vendor;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
