//! Types library for the market data platform
//!
//! This library provides the core type definitions shared across the bar
//! service, the streaming layer, and the gateway.
//!
//! # Modules
//! - `bar`: OHLCV market bars, timespans, provenance tags
//! - `stream`: streaming channels, fan-out topics, bus message envelope
//! - `symbol`: ticker normalization and validation
//! - `errors`: error taxonomy

pub mod bar;
pub mod errors;
pub mod stream;
pub mod symbol;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bar::*;
    pub use crate::errors::*;
    pub use crate::stream::*;
    pub use crate::symbol::*;
}
