//! Latency-mode channel policy
//!
//! When the realtime entitlement is off, quotes are withheld and every
//! status advertised to clients is coerced to the delayed mode.

use std::collections::BTreeSet;
use types::stream::StreamChannel;

/// Channels a client may subscribe to in the given latency mode.
pub fn allowed_stream_channels(realtime_enabled: bool) -> BTreeSet<StreamChannel> {
    let mut channels = BTreeSet::from([StreamChannel::Trade, StreamChannel::Aggregate]);
    if realtime_enabled {
        channels.insert(StreamChannel::Quote);
    }
    channels
}

/// Channels a new connection starts with.
pub fn default_stream_channels(realtime_enabled: bool) -> BTreeSet<StreamChannel> {
    allowed_stream_channels(realtime_enabled)
}

pub fn normalized_delay_minutes(delay_minutes: u32) -> u32 {
    delay_minutes.max(1)
}

/// Human message attached to delayed-mode statuses.
pub fn delayed_latency_message(delay_minutes: u32) -> String {
    format!("delayed {}min", normalized_delay_minutes(delay_minutes))
}
