//! Market Stream Service
//!
//! Moves live market events from the upstream vendor feed to websocket
//! clients across a cluster of gateway instances:
//!
//! ```text
//!  vendor feed ──► publisher ──► shared bus (pub/sub) ──► hub ──► clients
//!                     ▲                                    │
//!                     └────── topic registry (TTL keys) ◄──┘
//! ```
//!
//! Each gateway hub advertises the union of its clients' topics in the
//! registry; the single publisher process reconciles the cluster-wide
//! union against the upstream subscription and republishes every event
//! onto the bus. Hubs fan bus messages out to per-connection queues that
//! drop the oldest message under backpressure.

pub mod bus;
pub mod feed;
pub mod hub;
pub mod messages;
pub mod policy;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod session;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
