//! Per-connection stream session state
//!
//! Tracks the desired subscription and drives the application-level
//! heartbeat. All timing decisions take an explicit [`Instant`] so the
//! state machine is testable without sleeping.

use serde_json::Value;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use types::errors::{StreamError, StreamErrorCode};
use types::stream::StreamChannel;
use types::symbol::normalize_ticker;

const MIN_SLEEP: Duration = Duration::from_millis(50);

/// A parsed client control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAction {
    pub action: String,
    pub symbols: BTreeSet<String>,
    pub channels: BTreeSet<StreamChannel>,
}

/// Result of applying a client action to the session.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    /// Whether the desired subscription changed and must be pushed to
    /// the hub.
    pub changed: bool,
    pub symbols: BTreeSet<String>,
    pub channels: BTreeSet<StreamChannel>,
    pub error: Option<StreamError>,
}

/// What the heartbeat loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatDecision {
    pub should_close: bool,
    pub should_send_ping: bool,
    pub sleep: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_symbols: usize,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub ping_max_misses: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_symbols: 100,
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
            ping_max_misses: 2,
        }
    }
}

pub struct StreamSession {
    max_symbols: usize,
    ping_interval: Duration,
    ping_timeout: Duration,
    ping_max_misses: u32,
    heartbeat_check_interval: Duration,

    desired_symbols: BTreeSet<String>,
    desired_channels: BTreeSet<StreamChannel>,

    last_client_ping_at: Instant,
    last_server_ping_at: Option<Instant>,
    ping_deadline_at: Option<Instant>,
    next_ping_at: Instant,
    missed_ping_acks: u32,
}

impl StreamSession {
    pub fn new(config: SessionConfig, now: Instant) -> Self {
        let ping_interval = config.ping_interval.max(Duration::from_secs(1));
        let ping_timeout = config.ping_timeout.max(Duration::from_secs(1));
        let heartbeat_check_interval =
            (ping_timeout / 2).clamp(Duration::from_millis(200), Duration::from_secs(1));

        Self {
            max_symbols: config.max_symbols.max(1),
            ping_interval,
            ping_timeout,
            ping_max_misses: config.ping_max_misses.max(1),
            heartbeat_check_interval,
            desired_symbols: BTreeSet::new(),
            desired_channels: StreamChannel::ALL.into_iter().collect(),
            last_client_ping_at: now,
            last_server_ping_at: None,
            ping_deadline_at: None,
            next_ping_at: now + ping_interval,
            missed_ping_acks: 0,
        }
    }

    pub fn symbols(&self) -> BTreeSet<String> {
        self.desired_symbols.clone()
    }

    pub fn channels(&self) -> BTreeSet<StreamChannel> {
        self.desired_channels.clone()
    }

    /// Apply one client action against the caller's symbol allow-list.
    ///
    /// A non-empty channel list always replaces the desired channel set,
    /// even when the action itself is rejected. Unsubscribes take effect
    /// unconditionally; subscribes are validated against the allow-list
    /// and the per-connection cap before being unioned in.
    pub fn apply_action(
        &mut self,
        action: &ClientAction,
        allowed_symbols: &BTreeSet<String>,
        now: Instant,
    ) -> ActionOutcome {
        if !action.channels.is_empty() {
            self.desired_channels = action.channels.clone();
        }

        match action.action.as_str() {
            "ping" | "pong" => {
                self.touch_client_ping(now);
                self.outcome(false, None)
            }
            "unsubscribe" => {
                self.desired_symbols = self
                    .desired_symbols
                    .difference(&action.symbols)
                    .cloned()
                    .collect();
                self.outcome(true, None)
            }
            "subscribe" => {
                if action.symbols.is_empty() {
                    return self.outcome(
                        false,
                        Some(StreamError::new(
                            StreamErrorCode::InvalidAction,
                            "subscribe requires symbols",
                        )),
                    );
                }

                let not_allowed: Vec<&String> = action
                    .symbols
                    .difference(allowed_symbols)
                    .collect();
                if !not_allowed.is_empty() {
                    let blocked = not_allowed
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(",");
                    return self.outcome(
                        false,
                        Some(StreamError::new(
                            StreamErrorCode::SymbolNotAllowed,
                            format!("symbols not in watchlist: {blocked}"),
                        )),
                    );
                }

                let next_symbols: BTreeSet<String> = self
                    .desired_symbols
                    .union(&action.symbols)
                    .cloned()
                    .collect();
                if next_symbols.len() > self.max_symbols {
                    return self.outcome(
                        false,
                        Some(StreamError::new(
                            StreamErrorCode::SubscriptionLimitExceeded,
                            format!("max {} symbols per connection", self.max_symbols),
                        )),
                    );
                }

                self.desired_symbols = next_symbols;
                self.outcome(true, None)
            }
            other => self.outcome(
                false,
                Some(StreamError::new(
                    StreamErrorCode::InvalidAction,
                    format!("unsupported action: {other}"),
                )),
            ),
        }
    }

    /// Record liveness from any client ping/pong.
    pub fn touch_client_ping(&mut self, now: Instant) {
        self.last_client_ping_at = now;
    }

    /// Evaluate the heartbeat state machine.
    ///
    /// An outstanding server ping is acknowledged by any client ping at
    /// or after it; an unanswered ping past its deadline counts one miss,
    /// and too many misses close the connection.
    pub fn heartbeat_decision(&mut self, now: Instant) -> HeartbeatDecision {
        let mut should_close = false;

        if let (Some(server_ping_at), Some(deadline_at)) =
            (self.last_server_ping_at, self.ping_deadline_at)
        {
            if self.last_client_ping_at >= server_ping_at {
                self.missed_ping_acks = 0;
                self.last_server_ping_at = None;
                self.ping_deadline_at = None;
            } else if now >= deadline_at {
                self.missed_ping_acks += 1;
                self.last_server_ping_at = None;
                self.ping_deadline_at = None;
                if self.missed_ping_acks >= self.ping_max_misses {
                    should_close = true;
                }
            }
        }

        let should_send_ping = now >= self.next_ping_at;
        let until_next_ping = self.next_ping_at.saturating_duration_since(now);
        let sleep = self
            .heartbeat_check_interval
            .min(until_next_ping.max(MIN_SLEEP));

        HeartbeatDecision {
            should_close,
            should_send_ping,
            sleep,
        }
    }

    /// Record an outgoing server ping: arm the ack deadline and schedule
    /// the next ping.
    pub fn mark_ping_sent(&mut self, sent_at: Instant) {
        self.last_server_ping_at = Some(sent_at);
        self.ping_deadline_at = Some(sent_at + self.ping_timeout);
        self.next_ping_at = sent_at + self.ping_interval;
    }

    fn outcome(&self, changed: bool, error: Option<StreamError>) -> ActionOutcome {
        ActionOutcome {
            changed,
            symbols: self.symbols(),
            channels: self.channels(),
            error,
        }
    }
}

/// Parse a raw client control frame.
///
/// Returns `None` for frames that cannot be interpreted at all: invalid
/// JSON, a missing action, or a malformed channel list. Invalid symbols
/// are silently dropped rather than rejected.
pub fn parse_stream_action(raw: &str) -> Option<ClientAction> {
    let payload: Value = serde_json::from_str(raw).ok()?;
    let object = payload.as_object()?;

    let action = object
        .get("action")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if action.is_empty() {
        return None;
    }

    let channels = parse_channels(object.get("channels"))?;
    Some(ClientAction {
        action,
        symbols: parse_symbols(object.get("symbols")),
        channels,
    })
}

fn parse_symbols(raw: Option<&Value>) -> BTreeSet<String> {
    let Some(Value::Array(items)) = raw else {
        return BTreeSet::new();
    };
    items
        .iter()
        .filter_map(|item| item.as_str())
        .filter_map(normalize_ticker)
        .collect()
}

fn parse_channels(raw: Option<&Value>) -> Option<BTreeSet<StreamChannel>> {
    let raw = match raw {
        None | Some(Value::Null) => return Some(BTreeSet::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return None,
    };

    let mut channels = BTreeSet::new();
    for item in raw {
        let text = item.as_str().unwrap_or_default().trim();
        if text.is_empty() {
            continue;
        }
        channels.insert(StreamChannel::parse(text)?);
    }
    Some(channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(symbols: &[&str]) -> BTreeSet<String> {
        symbols.iter().map(|s| s.to_string()).collect()
    }

    fn subscribe(symbols: &[&str]) -> ClientAction {
        ClientAction {
            action: "subscribe".to_string(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            channels: BTreeSet::new(),
        }
    }

    fn session(max_symbols: usize) -> (StreamSession, Instant) {
        let now = Instant::now();
        let config = SessionConfig {
            max_symbols,
            ..SessionConfig::default()
        };
        (StreamSession::new(config, now), now)
    }

    #[test]
    fn test_subscribe_unions_symbols() {
        let (mut session, now) = session(10);
        let watchlist = allowed(&["AAPL", "MSFT", "NVDA"]);

        let outcome = session.apply_action(&subscribe(&["AAPL"]), &watchlist, now);
        assert!(outcome.changed);
        assert!(outcome.error.is_none());

        let outcome = session.apply_action(&subscribe(&["MSFT"]), &watchlist, now);
        assert_eq!(outcome.symbols, allowed(&["AAPL", "MSFT"]));
    }

    #[test]
    fn test_subscribe_rejections() {
        let (mut session, now) = session(2);
        let watchlist = allowed(&["AAPL", "MSFT", "NVDA"]);

        let empty = session.apply_action(&subscribe(&[]), &watchlist, now);
        assert_eq!(
            empty.error.as_ref().map(|e| e.code),
            Some(StreamErrorCode::InvalidAction)
        );

        let blocked = session.apply_action(&subscribe(&["TSLA"]), &watchlist, now);
        assert_eq!(
            blocked.error.as_ref().map(|e| e.code),
            Some(StreamErrorCode::SymbolNotAllowed)
        );

        session.apply_action(&subscribe(&["AAPL", "MSFT"]), &watchlist, now);
        let capped = session.apply_action(&subscribe(&["NVDA"]), &watchlist, now);
        assert_eq!(
            capped.error.as_ref().map(|e| e.code),
            Some(StreamErrorCode::SubscriptionLimitExceeded)
        );
        // Rejected subscribes leave the desired set unchanged.
        assert_eq!(session.symbols(), allowed(&["AAPL", "MSFT"]));
    }

    #[test]
    fn test_unsubscribe_is_unconditional() {
        let (mut session, now) = session(10);
        let watchlist = allowed(&["AAPL", "MSFT"]);
        session.apply_action(&subscribe(&["AAPL", "MSFT"]), &watchlist, now);

        let action = ClientAction {
            action: "unsubscribe".to_string(),
            symbols: allowed(&["MSFT", "TSLA"]),
            channels: BTreeSet::new(),
        };
        let outcome = session.apply_action(&action, &watchlist, now);
        assert!(outcome.changed);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.symbols, allowed(&["AAPL"]));
    }

    #[test]
    fn test_channel_list_replaces_even_on_rejection() {
        let (mut session, now) = session(10);
        let mut action = subscribe(&[]);
        action.channels = BTreeSet::from([StreamChannel::Trade]);

        let outcome = session.apply_action(&action, &BTreeSet::new(), now);
        assert!(outcome.error.is_some());
        assert_eq!(session.channels(), BTreeSet::from([StreamChannel::Trade]));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let (mut session, now) = session(10);
        let action = ClientAction {
            action: "snapshot".to_string(),
            symbols: BTreeSet::new(),
            channels: BTreeSet::new(),
        };
        let outcome = session.apply_action(&action, &BTreeSet::new(), now);
        assert!(!outcome.changed);
        assert_eq!(
            outcome.error.map(|e| e.code),
            Some(StreamErrorCode::InvalidAction)
        );
    }

    #[test]
    fn test_heartbeat_ack_resets_misses() {
        let (mut session, now) = session(10);
        session.mark_ping_sent(now);

        // Client answers before the deadline.
        session.touch_client_ping(now + Duration::from_secs(1));
        let decision = session.heartbeat_decision(now + Duration::from_secs(2));
        assert!(!decision.should_close);
    }

    #[test]
    fn test_heartbeat_closes_after_max_misses() {
        let (mut session, now) = session(10);
        let config_timeout = Duration::from_secs(10);

        session.mark_ping_sent(now);
        let decision = session.heartbeat_decision(now + config_timeout + Duration::from_secs(1));
        // First miss: deadline passed without a client ping.
        assert!(!decision.should_close);

        let second_ping_at = now + Duration::from_secs(20);
        session.mark_ping_sent(second_ping_at);
        let decision =
            session.heartbeat_decision(second_ping_at + config_timeout + Duration::from_secs(1));
        assert!(decision.should_close);
    }

    #[test]
    fn test_heartbeat_schedules_ping() {
        let (mut session, now) = session(10);
        let before = session.heartbeat_decision(now + Duration::from_secs(1));
        assert!(!before.should_send_ping);

        let due = session.heartbeat_decision(now + Duration::from_secs(21));
        assert!(due.should_send_ping);
        assert!(due.sleep >= MIN_SLEEP);
    }

    #[test]
    fn test_parse_stream_action() {
        let action = parse_stream_action(
            r#"{"action": " Subscribe ", "symbols": ["aapl", "bad ticker", ""], "channels": ["trade"]}"#,
        )
        .unwrap();
        assert_eq!(action.action, "subscribe");
        assert_eq!(action.symbols, allowed(&["AAPL"]));
        assert_eq!(action.channels, BTreeSet::from([StreamChannel::Trade]));

        // Malformed frames are unparseable, not errors.
        assert!(parse_stream_action("not json").is_none());
        assert!(parse_stream_action(r#"{"symbols": []}"#).is_none());
        assert!(parse_stream_action(r#"{"action": "subscribe", "channels": "trade"}"#).is_none());
        assert!(parse_stream_action(r#"{"action": "subscribe", "channels": ["book"]}"#).is_none());

        // Missing channels means "keep current".
        let keep = parse_stream_action(r#"{"action": "ping"}"#).unwrap();
        assert!(keep.channels.is_empty());
    }
}
