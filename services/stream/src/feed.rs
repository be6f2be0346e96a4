//! Upstream vendor feed connection
//!
//! Maintains one websocket to the vendor tick feed: authenticate, then
//! keep the upstream subscription reconciled against the desired topic
//! set while forwarding event batches. Reconnects with doubling backoff
//! (1s up to the configured cap) and resets the backoff after a
//! successful connect.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream connection lifecycle, as surfaced on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Connecting,
    Connected,
    Disconnected,
    AuthFailed,
    Error,
}

impl FeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedState::Connecting => "connecting",
            FeedState::Connected => "connected",
            FeedState::Disconnected => "disconnected",
            FeedState::AuthFailed => "auth_failed",
            FeedState::Error => "error",
        }
    }
}

/// What the feed worker reports to its consumer.
#[derive(Debug, Clone)]
pub enum FeedUpdate {
    /// A batch of raw market events.
    Events(Vec<Value>),
    Status {
        state: FeedState,
        message: Option<String>,
    },
}

/// Control surface the publisher drives.
#[async_trait]
pub trait UpstreamLink: Send + Sync {
    async fn start(&self);
    async fn stop(&self);
    async fn set_topics(&self, topics: BTreeSet<String>);
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub api_key: String,
    pub reconnect_max: Duration,
}

impl FeedConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
enum FeedError {
    #[error(transparent)]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("upstream auth timeout")]
    AuthTimeout,

    #[error("upstream auth failed: {0}")]
    AuthFailed(String),

    #[error("upstream connection closed")]
    ConnectionClosed,
}

enum ConnectionEnd {
    Stopped,
}

pub struct FeedClient {
    config: FeedConfig,
    desired: Arc<Mutex<BTreeSet<String>>>,
    topic_notify: Arc<Notify>,
    updates: mpsc::Sender<FeedUpdate>,
    task: tokio::sync::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl FeedClient {
    pub fn new(config: FeedConfig, updates: mpsc::Sender<FeedUpdate>) -> Self {
        Self {
            config,
            desired: Arc::new(Mutex::new(BTreeSet::new())),
            topic_notify: Arc::new(Notify::new()),
            updates,
            task: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl UpstreamLink for FeedClient {
    async fn start(&self) {
        let mut task = self.task.lock().await;
        if let Some((_, handle)) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = FeedWorker {
            config: self.config.clone(),
            desired: self.desired.clone(),
            topic_notify: self.topic_notify.clone(),
            updates: self.updates.clone(),
            stop: stop_rx,
        };
        *task = Some((stop_tx, tokio::spawn(worker.run())));
    }

    async fn stop(&self) {
        let taken = self.task.lock().await.take();
        let Some((stop_tx, handle)) = taken else {
            return;
        };
        let _ = stop_tx.send(true);
        self.topic_notify.notify_waiters();
        let _ = handle.await;
    }

    async fn set_topics(&self, topics: BTreeSet<String>) {
        let normalized: BTreeSet<String> = topics
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        {
            let mut desired = self.desired.lock().unwrap_or_else(|e| e.into_inner());
            *desired = normalized;
        }
        // notify_one stores a permit, so an update that lands while the
        // worker is mid-frame (no waiter registered) is still observed on
        // its next pass. Repeats coalesce; reconcile reads the latest set.
        self.topic_notify.notify_one();
    }
}

struct FeedWorker {
    config: FeedConfig,
    desired: Arc<Mutex<BTreeSet<String>>>,
    topic_notify: Arc<Notify>,
    updates: mpsc::Sender<FeedUpdate>,
    stop: watch::Receiver<bool>,
}

impl FeedWorker {
    async fn run(mut self) {
        let mut reconnect_delay = Duration::from_secs(1);

        while !*self.stop.borrow() {
            self.emit_status(FeedState::Connecting, None).await;
            match connect_async(self.config.url.as_str()).await {
                Ok((ws, _)) => match self.drive_connection(ws, &mut reconnect_delay).await {
                    Ok(ConnectionEnd::Stopped) => break,
                    Err(error) => {
                        self.emit_status(FeedState::Disconnected, Some(error.to_string()))
                            .await;
                    }
                },
                Err(error) => {
                    self.emit_status(FeedState::Disconnected, Some(error.to_string()))
                        .await;
                }
            }

            if *self.stop.borrow() {
                break;
            }
            let mut stop = self.stop.clone();
            tokio::select! {
                _ = tokio::time::sleep(reconnect_delay) => {
                    reconnect_delay = (reconnect_delay * 2).min(self.config.reconnect_max);
                }
                _ = stop.changed() => break,
            }
        }
        info!("upstream feed worker stopped");
    }

    async fn drive_connection(
        &mut self,
        ws: WsStream,
        reconnect_delay: &mut Duration,
    ) -> Result<ConnectionEnd, FeedError> {
        let (mut sink, mut source) = ws.split();

        self.authenticate(&mut sink, &mut source).await?;
        self.emit_status(FeedState::Connected, None).await;
        *reconnect_delay = Duration::from_secs(1);

        // The upstream holds no subscriptions after a reconnect.
        let mut active: BTreeSet<String> = BTreeSet::new();
        self.reconcile(&mut sink, &mut active).await?;

        loop {
            let mut stop = self.stop.clone();
            tokio::select! {
                _ = self.topic_notify.notified() => {
                    self.reconcile(&mut sink, &mut active).await?;
                }
                frame = source.next() => {
                    let frame = frame.ok_or(FeedError::ConnectionClosed)??;
                    match frame {
                        Message::Text(text) => self.handle_frame(text.as_str()).await?,
                        Message::Ping(payload) => sink.send(Message::Pong(payload)).await?,
                        Message::Close(_) => return Err(FeedError::ConnectionClosed),
                        _ => {}
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(ConnectionEnd::Stopped);
                    }
                }
            }
        }
    }

    async fn authenticate(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
    ) -> Result<(), FeedError> {
        let auth = json!({"action": "auth", "params": self.config.api_key});
        sink.send(Message::Text(auth.to_string().into())).await?;

        let wait_for_ack = async {
            loop {
                let frame = source.next().await.ok_or(FeedError::ConnectionClosed)??;
                let Message::Text(text) = frame else {
                    continue;
                };
                for item in parse_frame_payload(text.as_str()) {
                    if event_code(&item) != "status" {
                        continue;
                    }
                    let status = field_str(&item, "status").to_ascii_lowercase();
                    if status == "auth_success" {
                        return Ok(());
                    }
                    if status == "auth_failed" {
                        let message = field_str(&item, "message");
                        let message = if message.is_empty() {
                            "upstream auth failed".to_string()
                        } else {
                            message
                        };
                        return Err(FeedError::AuthFailed(message));
                    }
                }
            }
        };
        tokio::time::timeout(AUTH_TIMEOUT, wait_for_ack)
            .await
            .map_err(|_| FeedError::AuthTimeout)?
    }

    /// Push subscribe/unsubscribe deltas for the desired topic set.
    async fn reconcile(
        &self,
        sink: &mut WsSink,
        active: &mut BTreeSet<String>,
    ) -> Result<(), FeedError> {
        let desired = self
            .desired
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let to_subscribe: Vec<&String> = desired.difference(active).collect();
        let to_unsubscribe: Vec<&String> = active.difference(&desired).collect();

        if !to_subscribe.is_empty() {
            let params = join_topics(&to_subscribe);
            debug!(%params, "subscribing upstream topics");
            let frame = json!({"action": "subscribe", "params": params});
            sink.send(Message::Text(frame.to_string().into())).await?;
        }
        if !to_unsubscribe.is_empty() {
            let params = join_topics(&to_unsubscribe);
            debug!(%params, "unsubscribing upstream topics");
            let frame = json!({"action": "unsubscribe", "params": params});
            sink.send(Message::Text(frame.to_string().into())).await?;
        }
        *active = desired;
        Ok(())
    }

    async fn handle_frame(&self, raw: &str) -> Result<(), FeedError> {
        let mut events: Vec<Value> = Vec::new();
        for item in parse_frame_payload(raw) {
            if event_code(&item) == "status" {
                let status = field_str(&item, "status").to_ascii_lowercase();
                let message = field_str(&item, "message");
                if status == "auth_failed" {
                    let message = if message.is_empty() {
                        "upstream auth failed".to_string()
                    } else {
                        message
                    };
                    self.emit_status(FeedState::AuthFailed, Some(message.clone()))
                        .await;
                    return Err(FeedError::AuthFailed(message));
                }
                if status == "error" || status == "denied" {
                    let message = if message.is_empty() {
                        "upstream status error".to_string()
                    } else {
                        message
                    };
                    self.emit_status(FeedState::Error, Some(message)).await;
                }
                continue;
            }
            events.push(item);
        }

        if !events.is_empty() {
            let _ = self.updates.send(FeedUpdate::Events(events)).await;
        }
        Ok(())
    }

    async fn emit_status(&self, state: FeedState, message: Option<String>) {
        if self
            .updates
            .send(FeedUpdate::Status { state, message })
            .await
            .is_err()
        {
            warn!("feed update consumer gone");
        }
    }
}

/// Upstream frames are JSON arrays of event objects; a single object is
/// treated as a one-element batch, anything else is dropped.
fn parse_frame_payload(raw: &str) -> Vec<Value> {
    let Ok(decoded) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    match decoded {
        Value::Object(_) => vec![decoded],
        Value::Array(items) => items
            .into_iter()
            .filter(|item| item.is_object())
            .collect(),
        _ => Vec::new(),
    }
}

fn event_code(item: &Value) -> String {
    field_str(item, "ev").to_ascii_lowercase()
}

fn field_str(item: &Value, key: &str) -> String {
    item.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn join_topics(topics: &[&String]) -> String {
    topics
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(",")
}
