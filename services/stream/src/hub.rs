//! Gateway-side fan-out hub
//!
//! Owns every websocket connection on this instance: per-connection
//! outbound queues, the reference-counted topic union advertised to the
//! cluster registry, and the shared bus listener. The listener and the
//! registry keepalive run only while at least one connection is open.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::errors::{StreamError, StreamErrorCode};
use types::stream::{build_topics, BusMessage, MessageKind, StreamChannel};
use types::symbol::normalize_ticker;

use crate::bus::MarketEventSubscriber;
use crate::policy::{
    allowed_stream_channels, default_stream_channels, delayed_latency_message,
    normalized_delay_minutes,
};
use crate::queue::OutboundQueue;
use crate::registry::TopicRegistry;

const MIN_QUEUE_SIZE: usize = 64;
const MIN_REGISTRY_REFRESH: Duration = Duration::from_secs(5);
const LISTENER_BACKOFF_START: Duration = Duration::from_secs(1);
const LISTENER_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub instance_id: String,
    pub max_symbols_per_connection: usize,
    pub queue_size: usize,
    pub registry_refresh: Duration,
    pub realtime_enabled: bool,
    pub delay_minutes: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            instance_id: "gateway".to_string(),
            max_symbols_per_connection: 100,
            queue_size: 512,
            registry_refresh: Duration::from_secs(10),
            realtime_enabled: false,
            delay_minutes: 15,
        }
    }
}

struct ConnectionState {
    queue: Arc<OutboundQueue>,
    symbols: BTreeSet<String>,
    channels: BTreeSet<StreamChannel>,
}

struct RuntimeTasks {
    stop: watch::Sender<bool>,
    listener: JoinHandle<()>,
    keepalive: JoinHandle<()>,
}

pub struct StreamHub {
    instance_id: String,
    max_symbols_per_connection: usize,
    queue_size: usize,
    registry_refresh: Duration,
    realtime_enabled: bool,
    delay_minutes: u32,
    allowed_channels: BTreeSet<StreamChannel>,
    default_channels: BTreeSet<StreamChannel>,

    subscriber: Arc<dyn MarketEventSubscriber>,
    registry: Arc<dyn TopicRegistry>,

    connections: Mutex<HashMap<String, ConnectionState>>,
    topic_refs: Mutex<HashMap<String, usize>>,
    latency: Mutex<String>,
    status_message: Mutex<Option<String>>,
    runtime: tokio::sync::Mutex<Option<RuntimeTasks>>,
}

impl StreamHub {
    pub fn new(
        config: HubConfig,
        subscriber: Arc<dyn MarketEventSubscriber>,
        registry: Arc<dyn TopicRegistry>,
    ) -> Self {
        let instance_id = {
            let trimmed = config.instance_id.trim();
            if trimmed.is_empty() {
                "gateway".to_string()
            } else {
                trimmed.to_string()
            }
        };
        let delay_minutes = normalized_delay_minutes(config.delay_minutes);

        Self {
            instance_id,
            max_symbols_per_connection: config.max_symbols_per_connection.max(1),
            queue_size: config.queue_size.max(MIN_QUEUE_SIZE),
            registry_refresh: config.registry_refresh.max(MIN_REGISTRY_REFRESH),
            realtime_enabled: config.realtime_enabled,
            delay_minutes,
            allowed_channels: allowed_stream_channels(config.realtime_enabled),
            default_channels: default_stream_channels(config.realtime_enabled),
            subscriber,
            registry,
            connections: Mutex::new(HashMap::new()),
            topic_refs: Mutex::new(HashMap::new()),
            latency: Mutex::new("delayed".to_string()),
            status_message: Mutex::new(None),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    pub fn realtime_enabled(&self) -> bool {
        self.realtime_enabled
    }

    pub fn max_symbols_per_connection(&self) -> usize {
        self.max_symbols_per_connection
    }

    pub fn allowed_channels(&self) -> BTreeSet<StreamChannel> {
        self.allowed_channels.clone()
    }

    /// Latency mode last advertised by the publisher.
    pub fn current_latency(&self) -> String {
        self.latency.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn current_status_message(&self) -> Option<String> {
        self.status_message
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Register a websocket connection and hand back its outbound queue.
    /// The first connection starts the bus listener and registry
    /// keepalive.
    pub async fn register_connection(
        self: &Arc<Self>,
        connection_id: &str,
        user_id: &str,
    ) -> Arc<OutboundQueue> {
        let queue = Arc::new(OutboundQueue::new(self.queue_size));
        {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections.insert(
                connection_id.to_string(),
                ConnectionState {
                    queue: queue.clone(),
                    symbols: BTreeSet::new(),
                    channels: self.default_channels.clone(),
                },
            );
        }
        debug!(connection_id, user_id, "stream connection registered");
        self.ensure_runtime().await;
        queue
    }

    /// Drop a connection and release its topic references. The last
    /// connection stops the runtime, unless a new one raced in.
    pub async fn unregister_connection(self: &Arc<Self>, connection_id: &str) {
        let removed = {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections.remove(connection_id)
        };
        let Some(state) = removed else {
            return;
        };
        state.queue.close();
        let old_topics = build_topics(&state.symbols, state.channels.iter().copied());
        self.adjust_topic_refs(&old_topics, &BTreeSet::new());
        self.sync_registry().await;
        debug!(connection_id, "stream connection unregistered");

        if self.connection_count() == 0 {
            self.stop_runtime().await;
            // A connection may have registered while we were stopping.
            if self.connection_count() > 0 {
                self.ensure_runtime().await;
            }
        }
    }

    /// Replace a connection's desired subscription and push the topic
    /// delta to the cluster registry.
    pub async fn set_connection_subscription(
        self: &Arc<Self>,
        connection_id: &str,
        symbols: &BTreeSet<String>,
        channels: &BTreeSet<StreamChannel>,
    ) -> Result<(), StreamError> {
        let mut normalized: BTreeSet<String> = BTreeSet::new();
        let mut invalid: Vec<&str> = Vec::new();
        for symbol in symbols {
            match normalize_ticker(symbol) {
                Some(ticker) => {
                    normalized.insert(ticker);
                }
                None => invalid.push(symbol.as_str()),
            }
        }
        if !invalid.is_empty() {
            return Err(StreamError::new(
                StreamErrorCode::SymbolNotAllowed,
                format!("invalid symbols: {}", invalid.join(",")),
            ));
        }

        let channels = if channels.is_empty() {
            self.default_channels.clone()
        } else {
            let blocked: Vec<&str> = channels
                .difference(&self.allowed_channels)
                .map(StreamChannel::as_str)
                .collect();
            if !blocked.is_empty() {
                return Err(StreamError::new(
                    StreamErrorCode::ChannelNotAllowed,
                    format!("channels not allowed: {}", blocked.join(",")),
                ));
            }
            channels.clone()
        };

        if normalized.len() > self.max_symbols_per_connection {
            return Err(StreamError::new(
                StreamErrorCode::SubscriptionLimitExceeded,
                format!(
                    "max {} symbols per connection",
                    self.max_symbols_per_connection
                ),
            ));
        }

        let (old_topics, new_topics) = {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            let Some(state) = connections.get_mut(connection_id) else {
                return Err(StreamError::new(
                    StreamErrorCode::ConnectionNotFound,
                    format!("unknown connection: {connection_id}"),
                ));
            };
            let old_topics = build_topics(&state.symbols, state.channels.iter().copied());
            state.symbols = normalized;
            state.channels = channels;
            let new_topics = build_topics(&state.symbols, state.channels.iter().copied());
            (old_topics, new_topics)
        };

        self.adjust_topic_refs(&old_topics, &new_topics);
        self.ensure_runtime().await;
        self.sync_registry().await;
        Ok(())
    }

    /// Dispatch one bus envelope to the connections that should see it.
    pub fn handle_bus_message(&self, message: BusMessage) {
        match message.kind() {
            MessageKind::SystemStatus => {
                let message = self.absorb_status(message);
                self.broadcast(message);
            }
            MessageKind::SystemError | MessageKind::SystemPing => self.broadcast(message),
            MessageKind::Market(channel) => self.route_market(channel, message),
            MessageKind::Unknown => {
                debug!(message_type = %message.message_type, "dropping unknown bus message");
            }
        }
    }

    /// Gracefully drop every connection and leave the cluster registry.
    pub async fn shutdown(self: &Arc<Self>) {
        let drained: Vec<ConnectionState> = {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections.drain().map(|(_, state)| state).collect()
        };
        for state in &drained {
            state.queue.close();
        }
        self.topic_refs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.sync_registry().await;
        self.stop_runtime().await;
        if let Err(error) = self.registry.delete_instance(&self.instance_id).await {
            warn!(%error, "failed to delete registry instance key");
        }
        info!(connections = drained.len(), "stream hub shut down");
    }

    /// Fold a publisher status into hub state. Without the realtime
    /// entitlement every status is forced into the delayed mode before
    /// clients see it.
    fn absorb_status(&self, mut message: BusMessage) -> BusMessage {
        if self.realtime_enabled {
            let latency = message
                .data
                .get("latency")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            if latency == "real-time" || latency == "delayed" {
                *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
            }
            let status_message = message
                .data
                .get("message")
                .and_then(serde_json::Value::as_str)
                .map(|s| s.to_string());
            *self
                .status_message
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = status_message;
            return message;
        }

        let delayed = delayed_latency_message(self.delay_minutes);
        if !message.data.is_object() {
            message.data = serde_json::json!({});
        }
        message.data["latency"] = serde_json::json!("delayed");
        message.data["connection_state"] = serde_json::json!("disabled");
        message.data["message"] = serde_json::json!(delayed);
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = "delayed".to_string();
        *self
            .status_message
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(delayed);
        message
    }

    fn broadcast(&self, message: BusMessage) {
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        for state in connections.values() {
            state.queue.push(message.clone());
        }
    }

    fn route_market(&self, channel: StreamChannel, message: BusMessage) {
        if !self.allowed_channels.contains(&channel) {
            return;
        }
        let Some(symbol) = message.symbol() else {
            return;
        };
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        for state in connections.values() {
            if state.channels.contains(&channel) && state.symbols.contains(&symbol) {
                state.queue.push(message.clone());
            }
        }
    }

    fn adjust_topic_refs(&self, old: &BTreeSet<String>, new: &BTreeSet<String>) {
        let mut refs = self.topic_refs.lock().unwrap_or_else(|e| e.into_inner());
        for topic in new.difference(old) {
            *refs.entry(topic.clone()).or_insert(0) += 1;
        }
        for topic in old.difference(new) {
            if let Some(count) = refs.get_mut(topic) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    refs.remove(topic);
                }
            }
        }
    }

    fn topic_union(&self) -> BTreeSet<String> {
        self.topic_refs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Advertise this instance's topic union, refreshing the TTL key.
    async fn sync_registry(&self) {
        let topics = self.topic_union();
        if let Err(error) = self.registry.update_topics(&self.instance_id, &topics).await {
            warn!(%error, "failed to sync topic registry");
        }
    }

    async fn ensure_runtime(self: &Arc<Self>) {
        let mut runtime = self.runtime.lock().await;
        if let Some(tasks) = runtime.as_ref() {
            if !tasks.listener.is_finished() && !tasks.keepalive.is_finished() {
                return;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let listener = tokio::spawn(self.clone().run_listener(stop_rx.clone()));
        let keepalive = tokio::spawn(self.clone().run_keepalive(stop_rx));
        *runtime = Some(RuntimeTasks {
            stop: stop_tx,
            listener,
            keepalive,
        });
        debug!("stream hub runtime started");
    }

    async fn stop_runtime(&self) {
        let taken = self.runtime.lock().await.take();
        let Some(tasks) = taken else {
            return;
        };
        let _ = tasks.stop.send(true);
        let _ = tasks.listener.await;
        let _ = tasks.keepalive.await;
        debug!("stream hub runtime stopped");
    }

    /// Drive the bus subscription, restarting with doubling backoff when
    /// it ends or fails.
    async fn run_listener(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut backoff = LISTENER_BACKOFF_START;
        loop {
            if *stop.borrow() {
                return;
            }
            let (tx, mut rx) = mpsc::channel::<BusMessage>(self.queue_size);
            let listen = self.subscriber.listen(stop.clone(), tx);
            tokio::pin!(listen);

            let ended = loop {
                tokio::select! {
                    result = &mut listen => break result,
                    message = rx.recv() => {
                        if let Some(message) = message {
                            self.handle_bus_message(message);
                            // Traffic means the subscription is healthy.
                            backoff = LISTENER_BACKOFF_START;
                        }
                    }
                }
            };
            if *stop.borrow() {
                return;
            }
            match ended {
                Ok(()) => debug!("bus listener ended; restarting"),
                Err(error) => warn!(%error, "bus listener failed; restarting"),
            }
            self.set_delayed_state();

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = stop.changed() => return,
            }
            backoff = (backoff * 2).min(LISTENER_BACKOFF_MAX);
        }
    }

    /// Refresh the registry TTL key while the runtime is up.
    async fn run_keepalive(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.registry_refresh) => {
                    self.sync_registry().await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Advertise the delayed mode while the bus is unreachable.
    fn set_delayed_state(&self) {
        let delayed = delayed_latency_message(self.delay_minutes);
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = "delayed".to_string();
        *self
            .status_message
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(delayed.clone());
        self.broadcast(BusMessage::system_status(
            "delayed",
            "reconnecting",
            Some(&delayed),
        ));
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusError;
    use async_trait::async_trait;
    use serde_json::json;

    struct IdleSubscriber;

    #[async_trait]
    impl MarketEventSubscriber for IdleSubscriber {
        async fn listen(
            &self,
            mut stop: watch::Receiver<bool>,
            _tx: mpsc::Sender<BusMessage>,
        ) -> Result<(), BusError> {
            loop {
                if stop.changed().await.is_err() || *stop.borrow() {
                    return Ok(());
                }
            }
        }
    }

    #[derive(Default)]
    struct RecordingRegistry {
        topics: Mutex<BTreeSet<String>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TopicRegistry for RecordingRegistry {
        async fn update_topics(
            &self,
            _instance_id: &str,
            topics: &BTreeSet<String>,
        ) -> Result<(), BusError> {
            *self.topics.lock().unwrap() = topics.clone();
            Ok(())
        }

        async fn delete_instance(&self, instance_id: &str) -> Result<(), BusError> {
            self.deleted.lock().unwrap().push(instance_id.to_string());
            Ok(())
        }

        async fn collect_topics(&self) -> Result<BTreeSet<String>, BusError> {
            Ok(self.topics.lock().unwrap().clone())
        }

        async fn close(&self) -> Result<(), BusError> {
            Ok(())
        }
    }

    fn hub(realtime_enabled: bool) -> (Arc<StreamHub>, Arc<RecordingRegistry>) {
        let registry = Arc::new(RecordingRegistry::default());
        let config = HubConfig {
            realtime_enabled,
            ..HubConfig::default()
        };
        let hub = Arc::new(StreamHub::new(
            config,
            Arc::new(IdleSubscriber),
            registry.clone(),
        ));
        (hub, registry)
    }

    fn symbols(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_market_routing_by_symbol_and_channel() {
        let (hub, _) = hub(true);
        let q1 = hub.register_connection("c1", "u1").await;
        let q2 = hub.register_connection("c2", "u2").await;

        hub.set_connection_subscription(
            "c1",
            &symbols(&["AAPL"]),
            &BTreeSet::from([StreamChannel::Trade]),
        )
        .await
        .unwrap();
        hub.set_connection_subscription(
            "c2",
            &symbols(&["MSFT"]),
            &BTreeSet::from([StreamChannel::Quote]),
        )
        .await
        .unwrap();

        hub.handle_bus_message(BusMessage::market(
            StreamChannel::Trade,
            json!({"symbol": "AAPL", "price": 187.0}),
        ));
        hub.handle_bus_message(BusMessage::market(
            StreamChannel::Quote,
            json!({"symbol": "AAPL", "bid": 186.9}),
        ));

        let delivered = q1.recv().await.unwrap();
        assert_eq!(delivered.data["price"], 187.0);
        assert!(q1.is_empty());
        assert!(q2.is_empty());

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_registry_reflects_topic_refs() {
        let (hub, registry) = hub(true);
        hub.register_connection("c1", "u1").await;
        hub.register_connection("c2", "u2").await;

        let trade = BTreeSet::from([StreamChannel::Trade]);
        hub.set_connection_subscription("c1", &symbols(&["AAPL"]), &trade)
            .await
            .unwrap();
        hub.set_connection_subscription("c2", &symbols(&["AAPL"]), &trade)
            .await
            .unwrap();
        assert_eq!(registry.collect_topics().await.unwrap(), symbols(&["T.AAPL"]));

        // The topic stays advertised while any connection references it.
        hub.unregister_connection("c1").await;
        assert_eq!(registry.collect_topics().await.unwrap(), symbols(&["T.AAPL"]));

        hub.unregister_connection("c2").await;
        assert!(registry.collect_topics().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_validation() {
        let (hub, _) = hub(false);
        hub.register_connection("c1", "u1").await;

        let missing = hub
            .set_connection_subscription("nope", &symbols(&["AAPL"]), &BTreeSet::new())
            .await;
        assert_eq!(
            missing.unwrap_err().code,
            StreamErrorCode::ConnectionNotFound
        );

        let invalid = hub
            .set_connection_subscription("c1", &symbols(&["not a ticker"]), &BTreeSet::new())
            .await;
        assert_eq!(invalid.unwrap_err().code, StreamErrorCode::SymbolNotAllowed);

        // Quotes need the realtime entitlement.
        let blocked = hub
            .set_connection_subscription(
                "c1",
                &symbols(&["AAPL"]),
                &BTreeSet::from([StreamChannel::Quote]),
            )
            .await;
        assert_eq!(blocked.unwrap_err().code, StreamErrorCode::ChannelNotAllowed);

        let too_many: BTreeSet<String> = (0..101).map(|i| format!("SYM{i}")).collect();
        let capped = hub
            .set_connection_subscription("c1", &too_many, &BTreeSet::new())
            .await;
        assert_eq!(
            capped.unwrap_err().code,
            StreamErrorCode::SubscriptionLimitExceeded
        );

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_coerced_to_delayed_without_entitlement() {
        let (hub, _) = hub(false);
        let queue = hub.register_connection("c1", "u1").await;

        hub.handle_bus_message(BusMessage::system_status(
            "real-time",
            "connected",
            None,
        ));

        let status = queue.recv().await.unwrap();
        assert_eq!(status.data["latency"], "delayed");
        assert_eq!(status.data["connection_state"], "disabled");
        assert_eq!(status.data["message"], "delayed 15min");
        assert_eq!(hub.current_latency(), "delayed");
        assert_eq!(hub.current_status_message().as_deref(), Some("delayed 15min"));

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_passthrough_with_entitlement() {
        let (hub, _) = hub(true);
        let queue = hub.register_connection("c1", "u1").await;

        hub.handle_bus_message(BusMessage::system_status(
            "real-time",
            "connected",
            Some("live"),
        ));

        let status = queue.recv().await.unwrap();
        assert_eq!(status.data["latency"], "real-time");
        assert_eq!(status.data["connection_state"], "connected");
        assert_eq!(hub.current_latency(), "real-time");
        assert_eq!(hub.current_status_message().as_deref(), Some("live"));

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_default_channels_applied_on_empty_set() {
        let (hub, _) = hub(false);
        let queue = hub.register_connection("c1", "u1").await;
        hub.set_connection_subscription("c1", &symbols(&["AAPL"]), &BTreeSet::new())
            .await
            .unwrap();

        // Delayed mode defaults exclude quotes but carry trades.
        hub.handle_bus_message(BusMessage::market(
            StreamChannel::Trade,
            json!({"symbol": "AAPL", "price": 10.0}),
        ));
        assert!(queue.recv().await.is_some());

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_deletes_instance_key() {
        let (hub, registry) = hub(true);
        let queue = hub.register_connection("c1", "u1").await;
        hub.shutdown().await;

        assert!(queue.is_closed());
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(registry.deleted.lock().unwrap().as_slice(), ["gateway"]);
    }
}
