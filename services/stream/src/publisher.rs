//! Realtime publisher process
//!
//! The single cluster-wide process that owns the upstream feed link. It
//! reconciles the registry's topic union against the upstream
//! subscription on a fixed cadence, maps incoming feed events to bus
//! envelopes, and republishes them for every gateway instance. The link
//! is held open only while at least one topic is advertised.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use types::errors::StreamErrorCode;
use types::stream::BusMessage;

use crate::bus::MarketEventPublisher;
use crate::feed::{FeedState, FeedUpdate, UpstreamLink};
use crate::messages::map_feed_event;
use crate::policy::delayed_latency_message;
use crate::registry::TopicRegistry;

const MIN_RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub realtime_enabled: bool,
    pub reconcile_interval: Duration,
    pub delay_minutes: u32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            realtime_enabled: false,
            reconcile_interval: Duration::from_secs(2),
            delay_minutes: 15,
        }
    }
}

struct LinkState {
    running: bool,
    topics: BTreeSet<String>,
}

pub struct RealtimePublisher {
    realtime_enabled: bool,
    reconcile_interval: Duration,
    delay_minutes: u32,
    link: Option<Arc<dyn UpstreamLink>>,
    bus: Arc<dyn MarketEventPublisher>,
    registry: Arc<dyn TopicRegistry>,
}

impl RealtimePublisher {
    pub fn new(
        config: PublisherConfig,
        link: Option<Arc<dyn UpstreamLink>>,
        bus: Arc<dyn MarketEventPublisher>,
        registry: Arc<dyn TopicRegistry>,
    ) -> Self {
        Self {
            realtime_enabled: config.realtime_enabled,
            reconcile_interval: config.reconcile_interval.max(MIN_RECONCILE_INTERVAL),
            delay_minutes: config.delay_minutes,
            link,
            bus,
            registry,
        }
    }

    /// Drive the publisher until the stop signal fires.
    pub async fn run(&self, mut stop: watch::Receiver<bool>, mut updates: mpsc::Receiver<FeedUpdate>) {
        let mut state = LinkState {
            running: false,
            topics: BTreeSet::new(),
        };

        if !self.realtime_enabled {
            // Permanent delayed mode: clients poll snapshots instead.
            let delayed = delayed_latency_message(self.delay_minutes);
            self.publish_status("delayed", "disabled", Some(&delayed)).await;
            self.wait_for_stop(&mut stop).await;
            self.shutdown(&mut state).await;
            return;
        }

        if self.link.is_none() {
            self.publish_error("upstream feed client is not configured").await;
            self.wait_for_stop(&mut stop).await;
            self.shutdown(&mut state).await;
            return;
        }

        info!("realtime publisher started");
        let mut reconcile_tick = tokio::time::interval(self.reconcile_interval);
        loop {
            tokio::select! {
                _ = reconcile_tick.tick() => {
                    self.reconcile(&mut state).await;
                }
                update = updates.recv() => {
                    match update {
                        Some(update) => self.handle_update(update).await,
                        None => break,
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown(&mut state).await;
    }

    /// Align the upstream subscription with the cluster topic union.
    async fn reconcile(&self, state: &mut LinkState) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        let topics = match self.registry.collect_topics().await {
            Ok(topics) => topics,
            Err(error) => {
                warn!(%error, "failed to collect registry topics");
                return;
            }
        };

        if !topics.is_empty() {
            if !state.running {
                link.start().await;
                state.running = true;
            }
            if topics != state.topics {
                debug!(count = topics.len(), "reconciling upstream topics");
                link.set_topics(topics.clone()).await;
                state.topics = topics;
            }
            return;
        }

        if state.running {
            // Nobody is listening anywhere in the cluster.
            link.set_topics(BTreeSet::new()).await;
            link.stop().await;
            state.running = false;
            state.topics = BTreeSet::new();
            self.publish_status("delayed", "idle", None).await;
        }
    }

    async fn handle_update(&self, update: FeedUpdate) {
        match update {
            FeedUpdate::Events(events) => {
                for event in &events {
                    let Some(message) = map_feed_event(event) else {
                        continue;
                    };
                    self.publish(&message).await;
                }
            }
            FeedUpdate::Status { state, message } => {
                let latency = if state == FeedState::Connected {
                    "real-time"
                } else {
                    "delayed"
                };
                self.publish_status(latency, state.as_str(), message.as_deref())
                    .await;
                if state == FeedState::AuthFailed || state == FeedState::Error {
                    self.publish_error(
                        message.as_deref().unwrap_or("upstream stream unavailable"),
                    )
                    .await;
                }
            }
        }
    }

    async fn shutdown(&self, state: &mut LinkState) {
        if let Some(link) = self.link.as_ref() {
            if state.running {
                link.set_topics(BTreeSet::new()).await;
                link.stop().await;
                state.running = false;
            }
        }
        if let Err(error) = self.registry.close().await {
            warn!(%error, "failed to close topic registry");
        }
        if let Err(error) = self.bus.close().await {
            warn!(%error, "failed to close bus publisher");
        }
        info!("realtime publisher stopped");
    }

    async fn wait_for_stop(&self, stop: &mut watch::Receiver<bool>) {
        while !*stop.borrow() {
            if stop.changed().await.is_err() {
                return;
            }
        }
    }

    async fn publish_status(&self, latency: &str, connection_state: &str, message: Option<&str>) {
        self.publish(&BusMessage::system_status(latency, connection_state, message))
            .await;
    }

    async fn publish_error(&self, message: &str) {
        self.publish(&BusMessage::system_error(
            StreamErrorCode::UpstreamUnavailable.as_str(),
            message,
        ))
        .await;
    }

    async fn publish(&self, message: &BusMessage) {
        if let Err(error) = self.bus.publish(message).await {
            warn!(%error, message_type = %message.message_type, "failed to publish bus message");
        }
    }
}
