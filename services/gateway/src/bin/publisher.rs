//! Realtime publisher process
//!
//! Runs exactly once per cluster: owns the upstream feed link and
//! republishes mapped events onto the shared bus until ctrl-c.

#[path = "../config.rs"]
mod config;

use config::GatewayConfig;
use market_stream::bus::RedisEventPublisher;
use market_stream::feed::{FeedClient, FeedConfig, UpstreamLink};
use market_stream::publisher::{PublisherConfig, RealtimePublisher};
use market_stream::registry::RedisTopicRegistry;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();

    tracing::info!(
        stream = market_stream::SERVICE_VERSION,
        "Starting realtime publisher"
    );
    let config = GatewayConfig::from_env();

    let bus = Arc::new(RedisEventPublisher::new(
        &config.redis_url,
        config.bus_channel.clone(),
    )?);
    let registry = Arc::new(RedisTopicRegistry::new(
        &config.redis_url,
        config.registry_prefix.clone(),
        config.registry_ttl_seconds,
    )?);

    let (updates_tx, updates_rx) = mpsc::channel(1024);
    let link: Option<Arc<dyn UpstreamLink>> = config.vendor_api_key.as_deref().map(|api_key| {
        Arc::new(FeedClient::new(
            FeedConfig::new(config.vendor_ws_url.clone(), api_key),
            updates_tx.clone(),
        )) as Arc<dyn UpstreamLink>
    });

    let publisher = RealtimePublisher::new(
        PublisherConfig {
            realtime_enabled: config.realtime_enabled,
            delay_minutes: config.delay_minutes,
            ..PublisherConfig::default()
        },
        link,
        bus,
        registry,
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = stop_tx.send(true);
    });

    publisher.run(stop_rx, updates_rx).await;
    Ok(())
}
