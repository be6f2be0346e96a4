mod auth;
mod config;
mod error;
mod handlers;
mod router;
mod state;

use config::GatewayConfig;
use market_bars::service::{BarService, BarServiceConfig};
use market_bars::store::MemoryBarStore;
use market_bars::vendor::{AggsClient, RestAggsClient};
use market_stream::bus::RedisEventSubscriber;
use market_stream::hub::{HubConfig, StreamHub};
use market_stream::registry::RedisTopicRegistry;
use router::create_router;
use state::{AppState, StaticSymbolDirectory};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();

    tracing::info!(
        bars = market_bars::SERVICE_VERSION,
        stream = market_stream::SERVICE_VERSION,
        "Starting market gateway service"
    );
    let config = GatewayConfig::from_env();

    let vendor: Option<Arc<dyn AggsClient>> = match config.vendor_api_key.as_deref() {
        Some(api_key) => Some(Arc::new(RestAggsClient::new(
            reqwest::Client::new(),
            config.vendor_rest_base.clone(),
            api_key,
        ))),
        None => {
            tracing::warn!("no vendor API key configured; serving cached data only");
            None
        }
    };
    let bars = Arc::new(BarService::new(
        Arc::new(MemoryBarStore::new()),
        vendor,
        BarServiceConfig {
            daily_lookback_days: config.daily_lookback_days,
            intraday_lookback_days: config.intraday_lookback_days,
            enable_direct_fallback: config.enable_direct_fallback,
        },
    ));

    let subscriber = Arc::new(RedisEventSubscriber::new(
        &config.redis_url,
        config.bus_channel.clone(),
    )?);
    let registry = Arc::new(RedisTopicRegistry::new(
        &config.redis_url,
        config.registry_prefix.clone(),
        config.registry_ttl_seconds,
    )?);
    let hub = Arc::new(StreamHub::new(
        HubConfig {
            instance_id: config.instance_id.clone(),
            max_symbols_per_connection: config.max_symbols_per_connection,
            queue_size: config.queue_size,
            registry_refresh: config.registry_refresh,
            realtime_enabled: config.realtime_enabled,
            delay_minutes: config.delay_minutes,
        },
        subscriber,
        registry,
    ));

    let symbols = Arc::new(StaticSymbolDirectory::new(config.watchlist.clone()));
    let state = AppState::new(&config, bars, hub.clone(), symbols);
    let app = create_router(state);

    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!("Listening on {}", config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    hub.shutdown().await;
    Ok(())
}
