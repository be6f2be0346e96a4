//! Environment-driven configuration with workable local defaults.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub allowed_origins: BTreeSet<String>,

    pub vendor_api_key: Option<String>,
    pub vendor_rest_base: String,
    pub vendor_ws_url: String,

    pub redis_url: String,
    pub bus_channel: String,
    pub registry_prefix: String,
    pub registry_ttl_seconds: u64,
    pub instance_id: String,

    pub realtime_enabled: bool,
    pub delay_minutes: u32,
    pub watchlist: BTreeSet<String>,

    pub max_symbols_per_connection: usize,
    pub queue_size: usize,
    pub registry_refresh: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub ping_max_misses: u32,

    pub daily_lookback_days: i64,
    pub intraday_lookback_days: i64,
    pub enable_direct_fallback: bool,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_parsed("GATEWAY_BIND", SocketAddr::from(([0, 0, 0, 0], 8080))),
            jwt_secret: env_string("GATEWAY_JWT_SECRET", "dev-secret"),
            allowed_origins: env_csv("GATEWAY_ALLOWED_ORIGINS"),

            vendor_api_key: std::env::var("VENDOR_API_KEY")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            vendor_rest_base: env_string("VENDOR_REST_BASE", "https://api.polygon.io"),
            vendor_ws_url: env_string("VENDOR_WS_URL", "wss://socket.massive.com/stocks"),

            redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),
            bus_channel: env_string("MARKET_BUS_CHANNEL", "market:stocks:events"),
            registry_prefix: env_string("MARKET_REGISTRY_PREFIX", "market:stocks:subs"),
            registry_ttl_seconds: env_parsed("MARKET_REGISTRY_TTL_SECONDS", 30),
            instance_id: env_string("GATEWAY_INSTANCE_ID", "gateway"),

            realtime_enabled: env_parsed("MARKET_REALTIME_ENABLED", false),
            delay_minutes: env_parsed("MARKET_DELAY_MINUTES", 15),
            watchlist: env_csv("MARKET_WATCHLIST"),

            max_symbols_per_connection: env_parsed("STREAM_MAX_SYMBOLS", 100),
            queue_size: env_parsed("STREAM_QUEUE_SIZE", 512),
            registry_refresh: Duration::from_secs(env_parsed("STREAM_REGISTRY_REFRESH_SECONDS", 10)),
            ping_interval: Duration::from_secs(env_parsed("STREAM_PING_INTERVAL_SECONDS", 20)),
            ping_timeout: Duration::from_secs(env_parsed("STREAM_PING_TIMEOUT_SECONDS", 10)),
            ping_max_misses: env_parsed("STREAM_PING_MAX_MISSES", 2),

            daily_lookback_days: env_parsed("BARS_DAILY_LOOKBACK_DAYS", 365),
            intraday_lookback_days: env_parsed("BARS_INTRADAY_LOOKBACK_DAYS", 7),
            enable_direct_fallback: env_parsed("BARS_DIRECT_FALLBACK", true),
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn env_csv(name: &str) -> BTreeSet<String> {
    std::env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}
