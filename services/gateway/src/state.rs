use async_trait::async_trait;
use market_bars::service::BarService;
use market_stream::hub::StreamHub;
use market_stream::session::SessionConfig;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::auth::TokenVerifier;
use crate::config::GatewayConfig;

/// The authorized symbol universe for a caller. Watchlists live in an
/// external system; the gateway only consumes this narrow view.
#[async_trait]
pub trait SymbolDirectory: Send + Sync {
    async fn allowed_symbols(&self, user_id: &str) -> BTreeSet<String>;
}

/// Config-backed allow-list shared by every caller.
pub struct StaticSymbolDirectory {
    symbols: BTreeSet<String>,
}

impl StaticSymbolDirectory {
    pub fn new(symbols: BTreeSet<String>) -> Self {
        Self { symbols }
    }
}

#[async_trait]
impl SymbolDirectory for StaticSymbolDirectory {
    async fn allowed_symbols(&self, _user_id: &str) -> BTreeSet<String> {
        self.symbols.clone()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub bars: Arc<BarService>,
    pub hub: Arc<StreamHub>,
    pub verifier: Arc<TokenVerifier>,
    pub symbols: Arc<dyn SymbolDirectory>,
    pub allowed_origins: BTreeSet<String>,
    pub session_config: SessionConfig,
}

impl AppState {
    pub fn new(
        config: &GatewayConfig,
        bars: Arc<BarService>,
        hub: Arc<StreamHub>,
        symbols: Arc<dyn SymbolDirectory>,
    ) -> Self {
        Self {
            bars,
            hub,
            verifier: Arc::new(TokenVerifier::new(&config.jwt_secret)),
            symbols,
            allowed_origins: config.allowed_origins.clone(),
            session_config: SessionConfig {
                max_symbols: config.max_symbols_per_connection,
                ping_interval: config.ping_interval,
                ping_timeout: config.ping_timeout,
                ping_max_misses: config.ping_max_misses,
            },
        }
    }
}
