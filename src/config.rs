//! Runtime configuration, loaded once from the environment.

use std::env;

/// Default port for the routing surface.
const DEFAULT_PORT: u16 = 3000;

/// Connection settings for the gateway and the two feed channels.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the routing surface listens on.
    pub port: u16,
    /// Gateway endpoint (single POST URL).
    pub gateway_url: String,
    /// Static API key sent with every gateway request.
    pub gateway_api_key: String,
    /// Websocket URL of the row-change feed.
    pub row_feed_url: String,
    /// Base URL of the broadcast tree.
    pub broadcast_url: String,
}

impl Config {
    /// Read configuration from environment variables, with defaults that
    /// suit local development.
    pub fn from_env() -> anyhow::Result<Self> {
        let port = env::var("FLARE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let gateway_url = env::var("FLARE_GATEWAY_URL")
            .unwrap_or_else(|_| "http://localhost:8000/functions/v1/emergency-acknowledgment".to_string());
        let gateway_api_key = env::var("FLARE_GATEWAY_API_KEY").unwrap_or_default();
        let row_feed_url = env::var("FLARE_ROW_FEED_URL")
            .unwrap_or_else(|_| "ws://localhost:8000/realtime/v1/websocket".to_string());
        let broadcast_url = env::var("FLARE_BROADCAST_URL")
            .unwrap_or_else(|_| "http://localhost:9000".to_string());

        Ok(Self {
            port,
            gateway_url,
            gateway_api_key,
            row_feed_url,
            broadcast_url,
        })
    }
}
