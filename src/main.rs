//! Flare, the SOS response page surface.
//!
//! Serves the reconciled response view over HTTP:
//!
//! - `GET /respond/{token}` and `GET /emergency/respond/{token}`: the
//!   response view for a capability token
//! - `POST .../acknowledge`, `.../message`, `.../status`: responder
//!   actions
//! - anything else: a static not-found view

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use flare::api::{AppState, router};
use flare::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("flare=info".parse()?))
        .init();

    let config = Config::from_env()?;
    info!(
        port = config.port,
        gateway = %config.gateway_url,
        "Starting Flare response surface"
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = router(AppState::new(config));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Flare is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
