//! Diagnostics HTTP endpoint
//!
//! A read-only view of the daemon, served on loopback only.
//!
//! ## Endpoints
//!
//! - `GET /debug/health` - Health check
//! - `GET /debug/vars` - Version, commit and processor counters

#[cfg(feature = "api")]
pub mod error;
#[cfg(feature = "api")]
pub mod routes;
#[cfg(feature = "api")]
pub mod state;
#[cfg(feature = "api")]
pub mod types;

#[cfg(feature = "api")]
pub use error::{ApiError, ApiResult};
#[cfg(feature = "api")]
pub use state::ApiState;
#[cfg(feature = "api")]
pub use types::{HealthResponse, VarsResponse};

#[cfg(feature = "api")]
use axum::{Router, routing::get};
use std::net::{Ipv4Addr, SocketAddr};
#[cfg(feature = "api")]
use tracing::info;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind address, always on loopback
    pub bind_addr: SocketAddr,
}

impl ApiConfig {
    pub fn loopback(port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        }
    }
}

/// Build the diagnostics router.
#[cfg(feature = "api")]
pub fn router(state: ApiState) -> Router {
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/debug/health", get(routes::health::health_check))
        .route("/debug/vars", get(routes::vars::get_vars))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Spawn the API server
///
/// This starts an Axum HTTP server in a background task.
/// Returns the server's local address.
#[cfg(feature = "api")]
pub async fn spawn_api_server(config: ApiConfig, state: ApiState) -> anyhow::Result<SocketAddr> {
    info!("starting diagnostics server on {}", config.bind_addr);

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("diagnostics server listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("diagnostics server error: {}", e);
        }
    });

    Ok(addr)
}
