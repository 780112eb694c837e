//! HTTP API layer: thin handlers delegating to the audio core.
//!
//! This module contains router construction and server startup. Business
//! logic lives in `tower-core`'s other modules; handlers here only extract,
//! delegate, and serialize.

use std::sync::Arc;
use std::time::Instant;

use crate::bootstrap::BootstrappedTower;

pub mod http;

/// Shared application state for the API layer. Cheap to clone — it's just
/// an `Arc` and a timestamp.
#[derive(Clone)]
pub struct AppState {
    pub tower: Arc<BootstrappedTower>,
    pub started_at: Instant,
}

/// Builder for constructing an `AppState`.
#[derive(Default)]
pub struct AppStateBuilder {
    tower: Option<Arc<BootstrappedTower>>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tower(mut self, tower: Arc<BootstrappedTower>) -> Self {
        self.tower = Some(tower);
        self
    }

    /// Builds the `AppState`, panicking if required fields are missing.
    pub fn build(self) -> AppState {
        AppState {
            tower: self.tower.expect("tower is required"),
            started_at: Instant::now(),
        }
    }
}

impl AppState {
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::new()
    }
}

/// Starts the HTTP server on `addr`. Runs until the listener is dropped or
/// the process is killed; the caller is expected to race this against a
/// shutdown signal.
pub async fn start_server(state: AppState, addr: std::net::SocketAddr) -> crate::error::TowerResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| crate::error::TowerError::Bind(e.to_string()))?;

    log::info!("[Server] listening on http://{addr}");
    let app = http::create_router(state);
    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::TowerError::Bind(e.to_string()))?;
    Ok(())
}
