pub mod config;
pub mod error;
pub mod websocket;

use std::sync::Arc;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use websocket::{BroadcastRouter, Registry, RelayServer};

/// Application state shared across all connection tasks
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub registry: Arc<Registry>,
    pub router: Arc<BroadcastRouter>,
}

impl AppState {
    pub fn new(config: Settings) -> Self {
        let registry = Arc::new(Registry::new());
        let router = Arc::new(BroadcastRouter::new(
            registry.clone(),
            config.relay.overflow_policy,
        ));

        Self {
            config: Arc::new(config),
            registry,
            router,
        }
    }

    /// Move every registered connection to `Closing` so its writer sends a
    /// close frame and its task winds down. Returns how many were signalled.
    pub async fn shutdown(&self) -> usize {
        let mut signalled = 0;
        for conn in self.registry.snapshot().await {
            if conn.begin_close() {
                signalled += 1;
            }
        }
        signalled
    }
}
