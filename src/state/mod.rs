/// Attached signaling sockets.
pub mod connections;
/// Game model.
pub mod game;
/// Session store.
pub mod sessions;
/// Game transitions.
pub mod state_machine;
/// Keyed one-shot timers.
pub mod timers;

use std::sync::Arc;

use crate::config::AppConfig;

use self::{connections::ConnectionRegistry, sessions::SessionStore, timers::TimerScheduler};

/// State shared by every handler.
pub type SharedState = Arc<AppState>;

/// Central application state: configuration, live sessions and attached sockets.
pub struct AppState {
    config: AppConfig,
    sessions: SessionStore,
    connections: Arc<ConnectionRegistry>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(config: AppConfig) -> SharedState {
        let connections = Arc::new(ConnectionRegistry::new());
        let sessions = SessionStore::new(
            config.sessions,
            TimerScheduler::new(),
            connections.clone(),
        );
        Arc::new(Self {
            config,
            sessions,
            connections,
        })
    }

    /// Loaded configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Session registry.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Registry of active signaling sockets keyed by connection id.
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }
}
