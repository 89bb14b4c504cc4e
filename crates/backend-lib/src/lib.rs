// ============================
// crates/backend-lib/src/lib.rs
// ============================
//! Core of the meeting-room relay: room state, admission, roles, lifecycle
//! and the WebSocket signaling server that drives them.

pub mod auth;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod room;
pub mod room_actor;
pub mod validation;
pub mod ws_router;

use std::sync::Arc;

use crate::config::Settings;
use crate::registry::RoomRegistry;

pub use ws_router::create_router;

/// Application state shared across all handlers
#[derive(Debug, Clone)]
pub struct AppState {
    /// Live rooms, tombstones and the join throttle
    pub registry: RoomRegistry,
    /// Settings the server was started with
    pub settings: Arc<Settings>,
}

impl AppState {
    /// Create a new application state
    pub fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        Self {
            registry: RoomRegistry::new(settings.clone()),
            settings,
        }
    }

    /// Create a new application state from `meetroom.toml` and the environment
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::new(Settings::load()?))
    }
}
