pub mod health;
pub mod websocket;

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::relay::Relay;

// Re-export all handlers for easy route registration
pub use health::{health_handler, health_live_handler, metrics_handler, metrics_json_handler};
pub use websocket::{lobby_websocket_handler, room_websocket_handler};

/// State shared by the internal (metrics/health) listener.
#[derive(Clone)]
pub struct InternalState {
    pub relay: Arc<Relay>,
    pub server_id: String,
    pub distribution_enabled: bool,
    /// None when no global recorder was installed (tests, embedded use).
    pub prometheus: Option<PrometheusHandle>,
}
