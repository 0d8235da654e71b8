//! Message relay: connection handlers, client registry, history and the
//! broadcast dispatcher that ties them together.

pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod history;
pub mod registry;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::metrics::ServerMetrics;

pub use connection::handle_connection;
pub use dispatcher::{BroadcastDispatcher, FanOut};
pub use envelope::{Envelope, Provenance};
pub use history::HistoryLog;
pub use registry::{ClientRegistry, ConnectionId, ConnectionRecord};

/// Shared state of one relay instance, handed to every connection handler
/// and to the dispatcher.
pub struct Relay {
    pub registry: Arc<ClientRegistry>,
    pub history: Arc<HistoryLog>,
    pub metrics: Arc<ServerMetrics>,
    inbound: mpsc::Sender<Envelope>,
    outbound_capacity: usize,
    /// Process-wide stop signal; every connection's completion token is a child.
    shutdown: CancellationToken,
}

impl Relay {
    /// Create the relay and the receiving end of its inbound queue, which
    /// belongs to the dispatcher.
    pub fn new(config: &RelayConfig, metrics: Arc<ServerMetrics>) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (inbound, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let relay = Self {
            registry: Arc::new(ClientRegistry::new()),
            history: Arc::new(HistoryLog::new(config.history_limit)),
            metrics,
            inbound,
            outbound_capacity: config.outbound_capacity,
            shutdown: CancellationToken::new(),
        };
        (Arc::new(relay), inbound_rx)
    }

    /// A producer handle for the inbound queue.
    pub fn inbound(&self) -> mpsc::Sender<Envelope> {
        self.inbound.clone()
    }

    pub fn outbound_capacity(&self) -> usize {
        self.outbound_capacity
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Completion signal for one connection. Fires on its own or when the
    /// relay shuts down.
    pub fn connection_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn dispatcher(&self) -> BroadcastDispatcher {
        BroadcastDispatcher::new(
            self.registry.clone(),
            self.history.clone(),
            self.metrics.clone(),
        )
    }
}
