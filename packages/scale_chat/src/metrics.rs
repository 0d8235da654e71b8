//! Server metrics for observability
//!
//! `ServerMetrics` keeps process-local counters for the health endpoint and
//! mirrors every event into the `metrics` facade, which the binary exports in
//! Prometheus text format on the internal listener.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Processed messages (counter, label `type` = incoming | outgoing).
pub const MESSAGES_TOTAL: &str = "scale_chat_messages_total";
/// Ingestion-to-send latency (histogram, seconds).
pub const MESSAGE_PROCESSING_SECONDS: &str = "scale_chat_message_processing_seconds";
/// Per-recipient drops on a full outbound queue (counter).
pub const MESSAGES_DROPPED_TOTAL: &str = "scale_chat_messages_dropped_total";
/// Open client connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "scale_chat_connections_active";

const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Install the Prometheus recorder (global). Call once at startup.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS)?
        .install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently open client connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Message metrics
    /// Messages decoded from clients or accepted from the backbone
    pub messages_incoming: AtomicU64,
    /// Messages written to client connections
    pub messages_outgoing: AtomicU64,
    /// Messages dropped because a recipient queue was full
    pub messages_dropped: AtomicU64,
    /// Frames that failed to decode
    pub decode_errors: AtomicU64,

    // Distribution metrics
    /// Messages published to the backbone
    pub messages_published: AtomicU64,
    /// Backbone payloads discarded by the self-loop guard
    pub self_loop_discards: AtomicU64,

    // Latency
    latency_micros_total: AtomicU64,
    latency_observations: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        let active = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        gauge!(CONNECTIONS_ACTIVE).set(active as f64);
    }

    pub fn connection_closed(&self) {
        let active = self.active_connections.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!(CONNECTIONS_ACTIVE).set(active as f64);
    }

    // Message tracking
    pub fn message_incoming(&self) {
        self.messages_incoming.fetch_add(1, Ordering::Relaxed);
        counter!(MESSAGES_TOTAL, "type" => "incoming").increment(1);
    }

    pub fn message_outgoing(&self) {
        self.messages_outgoing.fetch_add(1, Ordering::Relaxed);
        counter!(MESSAGES_TOTAL, "type" => "outgoing").increment(1);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        counter!(MESSAGES_DROPPED_TOTAL).increment(1);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn self_loop_discarded(&self) {
        self.self_loop_discards.fetch_add(1, Ordering::Relaxed);
    }

    /// Record ingestion-to-send latency for one written message.
    pub fn observe_latency(&self, elapsed: Duration) {
        self.latency_micros_total
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.latency_observations.fetch_add(1, Ordering::Relaxed);
        histogram!(MESSAGE_PROCESSING_SECONDS).record(elapsed.as_secs_f64());
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let observations = self.latency_observations.load(Ordering::Relaxed);
        let mean_latency_micros = if observations == 0 {
            0
        } else {
            self.latency_micros_total.load(Ordering::Relaxed) / observations
        };

        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                incoming: self.messages_incoming.load(Ordering::Relaxed),
                outgoing: self.messages_outgoing.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
                decode_errors: self.decode_errors.load(Ordering::Relaxed),
            },
            distribution: DistributionMetrics {
                published: self.messages_published.load(Ordering::Relaxed),
                self_loop_discards: self.self_loop_discards.load(Ordering::Relaxed),
            },
            latency: LatencyMetrics {
                observations,
                mean_micros: mean_latency_micros,
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub distribution: DistributionMetrics,
    pub latency: LatencyMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub incoming: u64,
    pub outgoing: u64,
    pub dropped: u64,
    pub decode_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionMetrics {
    pub published: u64,
    pub self_loop_discards: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub observations: u64,
    pub mean_micros: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub server_id: String,
    pub distribution_enabled: bool,
    pub connections: u64,
    /// Open connections per room.
    pub rooms: BTreeMap<String, usize>,
    pub history_len: usize,
    pub uptime_secs: u64,
}
