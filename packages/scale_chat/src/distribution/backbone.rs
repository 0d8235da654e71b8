//! Publish/subscribe backbone seam.
//!
//! A backbone moves opaque string payloads between server instances on named
//! topics. Every publish is delivered to every subscriber of the topic,
//! including the publishing instance itself.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::BackboneError;

/// Payloads received on one subscribed topic. Ends when the subscription is
/// lost.
pub type PayloadStream = BoxStream<'static, String>;

#[async_trait]
pub trait Backbone: Send + Sync + 'static {
    /// Round-trip check used before the bridge starts.
    async fn ping(&self) -> Result<(), BackboneError>;

    async fn publish(&self, topic: &str, payload: String) -> Result<(), BackboneError>;

    /// Subscribe to `topic`. The subscription is active once this returns.
    async fn subscribe(&self, topic: &str) -> Result<PayloadStream, BackboneError>;
}

/// Backbone capacity in payloads before slow subscribers start lagging.
const MEMORY_BUS_CAPACITY: usize = 1024;

/// In-process backbone. Several relay instances sharing one `MemoryBackbone`
/// behave like a fleet sharing a broker.
#[derive(Debug)]
pub struct MemoryBackbone {
    bus: broadcast::Sender<(String, String)>,
    published: AtomicU64,
    failing_pings: AtomicU32,
    closed: CancellationToken,
}

impl Default for MemoryBackbone {
    fn default() -> Self {
        let (bus, _) = broadcast::channel(MEMORY_BUS_CAPACITY);
        Self {
            bus,
            published: AtomicU64::new(0),
            failing_pings: AtomicU32::new(0),
            closed: CancellationToken::new(),
        }
    }
}

impl MemoryBackbone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total payloads published across all topics.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Make the next `n` pings fail as if the broker were unreachable.
    pub fn fail_next_pings(&self, n: u32) {
        self.failing_pings.store(n, Ordering::Relaxed);
    }

    /// End every subscription stream, as a broker disconnect would.
    pub fn close_subscriptions(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl Backbone for MemoryBackbone {
    async fn ping(&self) -> Result<(), BackboneError> {
        let failing = self
            .failing_pings
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        match failing {
            Ok(_) => Err(BackboneError::Unreachable("memory backbone ping refused".into())),
            Err(_) => Ok(()),
        }
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), BackboneError> {
        if self.closed.is_cancelled() {
            return Err(BackboneError::Closed);
        }
        // No subscribers is not an error, the payload is simply lost.
        let _ = self.bus.send((topic.to_string(), payload));
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<PayloadStream, BackboneError> {
        if self.closed.is_cancelled() {
            return Err(BackboneError::Closed);
        }
        let rx = self.bus.subscribe();
        let topic = topic.to_string();
        let closed = self.closed.clone();

        let stream = futures::stream::unfold((rx, topic, closed), |(mut rx, topic, closed)| async move {
            loop {
                let next = tokio::select! {
                    _ = closed.cancelled() => return None,
                    next = rx.recv() => next,
                };
                match next {
                    Ok((t, payload)) if t == topic => return Some((payload, (rx, topic, closed))),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "memory backbone subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
