//! Distribution Bridge
//!
//! Connects one relay instance to the backbone. The publish loop tags every
//! locally-originated message with this instance's id and publishes it; the
//! subscribe loop injects everyone else's messages into the local inbound
//! queue as `Remote` envelopes, which the dispatcher never forwards back.

use std::sync::Arc;
use std::time::Duration;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DistributionConfig;
use crate::error::BridgeError;
use crate::message::{DistributionMessage, Message};
use crate::metrics::ServerMetrics;
use crate::relay::Envelope;

use super::backbone::{Backbone, PayloadStream};

pub struct DistributionBridge {
    backbone: Arc<dyn Backbone>,
    topic: String,
    server_id: String,
    metrics: Arc<ServerMetrics>,
}

impl DistributionBridge {
    /// Ping the backbone, retrying once after `retry_delay`.
    pub async fn connect(
        backbone: Arc<dyn Backbone>,
        topic: impl Into<String>,
        server_id: impl Into<String>,
        retry_delay: Duration,
        metrics: Arc<ServerMetrics>,
    ) -> Result<Self, BridgeError> {
        if let Err(e) = backbone.ping().await {
            warn!(error = %e, retry_in = ?retry_delay, "backbone ping failed, trying again");
            tokio::time::sleep(retry_delay).await;
            backbone.ping().await.map_err(BridgeError::Connect)?;
        }

        let bridge = Self {
            backbone,
            topic: topic.into(),
            server_id: server_id.into(),
            metrics,
        };
        info!(topic = %bridge.topic, server_id = %bridge.server_id, "connected to backbone");
        Ok(bridge)
    }

    /// Convenience for [`connect`](Self::connect) from resolved config.
    pub async fn from_config(
        backbone: Arc<dyn Backbone>,
        config: &DistributionConfig,
        server_id: &str,
        metrics: Arc<ServerMetrics>,
    ) -> Result<Self, BridgeError> {
        Self::connect(
            backbone,
            config.topic.clone(),
            server_id,
            config.connect_retry,
            metrics,
        )
        .await
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Subscribe, then spawn the subscribe and publish loops.
    ///
    /// `inbound` is the relay's shared inbound queue; `outbound` is fed by the
    /// dispatcher with local messages only.
    pub async fn start(
        self,
        inbound: mpsc::Sender<Envelope>,
        outbound: mpsc::Receiver<Arc<Message>>,
    ) -> Result<BridgeTasks, BridgeError> {
        let payloads = self
            .backbone
            .subscribe(&self.topic)
            .await
            .map_err(|source| BridgeError::Subscribe {
                topic: self.topic.clone(),
                source,
            })?;
        info!(topic = %self.topic, "subscribed to backbone topic");

        let bridge = Arc::new(self);
        let subscriber = tokio::spawn(bridge.clone().subscribe_loop(payloads, inbound));
        let publisher = tokio::spawn(bridge.publish_loop(outbound));
        Ok(BridgeTasks {
            subscriber,
            publisher,
        })
    }

    async fn subscribe_loop(
        self: Arc<Self>,
        mut payloads: PayloadStream,
        inbound: mpsc::Sender<Envelope>,
    ) -> Result<(), BridgeError> {
        while let Some(payload) = payloads.next().await {
            let Some(envelope) = self.accept(&payload) else {
                continue;
            };
            if inbound.send(envelope).await.is_err() {
                debug!("inbound queue closed, subscriber stopping");
                return Ok(());
            }
        }
        Err(BridgeError::SubscriptionClosed(self.topic.clone()))
    }

    /// Turn one backbone payload into a remote envelope, or `None` if it is
    /// undecodable or this instance's own publish.
    fn accept(&self, payload: &str) -> Option<Envelope> {
        let dist = match DistributionMessage::decode(payload) {
            Ok(dist) => dist,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "skipping undecodable backbone payload");
                return None;
            }
        };
        if dist.server_id == self.server_id {
            self.metrics.self_loop_discarded();
            debug!(message_id = dist.message.message_id, "discarding own publish");
            return None;
        }
        self.metrics.message_incoming();
        Some(Envelope::remote(dist.message))
    }

    async fn publish_loop(
        self: Arc<Self>,
        mut outbound: mpsc::Receiver<Arc<Message>>,
    ) -> Result<(), BridgeError> {
        while let Some(message) = outbound.recv().await {
            let payload =
                DistributionMessage::new(Message::clone(&message), self.server_id.as_str()).encode()?;
            self.backbone
                .publish(&self.topic, payload)
                .await
                .map_err(|source| BridgeError::Publish {
                    topic: self.topic.clone(),
                    source,
                })?;
            self.metrics.message_published();
        }
        debug!("distribution outbound path closed, publisher stopping");
        Ok(())
    }
}

/// Handles to the two bridge loops.
pub struct BridgeTasks {
    subscriber: JoinHandle<Result<(), BridgeError>>,
    publisher: JoinHandle<Result<(), BridgeError>>,
}

impl BridgeTasks {
    /// Resolve as soon as either loop stops, with that loop's outcome.
    /// Await at most once.
    pub async fn stopped(&mut self) -> Result<(), BridgeError> {
        let (name, joined) = tokio::select! {
            joined = &mut self.subscriber => ("subscriber", joined),
            joined = &mut self.publisher => ("publisher", joined),
        };
        match joined {
            Ok(result) => result,
            Err(e) => Err(BridgeError::TaskAborted(format!("{name}: {e}"))),
        }
    }

    /// Abort both loops, dropping the backbone subscription.
    pub fn shutdown(&self) {
        self.subscriber.abort();
        self.publisher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::MemoryBackbone;
    use crate::error::BackboneError;

    async fn bridge(backbone: Arc<MemoryBackbone>, server_id: &str) -> DistributionBridge {
        DistributionBridge::connect(
            backbone,
            "chat",
            server_id,
            Duration::from_millis(10),
            Arc::new(ServerMetrics::new()),
        )
        .await
        .unwrap()
    }

    fn payload(server_id: &str, text: &str) -> String {
        DistributionMessage::new(Message::new(1, text, "A", "r1"), server_id)
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn connect_retries_once() {
        let backbone = Arc::new(MemoryBackbone::new());
        backbone.fail_next_pings(1);
        let bridge = bridge(backbone, "s1").await;
        assert_eq!(bridge.server_id(), "s1");
        assert_eq!(bridge.topic(), "chat");
    }

    #[tokio::test]
    async fn connect_fails_after_second_ping() {
        let backbone = Arc::new(MemoryBackbone::new());
        backbone.fail_next_pings(2);
        let result = DistributionBridge::connect(
            backbone,
            "chat",
            "s1",
            Duration::from_millis(10),
            Arc::new(ServerMetrics::new()),
        )
        .await;
        assert!(matches!(
            result,
            Err(BridgeError::Connect(BackboneError::Unreachable(_)))
        ));
    }

    #[tokio::test]
    async fn own_publishes_are_discarded() {
        let bridge = bridge(Arc::new(MemoryBackbone::new()), "s1").await;
        assert!(bridge.accept(&payload("s1", "mine")).is_none());
        assert_eq!(bridge.metrics.snapshot().distribution.self_loop_discards, 1);
        assert_eq!(bridge.metrics.snapshot().messages.incoming, 0);
    }

    #[tokio::test]
    async fn foreign_publishes_become_remote_envelopes() {
        let bridge = bridge(Arc::new(MemoryBackbone::new()), "s1").await;
        let envelope = bridge.accept(&payload("s2", "theirs")).unwrap();
        assert!(!envelope.should_distribute());
        assert_eq!(envelope.message.text, "theirs");
        assert_eq!(envelope.message.room, "r1");
        assert_eq!(bridge.metrics.snapshot().messages.incoming, 1);
    }

    #[tokio::test]
    async fn undecodable_payload_is_skipped() {
        let bridge = bridge(Arc::new(MemoryBackbone::new()), "s1").await;
        assert!(bridge.accept("not json").is_none());
        assert!(bridge.accept(r#"{"text":"no server id"}"#).is_none());
    }

    #[tokio::test]
    async fn loops_publish_and_filter_end_to_end() {
        let backbone = Arc::new(MemoryBackbone::new());
        let s1 = bridge(backbone.clone(), "s1").await;
        let s2 = bridge(backbone.clone(), "s2").await;

        let (s1_inbound_tx, mut s1_inbound) = mpsc::channel(8);
        let (s1_out_tx, s1_out_rx) = mpsc::channel(8);
        let (s2_inbound_tx, mut s2_inbound) = mpsc::channel(8);
        let (_s2_out_tx, s2_out_rx) = mpsc::channel(8);
        let s1_tasks = s1.start(s1_inbound_tx, s1_out_rx).await.unwrap();
        let s2_tasks = s2.start(s2_inbound_tx, s2_out_rx).await.unwrap();

        s1_out_tx
            .send(Arc::new(Message::new(9, "hello", "A", "r1")))
            .await
            .unwrap();

        let received = s2_inbound.recv().await.unwrap();
        assert_eq!(received.message.message_id, 9);
        assert!(!received.should_distribute());
        assert_eq!(backbone.published(), 1);

        // s1 saw its own publish and dropped it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(s1_inbound.try_recv().is_err());

        s1_tasks.shutdown();
        s2_tasks.shutdown();
    }

    #[tokio::test]
    async fn lost_subscription_is_fatal() {
        let backbone = Arc::new(MemoryBackbone::new());
        let bridge = bridge(backbone.clone(), "s1").await;
        let (inbound_tx, _inbound) = mpsc::channel(8);
        let (_out_tx, out_rx) = mpsc::channel(8);
        let mut tasks = bridge.start(inbound_tx, out_rx).await.unwrap();

        backbone.close_subscriptions();

        let err = tasks.stopped().await.unwrap_err();
        assert!(matches!(err, BridgeError::SubscriptionClosed(topic) if topic == "chat"));
        tasks.shutdown();
    }

    #[tokio::test]
    async fn publish_failure_is_fatal() {
        let backbone = Arc::new(MemoryBackbone::new());
        let bridge = bridge(backbone.clone(), "s1").await;
        let (inbound_tx, _inbound) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(8);
        let mut tasks = bridge.start(inbound_tx, out_rx).await.unwrap();

        backbone.close_subscriptions();
        out_tx
            .send(Arc::new(Message::new(1, "x", "A", "r1")))
            .await
            .unwrap();

        // Either loop may notice first; both failures are fatal.
        assert!(tasks.stopped().await.is_err());
        tasks.shutdown();
    }
}
