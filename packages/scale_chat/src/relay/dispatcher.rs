//! Broadcast Dispatcher
//!
//! Single consumer of the shared inbound queue. For each envelope: record it
//! in history, forward local messages to the distribution bridge, then fan
//! out to every local connection in the message's room without ever waiting
//! on a recipient.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::message::Message;
use crate::metrics::ServerMetrics;

use super::envelope::Envelope;
use super::history::HistoryLog;
use super::registry::ClientRegistry;

/// Result of fanning one envelope out to its room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct BroadcastDispatcher {
    registry: Arc<ClientRegistry>,
    history: Arc<HistoryLog>,
    metrics: Arc<ServerMetrics>,
    /// Outbound path to the distribution bridge (None = distribution disabled)
    distribution: Option<mpsc::Sender<Arc<Message>>>,
}

impl BroadcastDispatcher {
    pub fn new(
        registry: Arc<ClientRegistry>,
        history: Arc<HistoryLog>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            registry,
            history,
            metrics,
            distribution: None,
        }
    }

    pub fn with_distribution(mut self, outbound: mpsc::Sender<Arc<Message>>) -> Self {
        self.distribution = Some(outbound);
        self
    }

    /// Drain the inbound queue until every producer is gone or `shutdown`
    /// fires. On shutdown the queue is closed to producers and whatever is
    /// already buffered is still dispatched.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Envelope>, shutdown: CancellationToken) {
        info!(
            distribution = self.distribution.is_some(),
            "broadcast dispatcher started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    inbound.close();
                    while let Some(envelope) = inbound.recv().await {
                        self.dispatch(envelope).await;
                    }
                    break;
                }
                next = inbound.recv() => match next {
                    Some(envelope) => {
                        self.dispatch(envelope).await;
                    }
                    None => break,
                },
            }
        }
        info!("inbound queue closed, broadcast dispatcher stopped");
    }

    pub async fn dispatch(&mut self, envelope: Envelope) -> FanOut {
        self.history.append(envelope.message.clone()).await;

        if envelope.should_distribute() {
            self.forward(&envelope.message).await;
        }

        let room = envelope.message.room.as_str();
        let mut fan_out = FanOut::default();
        let metrics = &self.metrics;
        self.registry
            .for_each_in_room(room, |record| match record.try_send(envelope.clone()) {
                Ok(()) => fan_out.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    fan_out.dropped += 1;
                    metrics.message_dropped();
                    warn!(
                        conn_id = %record.id,
                        room,
                        message_id = envelope.message.message_id,
                        "client outbound queue full, dropping message"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(conn_id = %record.id, "outbound queue closed, connection is going away");
                }
            })
            .await;

        debug!(
            room,
            provenance = ?envelope.provenance,
            delivered = fan_out.delivered,
            dropped = fan_out.dropped,
            "dispatched message"
        );
        fan_out
    }

    async fn forward(&mut self, message: &Arc<Message>) {
        let Some(outbound) = &self.distribution else {
            return;
        };
        if outbound.send(message.clone()).await.is_err() {
            // The publish loop only stops on a fatal error, which shuts the
            // instance down; stop forwarding meanwhile.
            error!("distribution bridge outbound path closed");
            self.distribution = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::registry::ConnectionRecord;

    struct Fixture {
        registry: Arc<ClientRegistry>,
        history: Arc<HistoryLog>,
        metrics: Arc<ServerMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Arc::new(ClientRegistry::new()),
                history: Arc::new(HistoryLog::unbounded()),
                metrics: Arc::new(ServerMetrics::new()),
            }
        }

        fn dispatcher(&self) -> BroadcastDispatcher {
            BroadcastDispatcher::new(
                self.registry.clone(),
                self.history.clone(),
                self.metrics.clone(),
            )
        }

        async fn connect(&self, room: &str, capacity: usize) -> mpsc::Receiver<Envelope> {
            let (tx, rx) = mpsc::channel(capacity);
            self.registry.add(ConnectionRecord::new(room, tx)).await;
            rx
        }
    }

    fn hi(room: &str) -> Message {
        Message::new(1, "hi", "A", room)
    }

    #[tokio::test]
    async fn delivers_to_every_connection_in_room() {
        let fx = Fixture::new();
        let mut b = fx.connect("r1", 4).await;
        let mut c = fx.connect("r1", 4).await;
        let mut d = fx.connect("r2", 4).await;

        let fan_out = fx.dispatcher().dispatch(Envelope::local(hi("r1"))).await;

        assert_eq!(fan_out, FanOut { delivered: 2, dropped: 0 });
        assert_eq!(b.try_recv().unwrap().message.text, "hi");
        assert_eq!(c.try_recv().unwrap().message.room, "r1");
        assert!(d.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_recipient_is_dropped_without_affecting_others() {
        let fx = Fixture::new();
        let mut full = fx.connect("r1", 1).await;
        let mut empty = fx.connect("r1", 4).await;
        let mut dispatcher = fx.dispatcher();

        // Fill both; `full` has room for exactly one.
        let first = dispatcher.dispatch(Envelope::local(hi("r1"))).await;
        assert_eq!(first, FanOut { delivered: 2, dropped: 0 });

        let second = dispatcher.dispatch(Envelope::local(hi("r1"))).await;
        assert_eq!(second, FanOut { delivered: 1, dropped: 1 });

        assert_eq!(empty.try_recv().unwrap().message.message_id, 1);
        assert!(empty.try_recv().is_ok());
        assert!(full.try_recv().is_ok());
        assert!(full.try_recv().is_err());
        assert_eq!(fx.metrics.snapshot().messages.dropped, 1);
    }

    #[tokio::test]
    async fn local_messages_are_forwarded_to_bridge() {
        let fx = Fixture::new();
        let (tx, mut bridge_rx) = mpsc::channel(4);
        let mut dispatcher = fx.dispatcher().with_distribution(tx);

        dispatcher.dispatch(Envelope::local(hi("r1"))).await;

        let forwarded = bridge_rx.try_recv().unwrap();
        assert_eq!(forwarded.text, "hi");
    }

    #[tokio::test]
    async fn remote_messages_are_never_forwarded_to_bridge() {
        let fx = Fixture::new();
        let mut receiver = fx.connect("r1", 4).await;
        let (tx, mut bridge_rx) = mpsc::channel(4);
        let mut dispatcher = fx.dispatcher().with_distribution(tx);

        for _ in 0..10 {
            dispatcher.dispatch(Envelope::remote(hi("r1"))).await;
        }

        assert!(bridge_rx.try_recv().is_err());
        // Remote messages still reach local clients.
        for _ in 0..4 {
            assert!(receiver.try_recv().is_ok());
        }
    }

    #[tokio::test]
    async fn history_records_every_dispatch() {
        let fx = Fixture::new();
        let mut dispatcher = fx.dispatcher();
        dispatcher.dispatch(Envelope::local(hi("r1"))).await;
        dispatcher.dispatch(Envelope::remote(hi("r2"))).await;
        assert_eq!(fx.history.len().await, 2);
    }

    #[tokio::test]
    async fn closed_bridge_disables_forwarding() {
        let fx = Fixture::new();
        let (tx, bridge_rx) = mpsc::channel(4);
        drop(bridge_rx);
        let mut dispatcher = fx.dispatcher().with_distribution(tx);
        let mut receiver = fx.connect("r1", 4).await;

        let fan_out = dispatcher.dispatch(Envelope::local(hi("r1"))).await;

        assert_eq!(fan_out.delivered, 1);
        assert!(dispatcher.distribution.is_none());
        assert!(receiver.try_recv().is_ok());
    }

    #[tokio::test]
    async fn run_stops_when_inbound_closes() {
        let fx = Fixture::new();
        let mut receiver = fx.connect("r1", 4).await;
        let (inbound_tx, inbound_rx) = mpsc::channel(4);
        let task = tokio::spawn(fx.dispatcher().run(inbound_rx, CancellationToken::new()));

        inbound_tx.send(Envelope::local(hi("r1"))).await.unwrap();
        drop(inbound_tx);
        task.await.unwrap();

        assert_eq!(receiver.recv().await.unwrap().message.text, "hi");
    }

    #[tokio::test]
    async fn shutdown_drains_buffered_envelopes() {
        let fx = Fixture::new();
        let mut receiver = fx.connect("r1", 4).await;
        let (inbound_tx, inbound_rx) = mpsc::channel(4);
        inbound_tx.send(Envelope::local(hi("r1"))).await.unwrap();
        inbound_tx.send(Envelope::local(hi("r1"))).await.unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        fx.dispatcher().run(inbound_rx, shutdown).await;

        assert!(receiver.try_recv().is_ok());
        assert!(receiver.try_recv().is_ok());
        // Producers see a closed queue afterwards.
        assert!(inbound_tx.send(Envelope::local(hi("r1"))).await.is_err());
    }
}
