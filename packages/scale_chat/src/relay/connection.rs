//! Connection Handler
//!
//! One client's duplex channel, split into a read loop feeding the shared
//! inbound queue and a write loop draining the connection's own outbound
//! queue. A supervisor waits for either loop to finish, removes the
//! connection from the registry and lets the other loop wind down.

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, close_code};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::message::Message;
use crate::metrics::ServerMetrics;

use super::Relay;
use super::envelope::Envelope;
use super::registry::{ConnectionId, ConnectionRecord};

/// Serve one upgraded WebSocket until either side gives up.
pub async fn handle_connection(socket: WebSocket, room: String, relay: Arc<Relay>) {
    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(relay.outbound_capacity());
    let record = ConnectionRecord::new(room.clone(), outbound_tx);
    let conn_id = record.id;

    // Registered before either loop runs so the first broadcast can reach it.
    relay.registry.add(record).await;
    relay.metrics.connection_opened();
    info!(conn_id = %conn_id, room = %room, "client connected");

    let done = relay.connection_token();
    let reader = tokio::spawn(read_loop(
        stream,
        conn_id,
        room.clone(),
        relay.inbound(),
        relay.metrics.clone(),
        done.clone(),
    ));
    let writer = tokio::spawn(write_loop(
        sink,
        conn_id,
        outbound_rx,
        relay.metrics.clone(),
        done.clone(),
    ));

    done.cancelled().await;
    // Dropping the record's sender closes the outbound queue.
    relay.registry.remove(&conn_id).await;

    let (read_result, write_result) = tokio::join!(reader, writer);
    for result in [read_result, write_result] {
        if let Err(e) = result {
            error!(conn_id = %conn_id, error = %e, "connection task panicked");
        }
    }

    relay.metrics.connection_closed();
    info!(conn_id = %conn_id, room = %room, "client disconnected");
}

/// Decode client frames and push them onto the inbound queue.
///
/// Waits for inbound capacity instead of skipping, so a busy dispatcher slows
/// the client down rather than losing its messages.
pub(crate) async fn read_loop<S, E>(
    mut stream: S,
    conn_id: ConnectionId,
    room: String,
    inbound: mpsc::Sender<Envelope>,
    metrics: Arc<ServerMetrics>,
    done: CancellationToken,
) where
    S: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = tokio::select! {
            _ = done.cancelled() => break,
            frame = stream.next() => frame,
        };

        let decoded = match frame {
            None => {
                debug!(conn_id = %conn_id, "client stream ended");
                break;
            }
            Some(Err(e)) => {
                info!(conn_id = %conn_id, error = %e, "cannot read from websocket");
                break;
            }
            Some(Ok(WsMessage::Close(_))) => {
                debug!(conn_id = %conn_id, "client sent close frame");
                break;
            }
            Some(Ok(WsMessage::Text(text))) => Message::decode(text.as_str().as_bytes()),
            Some(Ok(WsMessage::Binary(data))) => Message::decode(&data),
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
        };

        let message = match decoded {
            Ok(message) => message.in_room(&room),
            Err(e) => {
                metrics.decode_error();
                warn!(conn_id = %conn_id, error = %e, "cannot decode client message");
                continue;
            }
        };
        metrics.message_incoming();

        let envelope = Envelope::local(message);
        tokio::select! {
            _ = done.cancelled() => break,
            sent = inbound.send(envelope) => {
                if sent.is_err() {
                    debug!(conn_id = %conn_id, "inbound queue closed");
                    break;
                }
            }
        }
    }
    done.cancel();
}

/// Serialize queued envelopes onto the socket.
///
/// Runs until the outbound queue is closed by registry removal, then sends a
/// normal close frame.
pub(crate) async fn write_loop<S>(
    mut sink: S,
    conn_id: ConnectionId,
    mut outbound: mpsc::Receiver<Envelope>,
    metrics: Arc<ServerMetrics>,
    done: CancellationToken,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    while let Some(envelope) = outbound.recv().await {
        let json = match envelope.message.encode() {
            Ok(json) => json,
            Err(e) => {
                error!(conn_id = %conn_id, error = %e, "cannot encode outgoing message");
                continue;
            }
        };
        if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
            info!(conn_id = %conn_id, error = %e, "cannot write to websocket");
            done.cancel();
            return;
        }
        metrics.message_outgoing();
        metrics.observe_latency(envelope.elapsed());
    }

    let close = WsMessage::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "".into(),
    }));
    if let Err(e) = sink.send(close).await {
        debug!(conn_id = %conn_id, error = %e, "close frame not delivered");
    }
    let _ = sink.close().await;
    done.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use uuid::Uuid;

    fn text(json: &str) -> Result<WsMessage, std::io::Error> {
        Ok(WsMessage::Text(json.into()))
    }

    async fn run_reader(
        frames: Vec<Result<WsMessage, std::io::Error>>,
        capacity: usize,
    ) -> (Vec<Envelope>, Arc<ServerMetrics>, CancellationToken) {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(capacity);
        let metrics = Arc::new(ServerMetrics::new());
        let done = CancellationToken::new();
        read_loop(
            futures::stream::iter(frames),
            Uuid::new_v4(),
            "r1".to_string(),
            inbound_tx,
            metrics.clone(),
            done.clone(),
        )
        .await;

        let mut received = Vec::new();
        while let Ok(envelope) = inbound_rx.try_recv() {
            received.push(envelope);
        }
        (received, metrics, done)
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() {
        let frames = vec![
            text("{not json"),
            text(r#"{"message_id":1,"text":"a","sender":"A"}"#),
            Ok(WsMessage::Ping(Default::default())),
            Ok(WsMessage::Binary(
                br#"{"message_id":2,"text":"b","sender":"A"}"#.to_vec().into(),
            )),
            text(r#"{"message_id":3,"text":"c","sender":"A"}"#),
        ];

        let (received, metrics, done) = run_reader(frames, 8).await;

        let ids: Vec<u64> = received.iter().map(|e| e.message.message_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages.incoming, 3);
        assert_eq!(snapshot.messages.decode_errors, 1);
        // Stream exhaustion is a disconnect.
        assert!(done.is_cancelled());
    }

    #[tokio::test]
    async fn connection_room_is_stamped() {
        let frames = vec![text(r#"{"text":"hi","sender":"A","room":"elsewhere"}"#)];
        let (received, _, _) = run_reader(frames, 1).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message.room, "r1");
        assert!(received[0].should_distribute());
    }

    #[tokio::test]
    async fn close_frame_stops_reading() {
        let frames = vec![
            text(r#"{"text":"before"}"#),
            Ok(WsMessage::Close(None)),
            text(r#"{"text":"after"}"#),
        ];
        let (received, _, done) = run_reader(frames, 4).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message.text, "before");
        assert!(done.is_cancelled());
    }

    #[tokio::test]
    async fn transport_error_stops_reading() {
        let frames = vec![
            Err(std::io::Error::other("reset")),
            text(r#"{"text":"never"}"#),
        ];
        let (received, _, done) = run_reader(frames, 4).await;
        assert!(received.is_empty());
        assert!(done.is_cancelled());
    }

    #[tokio::test]
    async fn read_loop_exits_when_cancelled_while_blocked_on_full_queue() {
        let (inbound_tx, _inbound_rx) = mpsc::channel(1);
        inbound_tx
            .send(Envelope::local(Message::new(0, "filler", "X", "r1")))
            .await
            .unwrap();
        let done = CancellationToken::new();
        let frames = vec![text(r#"{"text":"blocked"}"#)];
        let task = tokio::spawn(read_loop(
            futures::stream::iter(frames).chain(futures::stream::pending()),
            Uuid::new_v4(),
            "r1".to_string(),
            inbound_tx,
            Arc::new(ServerMetrics::new()),
            done.clone(),
        ));

        tokio::task::yield_now().await;
        done.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn write_loop_drains_then_closes() {
        let (sink_tx, sink_rx) = fmpsc::unbounded::<WsMessage>();
        let (outbound_tx, outbound_rx) = mpsc::channel(4);
        outbound_tx
            .send(Envelope::local(Message::new(1, "one", "A", "r1")))
            .await
            .unwrap();
        outbound_tx
            .send(Envelope::remote(Message::new(2, "two", "B", "r1")))
            .await
            .unwrap();
        drop(outbound_tx);

        let metrics = Arc::new(ServerMetrics::new());
        let done = CancellationToken::new();
        write_loop(sink_tx, Uuid::new_v4(), outbound_rx, metrics.clone(), done.clone()).await;

        let written: Vec<WsMessage> = sink_rx.collect().await;
        assert_eq!(written.len(), 3);
        match &written[0] {
            WsMessage::Text(json) => {
                let msg = Message::decode(json.as_str().as_bytes()).unwrap();
                assert_eq!(msg.text, "one");
            }
            other => panic!("expected text frame, got {other:?}"),
        }
        match &written[2] {
            WsMessage::Close(Some(frame)) => assert_eq!(frame.code, close_code::NORMAL),
            other => panic!("expected close frame, got {other:?}"),
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages.outgoing, 2);
        assert_eq!(snapshot.latency.observations, 2);
        assert!(done.is_cancelled());
    }

    #[tokio::test]
    async fn write_failure_signals_completion() {
        let (sink_tx, sink_rx) = fmpsc::unbounded::<WsMessage>();
        drop(sink_rx);
        let (outbound_tx, outbound_rx) = mpsc::channel(4);
        outbound_tx
            .send(Envelope::local(Message::new(1, "one", "A", "r1")))
            .await
            .unwrap();
        // Sender stays alive: only the socket fails.
        let _keep = outbound_tx;

        let metrics = Arc::new(ServerMetrics::new());
        let done = CancellationToken::new();
        write_loop(sink_tx, Uuid::new_v4(), outbound_rx, metrics.clone(), done.clone()).await;

        assert!(done.is_cancelled());
        assert_eq!(metrics.snapshot().messages.outgoing, 0);
    }
}
