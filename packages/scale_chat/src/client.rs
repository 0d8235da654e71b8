//! Interactive chat client (`scale-chat connect`).
//!
//! Reads lines from its input, sends each as a chat message and prints every
//! message the server relays back, with the end-to-end latency measured
//! against the message's `sent_at`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::message::Message;

/// Builds outgoing messages with per-sender incrementing ids.
#[derive(Debug)]
pub struct ChatClient {
    sender: String,
    next_id: u64,
}

impl ChatClient {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            next_id: 1,
        }
    }

    /// The room is left empty; the server stamps the connection's room.
    pub fn compose(&mut self, text: &str) -> Message {
        let message = Message::new(
            self.next_id,
            text.trim_end_matches(['\r', '\n']),
            self.sender.as_str(),
            "",
        );
        self.next_id += 1;
        message
    }
}

/// One line of client output for a received message.
pub fn describe(message: &Message, received_at: DateTime<Utc>) -> String {
    let latency_ms = (received_at - message.sent_at).num_milliseconds();
    let room = if message.room.is_empty() {
        "lobby"
    } else {
        message.room.as_str()
    };
    format!(
        "[{room}] {}: {} (#{}, {latency_ms} ms)",
        message.sender, message.text, message.message_id
    )
}

/// Chat over `url` until the input ends, Ctrl-C, or the server closes the
/// connection.
pub async fn run_session<I, F>(url: &str, sender: &str, input: I, mut on_message: F) -> Result<()>
where
    I: AsyncBufRead + Unpin,
    F: FnMut(&Message),
{
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("could not connect to {url}"))?;
    info!("connected to {url} as {sender}");
    let (mut write, mut read) = ws.split();

    let mut lines = input.lines();
    let mut client = ChatClient::new(sender);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("could not read input")? else {
                    debug!("input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let json = client.compose(&line).encode()?;
                write
                    .send(tungstenite::Message::Text(json.into()))
                    .await
                    .context("could not send message")?;
            }
            frame = read.next() => match frame {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    match Message::decode(text.as_str().as_bytes()) {
                        Ok(message) => on_message(&message),
                        Err(e) => warn!(error = %e, "unreadable message from server"),
                    }
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => {
                    info!("server closed the connection");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("connection lost"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, closing connection");
                break;
            }
        }
    }

    let close = tungstenite::Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }));
    if let Err(e) = write.send(close).await {
        warn!(error = %e, "could not close the connection gracefully");
        return Ok(());
    }
    // Wait briefly for the server's close reply.
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(Ok(frame)) = read.next().await {
            if let tungstenite::Message::Text(text) = frame {
                if let Ok(message) = Message::decode(text.as_str().as_bytes()) {
                    on_message(&message);
                }
            }
        }
    })
    .await;
    Ok(())
}

/// Stdin/stdout front end for [`run_session`].
pub async fn run_client(url: &str, sender: &str) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    run_session(url, sender, stdin, |message| {
        println!("{}", describe(message, Utc::now()));
    })
    .await
}
