//! Client Registry
//!
//! The set of currently-connected clients. Every access goes through one
//! async reader/writer lock: handlers take the write side to add and remove,
//! the dispatcher takes the read side to fan out.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use super::envelope::Envelope;

pub type ConnectionId = Uuid;

/// One connected client as seen by the dispatcher.
///
/// The registry owns the only sender of the outbound queue, so removing the
/// record closes the queue and lets the write loop drain and exit.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub room: String,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Envelope>,
}

impl ConnectionRecord {
    pub fn new(room: impl Into<String>, outbound: mpsc::Sender<Envelope>) -> Self {
        Self {
            id: Uuid::new_v4(),
            room: room.into(),
            connected_at: Utc::now(),
            outbound,
        }
    }

    /// Non-blocking push onto the outbound queue.
    pub fn try_send(&self, envelope: Envelope) -> Result<(), mpsc::error::TrySendError<Envelope>> {
        self.outbound.try_send(envelope)
    }
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionRecord>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, record: ConnectionRecord) {
        let mut conns = self.connections.write().await;
        conns.insert(record.id, record);
    }

    /// Remove a connection. Returns false if it was already gone; both loops
    /// of a handler may race to get here.
    pub async fn remove(&self, id: &ConnectionId) -> bool {
        let mut conns = self.connections.write().await;
        conns.remove(id).is_some()
    }

    /// Call `f` for every connection in `room` while holding the read lock.
    /// `f` must not block.
    pub async fn for_each_in_room<F>(&self, room: &str, mut f: F)
    where
        F: FnMut(&ConnectionRecord),
    {
        let conns = self.connections.read().await;
        for record in conns.values().filter(|r| r.room == room) {
            f(record);
        }
    }

    #[cfg(test)]
    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Connection count per room, keyed by room name ("" is the lobby).
    pub async fn room_counts(&self) -> BTreeMap<String, usize> {
        let conns = self.connections.read().await;
        let mut counts = BTreeMap::new();
        for record in conns.values() {
            *counts.entry(record.room.clone()).or_default() += 1;
        }
        counts
    }
}
