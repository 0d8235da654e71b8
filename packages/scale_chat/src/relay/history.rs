use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::message::Message;

/// Append-only record of every message this instance dispatched.
///
/// `limit == 0` keeps everything for the life of the process; otherwise the
/// oldest entries are evicted once the limit is reached.
#[derive(Debug)]
pub struct HistoryLog {
    entries: Mutex<VecDeque<Arc<Message>>>,
    limit: usize,
}

impl HistoryLog {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            limit,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    pub async fn append(&self, message: Arc<Message>) {
        let mut entries = self.entries.lock().await;
        if self.limit > 0 && entries.len() == self.limit {
            entries.pop_front();
        }
        entries.push_back(message);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// The most recent `n` messages, oldest first.
    #[cfg(test)]
    pub async fn recent(&self, n: usize) -> Vec<Arc<Message>> {
        let entries = self.entries.lock().await;
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }
}
