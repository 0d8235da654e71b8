use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::message::Message;

/// Where an envelope entered this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Submitted by a client connected to this instance.
    Local,
    /// Injected by the distribution bridge from another instance.
    Remote,
}

/// A message in flight through the dispatcher.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: Arc<Message>,
    pub provenance: Provenance,
    /// When the message was ingested; the latency clock starts here.
    pub received_at: Instant,
}

impl Envelope {
    pub fn local(message: Message) -> Self {
        Self::new(message, Provenance::Local)
    }

    pub fn remote(message: Message) -> Self {
        Self::new(message, Provenance::Remote)
    }

    fn new(message: Message, provenance: Provenance) -> Self {
        Self {
            message: Arc::new(message),
            provenance,
            received_at: Instant::now(),
        }
    }

    /// Only local messages go out over the backbone; remote ones came from it.
    pub fn should_distribute(&self) -> bool {
        match self.provenance {
            Provenance::Local => true,
            Provenance::Remote => false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed()
    }
}
