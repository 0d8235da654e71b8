//! Error types for the relay and the distribution bridge.

/// A single inbound frame could not be turned into a chat message.
///
/// Always local to one frame: the connection keeps running.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed message payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Failures talking to the publish/subscribe backbone.
#[derive(Debug, thiserror::Error)]
pub enum BackboneError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("invalid backbone address: {0}")]
    InvalidAddress(String),

    #[error("backbone unreachable: {0}")]
    Unreachable(String),

    #[error("backbone bus closed")]
    Closed,
}

/// Errors that are fatal to a distribution-enabled instance.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("could not connect to the backbone after retry: {0}")]
    Connect(#[source] BackboneError),

    #[error("could not subscribe to topic {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BackboneError,
    },

    #[error("publish to topic {topic} failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: BackboneError,
    },

    #[error("could not encode distribution message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("subscription to topic {0} closed")]
    SubscriptionClosed(String),

    #[error("distribution task aborted: {0}")]
    TaskAborted(String),
}
