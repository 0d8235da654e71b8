//! Horizontally-scalable WebSocket chat relay.
//!
//! Clients connect to `/ws/{room}` on any instance and receive every message
//! posted to that room on any instance sharing the same backbone topic.

pub mod client;
pub mod config;
pub mod distribution;
pub mod error;
pub mod handlers;
pub mod message;
pub mod metrics;
pub mod relay;
pub mod server;

pub use config::ChatConfig;
pub use error::{BackboneError, BridgeError, DecodeError};
pub use message::{DistributionMessage, Message};
pub use server::{ChatServer, RunningServer};
