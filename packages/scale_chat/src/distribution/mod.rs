//! Cross-instance distribution over a publish/subscribe backbone.

pub mod backbone;
pub mod bridge;
pub mod redis;

pub use backbone::{Backbone, MemoryBackbone, PayloadStream};
pub use bridge::{BridgeTasks, DistributionBridge};
pub use self::redis::RedisBackbone;
