//! Redis PUBLISH/SUBSCRIBE backbone.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, ConnectionInfo, IntoConnectionInfo};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::backbone::{Backbone, PayloadStream};
use crate::error::BackboneError;

pub struct RedisBackbone {
    client: redis::Client,
    /// Shared connection for PING and PUBLISH, opened on first use.
    commands: OnceCell<MultiplexedConnection>,
}

impl RedisBackbone {
    /// `server` is either `host:port` or a `redis://` / `rediss://` URL. A
    /// non-empty `password` overrides any password in the URL.
    pub fn new(server: &str, password: &str) -> Result<Self, BackboneError> {
        let info = connection_info(server, password)?;
        Ok(Self {
            client: redis::Client::open(info)?,
            commands: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BackboneError> {
        let conn = self
            .commands
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await?;
        Ok(conn.clone())
    }
}

fn connection_info(server: &str, password: &str) -> Result<ConnectionInfo, BackboneError> {
    let server = server.trim();
    let mut info = if server.contains("://") {
        server.into_connection_info()?
    } else {
        let invalid = || BackboneError::InvalidAddress(server.to_string());
        let (host, port) = server.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if host.is_empty() {
            return Err(invalid());
        }
        (host, port).into_connection_info()?
    };
    if !password.is_empty() {
        info.redis.password = Some(password.to_string());
    }
    Ok(info)
}

#[async_trait]
impl Backbone for RedisBackbone {
    async fn ping(&self) -> Result<(), BackboneError> {
        let mut conn = self.connection().await?;
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(reply = %reply, "redis ping");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), BackboneError> {
        let mut conn = self.connection().await?;
        let _receivers: i64 = conn.publish(topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<PayloadStream, BackboneError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(channel = %msg.get_channel_name(), error = %e, "non-text payload on backbone");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
