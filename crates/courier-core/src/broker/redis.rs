//! Redis pub/sub [`Broker`].

use super::{Broker, Subscription};
use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::debug;

/// Broker over Redis `PUBLISH` / `SUBSCRIBE`.
///
/// Publishing shares the store's managed connection; each subscription
/// opens its own dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    conn: ConnectionManager,
}

impl RedisBroker {
    #[must_use]
    pub fn new(client: Client, conn: ConnectionManager) -> Self {
        Self { client, conn }
    }

    /// Open a broker with its own managed publish connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the first connection fails.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = Client::open(url).map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(Self::new(client, conn))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let receivers: u64 = conn
            .publish(topic, payload.as_ref())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        debug!(topic = %topic, receivers, "Published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        Ok(pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()))
            .boxed())
    }
}
