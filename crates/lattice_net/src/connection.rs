//! NATS connection management.
//!
//! Provides a thin wrapper around `async-nats` with world-specific
//! defaults, and the NATS implementation of the [`WorkBus`] contract.

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{info, warn};

use crate::bus::{BusHandler, WorkBus};
use crate::error::NetError;

/// Default NATS server URL.
pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";

/// The environment variable used to override the NATS URL.
pub const NATS_URL_ENV: &str = "NATS_URL";

/// A wrapper around an `async-nats` client.
#[derive(Debug, Clone)]
pub struct NatsConnection {
    client: async_nats::Client,
}

impl NatsConnection {
    /// Connect to NATS using the URL from the `NATS_URL` environment
    /// variable, falling back to [`DEFAULT_NATS_URL`].
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Connect`] if the connection cannot be
    /// established.
    pub async fn connect() -> Result<Self, NetError> {
        let url = std::env::var(NATS_URL_ENV).unwrap_or_else(|_| DEFAULT_NATS_URL.to_string());
        Self::connect_to(&url).await
    }

    /// Connect to NATS at the specified URL.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Connect`] if the connection cannot be
    /// established.
    pub async fn connect_to(url: &str) -> Result<Self, NetError> {
        info!(url, "connecting to NATS");
        let client = async_nats::connect(url).await?;
        info!("NATS connection established");
        Ok(Self { client })
    }

    /// Returns a reference to the underlying `async-nats` client.
    #[must_use]
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl WorkBus for NatsConnection {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), NetError> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await?;
        Ok(())
    }

    async fn request(&self, subject: &str, payload: Vec<u8>) -> Result<Vec<u8>, NetError> {
        let message = self
            .client
            .request(subject.to_string(), payload.into())
            .await?;
        Ok(message.payload.to_vec())
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        handler: BusHandler,
    ) -> Result<(), NetError> {
        let mut subscription = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await?;
        info!(subject, group, "queue subscription established");

        let client = self.client.clone();
        tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                let reply = handler(message.payload.to_vec()).await;
                if let (Some(bytes), Some(reply_to)) = (reply, message.reply) {
                    if let Err(error) = client.publish(reply_to, bytes.into()).await {
                        warn!(%error, "failed to publish reply");
                    }
                }
            }
        });
        Ok(())
    }
}
