//! Work bus contract.
//!
//! The simulation distributes per-chunk work and announces ticks over a
//! bus with two delivery modes: publish/subscribe with queue-group
//! semantics (each message consumed by exactly one subscriber in a
//! group) and request/reply. [`NatsConnection`](crate::NatsConnection)
//! implements it over NATS; [`LocalBus`](crate::LocalBus) implements it
//! in-process.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::NetError;

/// A subscription handler. Returning `Some` bytes answers request/reply
/// callers; `None` means no reply.
pub type BusHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Option<Vec<u8>>> + Send + Sync>;

/// Wrap an async closure as a [`BusHandler`].
pub fn handler<F, Fut>(f: F) -> BusHandler
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Vec<u8>>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

/// Publish/subscribe with queue groups, plus request/reply.
#[async_trait]
pub trait WorkBus: Send + Sync {
    /// Publish a payload. Every queue group subscribed to the subject
    /// receives it once.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), NetError>;

    /// Send a request and wait for one reply.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::NoResponders`] when nothing is subscribed to
    /// answer, or a transport error.
    async fn request(&self, subject: &str, payload: Vec<u8>) -> Result<Vec<u8>, NetError>;

    /// Subscribe a handler under a queue group. Each message on the
    /// subject is delivered to exactly one handler per group.
    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        handler: BusHandler,
    ) -> Result<(), NetError>;
}
