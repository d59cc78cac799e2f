//! Transport-agnostic message broker abstraction.
//!
//! The [`Broker`] trait decouples the publisher and the broker consumer
//! from the concrete AMQP client. [`amqp::AmqpBroker`] talks to RabbitMQ;
//! [`memory::MemoryBroker`] reproduces the same TTL and dead-letter
//! semantics in process for tests and broker-less local runs.

pub mod amqp;
pub mod memory;
pub mod topology;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::Result;

pub use topology::{DelayQueue, Route, Topology};

/// Boxed future returned by the object-safe broker traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Broker operations needed by the scheduling pipeline.
pub trait Broker: Send + Sync {
    /// Declare exchanges, queues and bindings. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BrokerUnavailable` when disconnected, or
    /// `AppError::Broker` if a declaration conflicts with existing resources.
    fn ensure_topology<'a>(&'a self, topology: &'a Topology) -> BoxFuture<'a, Result<()>>;

    /// Publish a persistent message, optionally with a per-message TTL.
    ///
    /// An empty `exchange` addresses the default exchange, which routes by
    /// queue name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BrokerUnavailable` when disconnected, or
    /// `AppError::Broker` if this single publish was rejected.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: &'a [u8],
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Start consuming `queue` with at most `prefetch` unacknowledged messages.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BrokerUnavailable` when disconnected.
    fn subscribe<'a>(
        &'a self,
        queue: &'a str,
        prefetch: u16,
    ) -> BoxFuture<'a, Result<Box<dyn Subscription>>>;
}

/// An active consumer on one queue.
pub trait Subscription: Send {
    /// Wait for the next delivery. `Ok(None)` means the broker closed the
    /// subscription cleanly.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BrokerUnavailable` if the subscription was lost.
    fn next_message(&mut self) -> BoxFuture<'_, Result<Option<InboundMessage>>>;
}

/// Settles one delivery with the broker.
pub trait Acknowledger: Send + Sync {
    /// Acknowledge; the broker forgets the message.
    fn ack(&self) -> BoxFuture<'_, Result<()>>;

    /// Reject, optionally putting the message back at the queue head.
    fn reject(&self, requeue: bool) -> BoxFuture<'_, Result<()>>;
}

/// A message delivered by a [`Subscription`], not yet settled.
pub struct InboundMessage {
    /// Raw message body.
    pub payload: Vec<u8>,
    /// Whether the broker delivered this message before without an ack.
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl InboundMessage {
    /// Wrap a delivery with the handle that settles it.
    #[must_use]
    pub fn new(payload: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            payload,
            redelivered,
            acker,
        }
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns a broker error if the channel is gone; the broker then
    /// redelivers the message.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject the delivery.
    ///
    /// # Errors
    ///
    /// Returns a broker error if the channel is gone.
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}
