//! Broker client
//!
//! A broker holds one durable queue, accepts persistent publishes and hands out
//! deliveries that must be explicitly acked. Anything left unacked is
//! redelivered by the broker, which is the only recovery mechanism the relay
//! relies on.
//!
//! Backends:
//! - [`nats::NatsBroker`]: NATS JetStream work-queue stream
//! - [`memory::MemoryBroker`]: in-process queue for standalone runs and tests

pub mod memory;
pub mod nats;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryBroker;
pub use nats::NatsBroker;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Connection could not be established or the broker did not confirm
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Failure while receiving or settling a delivery
    #[error("delivery error: {0}")]
    Delivery(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Name of the dead-letter queue paired with `queue`
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}.dead", queue)
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare `queue` as durable. Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Publish one persistent message. Returns once the broker has accepted it.
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()>;

    /// Start consuming `queue` with manual acknowledgment.
    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>>;

    /// Check the broker connection.
    async fn ping(&self) -> Result<()>;
}

#[async_trait]
pub trait DeliveryStream: Send {
    /// Wait for the next delivery. `None` means the subscription ended.
    async fn next_delivery(&mut self) -> Option<Result<Box<dyn Delivery>>>;
}

/// One delivery attempt of a queued message
#[async_trait]
pub trait Delivery: Send + Sync {
    fn body(&self) -> &[u8];

    /// Delivery attempt number, starting at 1
    fn delivery_count(&self) -> u64;

    /// Remove the message from the queue.
    async fn ack(&self) -> Result<()>;

    /// Return the message to the queue, optionally delaying redelivery.
    async fn nack(&self, delay: Option<Duration>) -> Result<()>;
}
