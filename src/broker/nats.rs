//! NATS JetStream broker
//!
//! Each queue maps to a file-backed JetStream stream with work-queue retention,
//! so a message stays in the stream until a consumer acks it. The worker pulls
//! through a durable consumer with explicit acks and no delivery cap.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy},
    stream::{RetentionPolicy, StorageType},
    AckKind,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

use super::{Broker, BrokerError, Delivery, DeliveryStream, Result};
use crate::config::BrokerConfig;

/// Stream name for a queue; JetStream only allows a restricted alphabet.
pub fn stream_name(queue: &str) -> String {
    queue
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect::<String>()
        .to_uppercase()
}

/// Subject the stream for `queue` listens on
pub fn subject(queue: &str) -> String {
    let token: String = queue
        .chars()
        .map(|c| if c.is_whitespace() || c == '*' || c == '>' { '_' } else { c })
        .collect();
    format!("relay.{}", token)
}

#[derive(Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    consumer_name: Option<String>,
    ack_wait: Duration,
}

impl NatsBroker {
    /// Connect to NATS and initialize JetStream.
    ///
    /// The connection is multiplexed; clones share it, so the gateway and the
    /// worker publish and consume over one socket.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| BrokerError::Unavailable(format!("connect to {}: {}", config.url, e)))?;
        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            consumer_name: config.consumer_name.clone(),
            ack_wait: config.ack_wait,
        })
    }

    fn consumer_name(&self, queue: &str) -> String {
        self.consumer_name
            .clone()
            .unwrap_or_else(|| format!("{}_relay", stream_name(queue)))
    }

    async fn get_or_create_stream(&self, queue: &str) -> Result<jetstream::stream::Stream> {
        let name = stream_name(queue);
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: name.clone(),
                subjects: vec![subject(queue)],
                retention: RetentionPolicy::WorkQueue,
                storage: StorageType::File,
                num_replicas: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Unavailable(format!("declare stream {}: {}", name, e)))
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.get_or_create_stream(queue).await?;
        tracing::info!(queue, stream = %stream_name(queue), "JetStream stream ready");
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()> {
        let subject = subject(queue);

        let ack = self
            .jetstream
            .publish(subject.clone(), body.into())
            .await
            .map_err(|e| BrokerError::Unavailable(format!("publish to {}: {}", subject, e)))?;

        // The publish ack means the message is on disk
        ack.await
            .map_err(|e| BrokerError::Unavailable(format!("publish ack from {}: {}", subject, e)))?;

        tracing::debug!(%subject, "Published message to JetStream");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>> {
        let stream = self.get_or_create_stream(queue).await?;
        let consumer_name = self.consumer_name(queue);

        let consumer = stream
            .get_or_create_consumer(
                &consumer_name,
                pull::Config {
                    durable_name: Some(consumer_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.ack_wait,
                    max_deliver: -1,
                    filter_subject: subject(queue),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::Unavailable(format!("create consumer {}: {}", consumer_name, e)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("subscribe {}: {}", consumer_name, e)))?;

        tracing::info!(queue, consumer = %consumer_name, "JetStream consumer ready");

        Ok(Box::new(NatsDeliveryStream { messages }))
    }

    async fn ping(&self) -> Result<()> {
        if self.client.connection_state() == async_nats::connection::State::Connected {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("NATS connection is not established".to_string()))
        }
    }
}

struct NatsDeliveryStream {
    messages: pull::Stream,
}

#[async_trait]
impl DeliveryStream for NatsDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Box<dyn Delivery>>> {
        let next = self.messages.next().await?;

        Some(match next {
            Ok(message) => {
                let delivered = message
                    .info()
                    .map(|info| info.delivered.max(1) as u64)
                    .unwrap_or(1);
                Ok(Box::new(NatsDelivery { message, delivered }) as Box<dyn Delivery>)
            }
            Err(e) => Err(BrokerError::Delivery(e.to_string())),
        })
    }
}

struct NatsDelivery {
    message: jetstream::Message,
    delivered: u64,
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn body(&self) -> &[u8] {
        &self.message.payload
    }

    fn delivery_count(&self) -> u64 {
        self.delivered
    }

    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BrokerError::Delivery(format!("ack: {}", e)))
    }

    async fn nack(&self, delay: Option<Duration>) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| BrokerError::Delivery(format!("nak: {}", e)))
    }
}
