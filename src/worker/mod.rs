//! Relay worker
//!
//! One long-lived task per process consumes the queue, turns each message into
//! a document and acks it only after the store has accepted the insert. Store
//! failures leave the message with the broker (nacked for redelivery) and the
//! loop moves on; nothing a single message does can stop the worker.
//!
//! The task is supervised: [`RelayWorker::spawn`] returns a [`WorkerHandle`]
//! whose [`WorkerHandle::shutdown`] signals the loop and joins it. A message
//! already being processed is settled before the loop exits.

mod handle;

pub use handle::{WorkerHandle, WorkerState, WorkerStats};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::analysis::process_text;
use crate::broker::{dead_letter_queue, Broker, Delivery, DeliveryStream};
use crate::config::WorkerConfig;
use crate::message::{Document, DocumentId, Payload};
use crate::store::{DocumentStore, StoreError};
use handle::Shared;

/// What to do with a message that cannot be decoded or that the store rejects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeFailurePolicy {
    /// Ack and discard. The message is lost.
    Drop,
    /// Nack until the message has been delivered `max_attempts` times, then
    /// move the raw body to `<queue>.dead` and ack.
    DeadLetter { max_attempts: u64 },
}

/// How a single delivery was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Stored(DocumentId),
    /// Left with the broker for redelivery
    Retried,
    Dropped,
    DeadLettered,
}

pub struct RelayWorker {
    broker: Arc<dyn Broker>,
    store: Arc<dyn DocumentStore>,
    queue: String,
    config: WorkerConfig,
}

impl RelayWorker {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn DocumentStore>,
        queue: impl Into<String>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            store,
            queue: queue.into(),
            config,
        }
    }

    /// Start the consume loop on its own task.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared::new());

        let task_shared = shared.clone();
        let join = tokio::spawn(async move {
            self.run(shutdown_rx, &task_shared).await;
            task_shared.set_state(WorkerState::Stopped);
        });

        WorkerHandle::new(shutdown_tx, join, shared)
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>, shared: &Shared) {
        while !*shutdown.borrow() {
            let mut deliveries = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.subscribe() => match result {
                    Some(deliveries) => deliveries,
                    None => {
                        if wait_or_shutdown(&mut shutdown, self.config.reconnect_delay).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            tracing::info!(queue = %self.queue, "Relay worker waiting for messages");

            loop {
                shared.set_state(WorkerState::WaitingForMessage);

                let next = tokio::select! {
                    _ = shutdown.changed() => return,
                    next = deliveries.next_delivery() => next,
                };

                match next {
                    Some(Ok(delivery)) => {
                        shared.set_state(WorkerState::Processing);
                        let outcome = self.process(delivery.as_ref()).await;
                        shared.record(&outcome);
                    }
                    Some(Err(e)) => {
                        tracing::error!(queue = %self.queue, error = %e, "Delivery stream failed, resubscribing");
                        break;
                    }
                    None => {
                        tracing::warn!(queue = %self.queue, "Delivery stream ended, resubscribing");
                        break;
                    }
                }
            }

            if wait_or_shutdown(&mut shutdown, self.config.reconnect_delay).await {
                break;
            }
        }
    }

    async fn subscribe(&self) -> Option<Box<dyn DeliveryStream>> {
        if let Err(e) = self.broker.declare_queue(&self.queue).await {
            tracing::error!(queue = %self.queue, error = %e, "Failed to declare queue");
            return None;
        }

        if let DecodeFailurePolicy::DeadLetter { .. } = self.config.decode_failure {
            let dead = dead_letter_queue(&self.queue);
            if let Err(e) = self.broker.declare_queue(&dead).await {
                tracing::warn!(queue = %dead, error = %e, "Failed to declare dead-letter queue");
            }
        }

        match self.broker.consume(&self.queue).await {
            Ok(deliveries) => Some(deliveries),
            Err(e) => {
                tracing::error!(queue = %self.queue, error = %e, "Failed to subscribe");
                None
            }
        }
    }

    /// Decode, transform, insert, then ack or nack one delivery.
    ///
    /// An unreachable store leaves the message for redelivery without limit.
    /// A message the store refuses outright is treated like one that cannot be
    /// decoded and goes through the [`DecodeFailurePolicy`].
    pub async fn process(&self, delivery: &dyn Delivery) -> Outcome {
        let payload = match Payload::decode(delivery.body()) {
            Ok(payload) => payload,
            Err(e) => return self.handle_poison(delivery, &e.to_string()).await,
        };

        let analysis = if self.config.analyze_text {
            payload.text().map(process_text)
        } else {
            None
        };
        let document = Document::from_payload(&payload, analysis);

        match self.store.insert_one(document).await {
            Ok(id) => {
                tracing::info!(id, queue = %self.queue, "Stored document");
                if let Err(e) = delivery.ack().await {
                    // The broker will redeliver and the document will be stored twice
                    tracing::error!(id, error = %e, "Failed to ack stored message");
                }
                Outcome::Stored(id)
            }
            Err(StoreError::Unavailable(e)) => {
                tracing::error!(
                    queue = %self.queue,
                    attempt = delivery.delivery_count(),
                    error = %e,
                    "Store unavailable, message left for redelivery"
                );
                if let Err(e) = delivery.nack(Some(self.config.redelivery_delay)).await {
                    tracing::error!(error = %e, "Failed to nack message");
                }
                Outcome::Retried
            }
            Err(e) => self.handle_poison(delivery, &e.to_string()).await,
        }
    }

    /// Settle a message that cannot be stored as it is.
    async fn handle_poison(&self, delivery: &dyn Delivery, reason: &str) -> Outcome {
        let attempt = delivery.delivery_count();

        match self.config.decode_failure {
            DecodeFailurePolicy::Drop => {
                tracing::warn!(queue = %self.queue, attempt, reason, "Dropping unprocessable message");
                if let Err(e) = delivery.ack().await {
                    tracing::error!(error = %e, "Failed to ack dropped message");
                }
                Outcome::Dropped
            }
            DecodeFailurePolicy::DeadLetter { max_attempts } if attempt < max_attempts => {
                tracing::warn!(
                    queue = %self.queue,
                    attempt,
                    max_attempts,
                    reason,
                    "Unprocessable message, returning for redelivery"
                );
                if let Err(e) = delivery.nack(Some(self.config.redelivery_delay)).await {
                    tracing::error!(error = %e, "Failed to nack message");
                }
                Outcome::Retried
            }
            DecodeFailurePolicy::DeadLetter { .. } => {
                let dead = dead_letter_queue(&self.queue);

                let moved = match self.broker.declare_queue(&dead).await {
                    Ok(()) => self.broker.publish(&dead, delivery.body().to_vec()).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = moved {
                    tracing::error!(queue = %dead, error = %e, "Dead-letter publish failed, returning message");
                    if let Err(e) = delivery.nack(Some(self.config.redelivery_delay)).await {
                        tracing::error!(error = %e, "Failed to nack message");
                    }
                    return Outcome::Retried;
                }

                tracing::warn!(queue = %self.queue, dead_letter = %dead, attempt, reason, "Moved unprocessable message to dead-letter queue");
                if let Err(e) = delivery.ack().await {
                    tracing::error!(error = %e, "Failed to ack dead-lettered message");
                }
                Outcome::DeadLettered
            }
        }
    }
}

/// Sleep for `delay` unless shutdown is requested first. Returns true on shutdown.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
    }
}
