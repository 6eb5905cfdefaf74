//! In-process broker
//!
//! Durable only for the life of the process. Used by `docrelay --memory` and by
//! the tests. Nacked deliveries go back to the head of their queue, and so do
//! deliveries dropped without being settled, which stands in for a consumer
//! disconnecting mid-message.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use super::{Broker, BrokerError, Delivery, DeliveryStream, Result};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Entry>,
    in_flight: usize,
    published: u64,
}

struct Entry {
    body: Vec<u8>,
    deliveries: u64,
}

struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    available: AtomicBool,
}

impl Inner {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn requeue(&self, queue: &str, entry: Entry) {
        {
            let mut queues = self.queues();
            let state = queues.entry(queue.to_string()).or_default();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.ready.push_front(entry);
        }
        self.notify.notify_waiters();
    }

    fn settle(&self, queue: &str) {
        let mut queues = self.queues();
        if let Some(state) = queues.get_mut(queue) {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate the broker going away (publishes and pings fail) or coming back.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Messages waiting to be delivered
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner.queues().get(queue).map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Messages delivered but not yet acked or nacked
    pub fn in_flight_count(&self, queue: &str) -> usize {
        self.inner.queues().get(queue).map(|s| s.in_flight).unwrap_or(0)
    }

    /// Total successful publishes to `queue`
    pub fn published_count(&self, queue: &str) -> u64 {
        self.inner.queues().get(queue).map(|s| s.published).unwrap_or(0)
    }

    /// Bodies waiting in `queue`, head first
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .queues()
            .get(queue)
            .map(|s| s.ready.iter().map(|e| e.body.clone()).collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("memory broker is offline".to_string()))
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.check_available()?;
        self.inner.queues().entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()> {
        self.check_available()?;
        {
            let mut queues = self.inner.queues();
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::Unavailable(format!("queue '{}' is not declared", queue)))?;
            state.ready.push_back(Entry { body, deliveries: 0 });
            state.published += 1;
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>> {
        self.check_available()?;
        if !self.inner.queues().contains_key(queue) {
            return Err(BrokerError::Unavailable(format!("queue '{}' is not declared", queue)));
        }

        Ok(Box::new(MemoryDeliveryStream {
            inner: self.inner.clone(),
            queue: queue.to_string(),
        }))
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

struct MemoryDeliveryStream {
    inner: Arc<Inner>,
    queue: String,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Box<dyn Delivery>>> {
        loop {
            // Register for wakeups before looking, so a publish in between is not missed
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queues = self.inner.queues();
                let state = queues.entry(self.queue.clone()).or_default();
                if let Some(mut entry) = state.ready.pop_front() {
                    entry.deliveries += 1;
                    state.in_flight += 1;

                    let delivery = MemoryDelivery {
                        inner: self.inner.clone(),
                        queue: self.queue.clone(),
                        body: entry.body,
                        deliveries: entry.deliveries,
                        settled: AtomicBool::new(false),
                    };
                    return Some(Ok(Box::new(delivery) as Box<dyn Delivery>));
                }
            }

            notified.await;
        }
    }
}

struct MemoryDelivery {
    inner: Arc<Inner>,
    queue: String,
    body: Vec<u8>,
    deliveries: u64,
    settled: AtomicBool,
}

impl MemoryDelivery {
    fn mark_settled(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Delivery("delivery already settled".to_string()));
        }
        Ok(())
    }

    fn entry(&self) -> Entry {
        Entry {
            body: self.body.clone(),
            deliveries: self.deliveries,
        }
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn delivery_count(&self) -> u64 {
        self.deliveries
    }

    async fn ack(&self) -> Result<()> {
        self.mark_settled()?;
        self.inner.settle(&self.queue);
        Ok(())
    }

    async fn nack(&self, delay: Option<Duration>) -> Result<()> {
        self.mark_settled()?;

        match delay.filter(|d| !d.is_zero()) {
            None => self.inner.requeue(&self.queue, self.entry()),
            Some(delay) => {
                let inner = self.inner.clone();
                let queue = self.queue.clone();
                let entry = self.entry();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.requeue(&queue, entry);
                });
            }
        }
        Ok(())
    }
}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.inner.requeue(&self.queue, self.entry());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn declared(queue: &str) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.declare_queue(queue).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_publish_requires_declared_queue() {
        let broker = MemoryBroker::new();
        let err = broker.publish("missing", b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_fifo_delivery_and_ack() {
        let broker = declared("q").await;
        broker.publish("q", b"one".to_vec()).await.unwrap();
        broker.publish("q", b"two".to_vec()).await.unwrap();

        let mut stream = broker.consume("q").await.unwrap();
        let first = stream.next_delivery().await.unwrap().unwrap();
        assert_eq!(first.body(), b"one");
        assert_eq!(first.delivery_count(), 1);
        assert_eq!(broker.in_flight_count("q"), 1);

        first.ack().await.unwrap();
        assert_eq!(broker.in_flight_count("q"), 0);
        assert!(first.ack().await.is_err());

        let second = stream.next_delivery().await.unwrap().unwrap();
        assert_eq!(second.body(), b"two");
        second.ack().await.unwrap();

        assert_eq!(broker.ready_count("q"), 0);
        assert_eq!(broker.published_count("q"), 2);
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_count() {
        let broker = declared("q").await;
        broker.publish("q", b"retry".to_vec()).await.unwrap();

        let mut stream = broker.consume("q").await.unwrap();
        let delivery = stream.next_delivery().await.unwrap().unwrap();
        delivery.nack(None).await.unwrap();

        let again = stream.next_delivery().await.unwrap().unwrap();
        assert_eq!(again.body(), b"retry");
        assert_eq!(again.delivery_count(), 2);
        again.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_delayed_nack_redelivers_later() {
        let broker = declared("q").await;
        broker.publish("q", b"later".to_vec()).await.unwrap();

        let mut stream = broker.consume("q").await.unwrap();
        let delivery = stream.next_delivery().await.unwrap().unwrap();
        delivery.nack(Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(broker.ready_count("q"), 0);

        let again = tokio::time::timeout(Duration::from_secs(2), stream.next_delivery())
            .await
            .expect("redelivery timed out")
            .unwrap()
            .unwrap();
        assert_eq!(again.delivery_count(), 2);
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_redelivered() {
        let broker = declared("q").await;
        broker.publish("q", b"lost".to_vec()).await.unwrap();

        let mut stream = broker.consume("q").await.unwrap();
        drop(stream.next_delivery().await.unwrap().unwrap());

        assert_eq!(broker.ready_count("q"), 1);
        assert_eq!(broker.in_flight_count("q"), 0);
    }

    #[tokio::test]
    async fn test_consumer_wakes_on_publish() {
        let broker = declared("q").await;
        let mut stream = broker.consume("q").await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("q", b"late".to_vec()).await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), stream.next_delivery())
            .await
            .expect("consumer was never woken")
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body(), b"late");
    }

    #[tokio::test]
    async fn test_offline_broker_rejects_publish() {
        let broker = declared("q").await;
        broker.set_available(false);

        assert!(broker.publish("q", b"x".to_vec()).await.is_err());
        assert!(broker.ping().await.is_err());

        broker.set_available(true);
        broker.publish("q", b"x".to_vec()).await.unwrap();
        assert!(broker.ping().await.is_ok());
    }
}
