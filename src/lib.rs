//! # docrelay: durable work-queue relay
//!
//! Small JSON payloads come in over HTTP, are published to a durable queue and
//! are persisted to a document store by a background worker, at least once.
//!
//! ```text
//! POST /data ─► Gateway ─► Broker.publish ─► queue ─► RelayWorker ─► Store.insert_one ─► ack
//! GET  /data ─► Gateway ─► Store.find_latest
//! ```
//!
//! A message leaves the queue only after its document has been inserted. Store
//! outages therefore delay messages but never lose them; the broker keeps
//! redelivering until an insert succeeds.
//!
//! ## Backends
//!
//! - Broker: NATS JetStream (work-queue stream, durable pull consumer) or in-memory
//! - Store: PostgreSQL JSONB through Diesel and r2d2 (feature `postgres`) or in-memory
//!
//! ## Example: wiring it up
//!
//! ```ignore
//! let config = RelayConfig::from_env()?;
//! let broker: Arc<dyn Broker> = Arc::new(NatsBroker::connect(&config.broker).await?);
//! let store: Arc<dyn DocumentStore> = Arc::new(PostgresStore::connect(&config.store).await?);
//!
//! let worker = RelayWorker::new(broker.clone(), store.clone(), &config.broker.queue, config.worker.clone()).spawn();
//! let state = Arc::new(AppState::new(broker, store, &config.broker.queue));
//! gateway::serve(listener, state, shutdown_signal()).await?;
//! worker.shutdown().await;
//! ```

pub mod analysis;
pub mod broker;
pub mod config;
pub mod gateway;
pub mod message;
pub mod store;
pub mod worker;

// Re-export key types
pub use analysis::{process_text, TextAnalysis};
pub use broker::{Broker, BrokerError, Delivery, DeliveryStream, MemoryBroker, NatsBroker};
pub use config::{BrokerConfig, ConfigError, RelayConfig, StoreConfig, WorkerConfig};
pub use gateway::{AppError, AppState};
pub use message::{DecodeError, Document, DocumentId, Payload, PayloadValue, StoredDocument};
pub use store::{DocumentStore, MemoryStore, StoreError};
pub use worker::{DecodeFailurePolicy, Outcome, RelayWorker, WorkerHandle, WorkerState, WorkerStats};

#[cfg(feature = "postgres")]
pub use store::PostgresStore;
