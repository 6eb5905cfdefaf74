//! Document store client
//!
//! Stores accept schema-less JSON documents and hand back a generated id that
//! grows with insertion order, which is what "latest" means on the read path.
//!
//! Backends:
//! - `postgres::PostgresStore`: JSONB rows through Diesel with an r2d2 pool
//! - [`memory::MemoryStore`]: in-process store for standalone runs and tests

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::{Document, DocumentId, StoredDocument};

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection or pool failure
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Statement failed on a live connection
    #[error("query failed: {0}")]
    Query(String),

    #[error("invalid collection name '{0}'")]
    InvalidCollection(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert one document and return its generated id.
    async fn insert_one(&self, document: Document) -> Result<DocumentId>;

    /// The document with the greatest id, if any.
    async fn find_latest(&self) -> Result<Option<StoredDocument>>;

    /// Check store connectivity.
    async fn ping(&self) -> Result<()>;
}

/// Collection names end up in SQL, so only plain identifiers are accepted.
pub fn validate_collection(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);

    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && name.len() <= 63 {
        Ok(())
    } else {
        Err(StoreError::InvalidCollection(name.to_string()))
    }
}
