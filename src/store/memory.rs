//! In-process document store
//!
//! Ids are assigned from a counter starting at 1. Insert failures can be
//! injected to exercise the worker's redelivery and dead-letter paths.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{DocumentStore, Result, StoreError};
use crate::message::{Document, DocumentId, StoredDocument};

#[derive(Default)]
struct Inner {
    documents: Mutex<Vec<StoredDocument>>,
    failing_inserts: AtomicUsize,
    rejected_inserts: AtomicUsize,
    offline: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn documents(&self) -> MutexGuard<'_, Vec<StoredDocument>> {
        self.inner.documents.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `count` inserts with `StoreError::Unavailable`.
    pub fn fail_next_inserts(&self, count: usize) {
        self.inner.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// Reject the next `count` inserts with `StoreError::Query`, as a database
    /// does for a statement it will never accept.
    pub fn reject_next_inserts(&self, count: usize) {
        self.inner.rejected_inserts.store(count, Ordering::SeqCst);
    }

    /// Take the whole store offline (every operation fails) or bring it back.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.documents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents().is_empty()
    }

    /// Snapshot of all documents in insertion order
    pub fn documents_snapshot(&self) -> Vec<StoredDocument> {
        self.documents().clone()
    }

    fn check_online(&self) -> Result<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_one(&self, document: Document) -> Result<DocumentId> {
        self.check_online()?;

        if take_one(&self.inner.failing_inserts) {
            return Err(StoreError::Unavailable("injected insert failure".to_string()));
        }
        if take_one(&self.inner.rejected_inserts) {
            return Err(StoreError::Query("injected insert rejection".to_string()));
        }

        let mut documents = self.documents();
        let id = documents.last().map(|d| d.id + 1).unwrap_or(1);
        documents.push(StoredDocument {
            id,
            body: document.into_body(),
            stored_at: Utc::now(),
        });
        Ok(id)
    }

    async fn find_latest(&self) -> Result<Option<StoredDocument>> {
        self.check_online()?;
        Ok(self.documents().iter().max_by_key(|d| d.id).cloned())
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }
}

/// Decrement `counter` if it is non-zero. Returns whether it was.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
