//! Shared Store Adapter
//!
//! The engine's view of the remote document database: single-document
//! reads, atomic multi-document batches with preconditions, query-scoped
//! realtime subscriptions and server-assigned ordering. Notifications are
//! at-least-once and carry no global ordering guarantee.

pub mod document;
pub mod memory;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub use document::{
    Change, ChangeKind, CommitReceipt, Direction, DocKey, Document, Filter, Order, Precondition,
    Query, Subscription, WriteOp, encode,
};
pub use memory::MemoryStore;

/// Store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A precondition failed; nothing was written.
    #[error("write conflict on {0}")]
    Conflict(String),

    /// Document not found.
    #[error("document not found: {0}")]
    NotFound(String),

    /// The store could not be reached or rejected the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A document body did not match the expected shape.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The subscription stream ended.
    #[error("subscription closed")]
    SubscriptionClosed,
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Document database contract.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read one document.
    async fn get(&self, key: &DocKey) -> Result<Option<Document>, StoreError>;

    /// Run a query.
    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Apply a batch atomically. Any failed precondition aborts the whole
    /// batch with [`StoreError::Conflict`].
    async fn commit(&self, writes: Vec<WriteOp>) -> Result<CommitReceipt, StoreError>;

    /// Subscribe to a query. Current matches arrive first as `Added`.
    async fn subscribe(&self, query: Query) -> Result<Subscription, StoreError>;
}

/// Shared handle to a store.
pub type SharedStore = Arc<dyn DocumentStore>;

// =============================================================================
// TRANSACTIONS
// =============================================================================

/// Optimistic read-modify-write over a bounded set of documents.
///
/// Reads record the version they saw; writes are guarded by those versions
/// and every read-only key is re-verified at commit time.
pub struct Transaction {
    store: SharedStore,
    reads: BTreeMap<DocKey, Option<u64>>,
    writes: Vec<WriteOp>,
}

impl Transaction {
    /// Start an empty transaction.
    pub fn begin(store: SharedStore) -> Self {
        Self {
            store,
            reads: BTreeMap::new(),
            writes: Vec::new(),
        }
    }

    /// Read a document and remember its version.
    pub async fn get(&mut self, key: &DocKey) -> Result<Option<Document>, StoreError> {
        let doc = self.store.get(key).await?;
        self.reads.insert(key.clone(), doc.as_ref().map(|d| d.version));
        Ok(doc)
    }

    fn guard(&self, key: &DocKey) -> Precondition {
        match self.reads.get(key) {
            Some(Some(version)) => Precondition::Version(*version),
            Some(None) => Precondition::MustNotExist,
            None => Precondition::None,
        }
    }

    /// Stage a write guarded by whatever this transaction read of `key`.
    pub fn put(&mut self, key: DocKey, data: Value) {
        let precondition = self.guard(&key);
        self.writes.push(WriteOp::Put { key, data, precondition });
    }

    /// Stage a create that must not overwrite anything.
    pub fn create(&mut self, key: DocKey, data: Value) {
        self.writes.push(WriteOp::Put {
            key,
            data,
            precondition: Precondition::MustNotExist,
        });
    }

    /// Stage a delete guarded by whatever this transaction read of `key`.
    pub fn delete(&mut self, key: DocKey) {
        let precondition = self.guard(&key);
        self.writes.push(WriteOp::Delete { key, precondition });
    }

    /// Whether anything has been staged.
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    /// Commit staged writes. Read-only transactions commit nothing.
    pub async fn commit(self) -> Result<Option<CommitReceipt>, StoreError> {
        if self.writes.is_empty() {
            return Ok(None);
        }

        let mut ops = self.writes;
        for (key, seen) in self.reads {
            if ops.iter().any(|op| op.key() == &key) {
                continue;
            }
            let precondition = match seen {
                Some(version) => Precondition::Version(version),
                None => Precondition::MustNotExist,
            };
            ops.push(WriteOp::Verify { key, precondition });
        }

        self.store.commit(ops).await.map(Some)
    }
}

/// Boxed future returned by a transaction body.
pub type TxnFuture<T, E> = Pin<Box<dyn Future<Output = Result<(Transaction, T), E>> + Send>>;

/// Run a transaction body, re-running it on write conflicts.
///
/// The body reads through the transaction, stages writes and hands the
/// transaction back with its result. Only [`StoreError::Conflict`] triggers
/// a re-run; every other error is returned to the caller untouched.
pub async fn run_transaction<T, E, F>(store: &SharedStore, attempts: usize, mut body: F) -> Result<T, E>
where
    F: FnMut(Transaction) -> TxnFuture<T, E>,
    E: From<StoreError>,
{
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        let txn = Transaction::begin(store.clone());
        let (txn, value) = body(txn).await?;

        match txn.commit().await {
            Ok(_) => return Ok(value),
            Err(StoreError::Conflict(key)) if attempt < attempts => {
                debug!("Transaction conflict on {} (attempt {}), re-running", key, attempt);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(StoreError::Conflict("transaction attempts exhausted".into()).into())
}
