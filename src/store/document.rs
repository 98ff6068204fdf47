//! Document, query and write types shared by every store implementation.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::StoreError;

/// Address of one document.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocKey {
    /// Collection name.
    pub collection: String,
    /// Document id, unique within the collection.
    pub id: String,
}

impl DocKey {
    /// Build a key.
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A stored document with its store-assigned metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    /// Document address.
    pub key: DocKey,
    /// JSON object body.
    pub data: Value,
    /// Per-document write counter, starts at 1.
    pub version: u64,
    /// Store-wide sequence of the commit that created the document.
    pub create_seq: u64,
    /// Store-wide sequence of the last commit that touched the document.
    pub update_seq: u64,
    /// Server clock at creation.
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Deserialize the body into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Read a top-level field, treating a missing field as null.
    pub fn field(&self, name: &str) -> &Value {
        self.data.get(name).unwrap_or(&Value::Null)
    }
}

/// Serialize a record into a document body.
pub fn encode<T: Serialize>(record: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(record)?)
}

// =============================================================================
// QUERIES
// =============================================================================

/// Equality predicate on a top-level field.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// Field equals value.
    Eq(String, Value),
    /// Field differs from value. A missing field counts as null.
    NotEq(String, Value),
    /// Field is missing or null.
    IsNull(String),
}

impl Filter {
    /// `field == value`
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    /// `field != value`
    pub fn not_eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::NotEq(field.to_string(), value.into())
    }

    /// `field == null`
    pub fn is_null(field: &str) -> Self {
        Filter::IsNull(field.to_string())
    }

    fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Eq(field, value) => doc.field(field) == value,
            Filter::NotEq(field, value) => doc.field(field) != value,
            Filter::IsNull(field) => doc.field(field).is_null(),
        }
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// Result ordering.
#[derive(Clone, Debug, PartialEq)]
pub enum Order {
    /// By creation sequence (server-assigned).
    Created(Direction),
    /// By last update sequence (server-assigned).
    Updated(Direction),
    /// By a top-level field (numbers, then strings; nulls first).
    Field(String, Direction),
}

impl Order {
    /// Compare two documents under this ordering.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let (ord, dir) = match self {
            Order::Created(dir) => (a.create_seq.cmp(&b.create_seq), *dir),
            Order::Updated(dir) => (a.update_seq.cmp(&b.update_seq), *dir),
            Order::Field(field, dir) => (compare_values(a.field(field), b.field(field)), *dir),
        };
        match dir {
            Direction::Ascending => ord,
            Direction::Descending => ord.reverse(),
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// A collection-scoped query.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    /// Collection to search.
    pub collection: String,
    /// All filters must match.
    pub filters: Vec<Filter>,
    /// Optional ordering.
    pub order: Option<Order>,
    /// Optional result cap. Ignored by subscriptions.
    pub limit: Option<usize>,
}

impl Query {
    /// Query every document of a collection.
    pub fn collection(name: &str) -> Self {
        Self {
            collection: name.to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    /// Add a filter.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Set the ordering.
    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    /// Cap the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Does this document belong to the query's result set?
    pub fn matches(&self, doc: &Document) -> bool {
        doc.key.collection == self.collection && self.filters.iter().all(|f| f.matches(doc))
    }

    /// Sort and truncate an already-filtered result set.
    pub fn finish(&self, mut docs: Vec<Document>) -> Vec<Document> {
        if let Some(order) = &self.order {
            docs.sort_by(|a, b| order.compare(a, b));
        }
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }
        docs
    }
}

// =============================================================================
// WRITES
// =============================================================================

/// Condition a write requires of the current document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional.
    None,
    /// The document must exist.
    MustExist,
    /// The document must not exist.
    MustNotExist,
    /// The document must exist at exactly this version.
    Version(u64),
}

impl Precondition {
    /// Check against the current document.
    pub fn holds(&self, current: Option<&Document>) -> bool {
        match self {
            Precondition::None => true,
            Precondition::MustExist => current.is_some(),
            Precondition::MustNotExist => current.is_none(),
            Precondition::Version(v) => current.map(|d| d.version) == Some(*v),
        }
    }
}

/// One operation of an atomic batch.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    /// Create or replace a document body.
    Put {
        /// Target.
        key: DocKey,
        /// New body.
        data: Value,
        /// Required state of the current document.
        precondition: Precondition,
    },
    /// Delete a document. Deleting a missing document is allowed unless the
    /// precondition says otherwise.
    Delete {
        /// Target.
        key: DocKey,
        /// Required state of the current document.
        precondition: Precondition,
    },
    /// Assert a precondition without writing (read-set validation).
    Verify {
        /// Target.
        key: DocKey,
        /// Required state of the current document.
        precondition: Precondition,
    },
}

impl WriteOp {
    /// Target document of this operation.
    pub fn key(&self) -> &DocKey {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key, .. } | WriteOp::Verify { key, .. } => key,
        }
    }

    /// Precondition of this operation.
    pub fn precondition(&self) -> Precondition {
        match self {
            WriteOp::Put { precondition, .. }
            | WriteOp::Delete { precondition, .. }
            | WriteOp::Verify { precondition, .. } => *precondition,
        }
    }
}

/// What a successful commit produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Store sequence assigned to the commit.
    pub seq: u64,
    /// New version of every document written (0 for deletions).
    pub versions: Vec<(DocKey, u64)>,
}

impl CommitReceipt {
    /// Version assigned to a written document.
    pub fn version_of(&self, key: &DocKey) -> Option<u64> {
        self.versions.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

/// Kind of change pushed to a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Entered the query's result set.
    Added,
    /// Changed while staying in the result set.
    Modified,
    /// Deleted or no longer matching. Carries the last stored body.
    Removed,
}

/// One pushed change.
#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    /// Kind of change.
    pub kind: ChangeKind,
    /// Document state (last known state for removals).
    pub document: Document,
}

/// Live feed of changes for one query.
///
/// Delivery is at-least-once; consumers deduplicate. Dropping the
/// subscription (or calling [`Subscription::unsubscribe`]) stops delivery.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Change>,
}

impl Subscription {
    /// Wrap the receiving half of a store's change channel.
    pub fn new(receiver: mpsc::UnboundedReceiver<Change>) -> Self {
        Self { receiver }
    }

    /// Wait for the next change. `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<Change> {
        self.receiver.recv().await
    }

    /// Take an already-delivered change without waiting.
    pub fn try_next(&mut self) -> Option<Change> {
        self.receiver.try_recv().ok()
    }

    /// Stop receiving changes.
    pub fn unsubscribe(mut self) {
        self.receiver.close();
    }
}
