//! In-memory document store.
//!
//! In-process [`DocumentStore`] used by the server binary and
//! the test suites. Supports fault injection so callers can exercise the
//! "store unavailable" and "committed but reported failed" paths.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

use super::document::{
    Change, ChangeKind, CommitReceipt, DocKey, Document, Query, Subscription, WriteOp,
};
use super::{DocumentStore, StoreError};

struct Subscriber {
    query: Query,
    sender: mpsc::UnboundedSender<Change>,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<DocKey, Document>,
    seq: u64,
    subscribers: Vec<Subscriber>,
    /// Commits to reject before applying.
    fail_before: usize,
    /// Commits to apply but report as failed.
    fail_after: usize,
}

/// In-process [`DocumentStore`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Reject the next `n` commits without applying them.
    pub async fn fail_next_commits(&self, n: usize) {
        self.inner.lock().await.fail_before = n;
    }

    /// Apply the next `n` commits but report them as failed.
    pub async fn fail_after_next_commits(&self, n: usize) {
        self.inner.lock().await.fail_after = n;
    }

    /// Number of stored documents in a collection.
    pub async fn count(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .await
            .docs
            .keys()
            .filter(|k| k.collection == collection)
            .count()
    }

    /// Number of live subscriptions.
    pub async fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.subscribers.retain(|s| !s.sender.is_closed());
        inner.subscribers.len()
    }

    fn notify(inner: &mut Inner, before: Option<&Document>, after: Option<&Document>) {
        inner.subscribers.retain(|sub| {
            let was_in = before.map_or(false, |d| sub.query.matches(d));
            let is_in = after.map_or(false, |d| sub.query.matches(d));

            let change = match (was_in, is_in, after) {
                (false, true, Some(doc)) => Some(Change {
                    kind: ChangeKind::Added,
                    document: doc.clone(),
                }),
                (true, true, Some(doc)) => Some(Change {
                    kind: ChangeKind::Modified,
                    document: doc.clone(),
                }),
                (true, false, _) => before.map(|doc| Change {
                    kind: ChangeKind::Removed,
                    document: doc.clone(),
                }),
                _ => None,
            };

            match change {
                Some(change) => sub.sender.send(change).is_ok(),
                None => !sub.sender.is_closed(),
            }
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &DocKey) -> Result<Option<Document>, StoreError> {
        Ok(self.inner.lock().await.docs.get(key).cloned())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let inner = self.inner.lock().await;
        let docs = inner
            .docs
            .values()
            .filter(|d| query.matches(d))
            .cloned()
            .collect();
        Ok(query.finish(docs))
    }

    async fn commit(&self, writes: Vec<WriteOp>) -> Result<CommitReceipt, StoreError> {
        let mut inner = self.inner.lock().await;

        if inner.fail_before > 0 {
            inner.fail_before -= 1;
            debug!("Injected commit failure (nothing applied)");
            return Err(StoreError::Unavailable("injected failure".into()));
        }

        // Stage every op against an overlay so the batch applies all-or-nothing.
        let seq = inner.seq + 1;
        let now = Utc::now();
        let mut staged: BTreeMap<DocKey, Option<Document>> = BTreeMap::new();

        for op in &writes {
            let key = op.key();
            let current = match staged.get(key) {
                Some(doc) => doc.clone(),
                None => inner.docs.get(key).cloned(),
            };

            if !op.precondition().holds(current.as_ref()) {
                trace!("Precondition {:?} failed on {}", op.precondition(), key);
                return Err(StoreError::Conflict(key.to_string()));
            }

            match op {
                WriteOp::Put { data, .. } => {
                    let next = match current {
                        Some(doc) => Document {
                            data: data.clone(),
                            version: doc.version + 1,
                            update_seq: seq,
                            ..doc
                        },
                        None => Document {
                            key: key.clone(),
                            data: data.clone(),
                            version: 1,
                            create_seq: seq,
                            update_seq: seq,
                            created_at: now,
                        },
                    };
                    staged.insert(key.clone(), Some(next));
                }
                WriteOp::Delete { .. } => {
                    staged.insert(key.clone(), None);
                }
                WriteOp::Verify { .. } => {}
            }
        }

        inner.seq = seq;
        let mut versions = Vec::with_capacity(staged.len());

        for (key, next) in staged {
            let before = match &next {
                Some(doc) => inner.docs.insert(key.clone(), doc.clone()),
                None => inner.docs.remove(&key),
            };
            versions.push((key, next.as_ref().map_or(0, |d| d.version)));
            Self::notify(&mut inner, before.as_ref(), next.as_ref());
        }

        if inner.fail_after > 0 {
            inner.fail_after -= 1;
            debug!("Injected commit failure (batch {} applied)", seq);
            return Err(StoreError::Unavailable("injected failure after apply".into()));
        }

        Ok(CommitReceipt { seq, versions })
    }

    async fn subscribe(&self, query: Query) -> Result<Subscription, StoreError> {
        let mut inner = self.inner.lock().await;
        let (sender, receiver) = mpsc::unbounded_channel();

        let initial: Vec<Document> = inner
            .docs
            .values()
            .filter(|d| query.matches(d))
            .cloned()
            .collect();
        for document in query.finish(initial) {
            let _ = sender.send(Change {
                kind: ChangeKind::Added,
                document,
            });
        }

        inner.subscribers.push(Subscriber { query, sender });
        Ok(Subscription::new(receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Filter, Precondition};
    use serde_json::json;

    fn put(collection: &str, id: &str, data: serde_json::Value) -> WriteOp {
        WriteOp::Put {
            key: DocKey::new(collection, id),
            data,
            precondition: Precondition::None,
        }
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryStore::new();
        let receipt = store.commit(vec![put("t", "a", json!({ "x": 1 }))]).await.unwrap();
        assert_eq!(receipt.seq, 1);
        assert_eq!(receipt.version_of(&DocKey::new("t", "a")), Some(1));

        let doc = store.get(&DocKey::new("t", "a")).await.unwrap().unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.field("x"), &json!(1));

        store.commit(vec![put("t", "a", json!({ "x": 2 }))]).await.unwrap();
        let doc = store.get(&DocKey::new("t", "a")).await.unwrap().unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.create_seq, 1);
        assert_eq!(doc.update_seq, 2);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.commit(vec![put("t", "exists", json!({}))]).await.unwrap();

        let result = store
            .commit(vec![
                put("t", "new", json!({})),
                WriteOp::Put {
                    key: DocKey::new("t", "exists"),
                    data: json!({ "overwritten": true }),
                    precondition: Precondition::MustNotExist,
                },
            ])
            .await;

        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert!(store.get(&DocKey::new("t", "new")).await.unwrap().is_none());
        let untouched = store.get(&DocKey::new("t", "exists")).await.unwrap().unwrap();
        assert_eq!(untouched.version, 1);
    }

    #[tokio::test]
    async fn test_subscription_initial_and_changes() {
        let store = MemoryStore::new();
        store
            .commit(vec![put("tickets", "a", json!({ "owner": "a", "matched": null }))])
            .await
            .unwrap();

        let query = Query::collection("tickets").filter(Filter::is_null("matched"));
        let mut sub = store.subscribe(query).await.unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.kind, ChangeKind::Added);
        assert_eq!(first.document.key.id, "a");

        // Leaving the result set is reported as a removal with the old body.
        store
            .commit(vec![put("tickets", "a", json!({ "owner": "a", "matched": "s1" }))])
            .await
            .unwrap();
        let removed = sub.next().await.unwrap();
        assert_eq!(removed.kind, ChangeKind::Removed);
        assert_eq!(removed.document.field("matched"), &json!(null));

        // Other collections are invisible.
        store.commit(vec![put("sessions", "s1", json!({}))]).await.unwrap();
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn test_delete_notifies_removed() {
        let store = MemoryStore::new();
        store.commit(vec![put("t", "a", json!({ "v": 1 }))]).await.unwrap();
        let mut sub = store.subscribe(Query::collection("t")).await.unwrap();
        let _ = sub.next().await.unwrap();

        store
            .commit(vec![WriteOp::Delete {
                key: DocKey::new("t", "a"),
                precondition: Precondition::MustExist,
            }])
            .await
            .unwrap();

        let change = sub.next().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Removed);
        assert_eq!(change.document.field("v"), &json!(1));
    }

    #[tokio::test]
    async fn test_unsubscribe_prunes() {
        let store = MemoryStore::new();
        let sub = store.subscribe(Query::collection("t")).await.unwrap();
        assert_eq!(store.subscriber_count().await, 1);
        sub.unsubscribe();
        assert_eq!(store.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();

        store.fail_next_commits(1).await;
        assert!(store.commit(vec![put("t", "a", json!({}))]).await.is_err());
        assert_eq!(store.count("t").await, 0);

        store.fail_after_next_commits(1).await;
        assert!(store.commit(vec![put("t", "a", json!({}))]).await.is_err());
        assert_eq!(store.count("t").await, 1);

        assert!(store.commit(vec![put("t", "b", json!({}))]).await.is_ok());
    }
}
