//! Session Feed
//!
//! Live, deduplicated view of one session's chat events. Delivery from the
//! store is at-least-once with no cross-sender ordering, so display order is
//! decided by a pluggable [`EventOrdering`].

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Serialize, Deserialize};
use tracing::trace;

use crate::game::model::{collections, ChatEvent, EventId, PlayerId, SessionId};
use crate::store::{ChangeKind, Filter, Query, SharedStore, StoreError, Subscription};

/// A chat event plus the store's sequence for it.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    /// The event.
    pub event: ChatEvent,
    /// Server-assigned sequence of the write that created it.
    pub seq: u64,
}

/// Display order of a feed, most recent first.
pub trait EventOrdering: Send + Sync {
    /// Compare two entries; `Less` sorts first.
    fn compare(&self, a: &FeedEntry, b: &FeedEntry) -> Ordering;
}

/// Orders by the sender's clock, ties broken by event id.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientClockOrdering;

impl EventOrdering for ClientClockOrdering {
    fn compare(&self, a: &FeedEntry, b: &FeedEntry) -> Ordering {
        b.event
            .client_timestamp
            .cmp(&a.event.client_timestamp)
            .then_with(|| b.event.event_id.cmp(&a.event.event_id))
    }
}

/// Orders by the store's sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerSequenceOrdering;

impl EventOrdering for ServerSequenceOrdering {
    fn compare(&self, a: &FeedEntry, b: &FeedEntry) -> Ordering {
        b.seq.cmp(&a.seq).then_with(|| b.event.event_id.cmp(&a.event.event_id))
    }
}

/// Who said a line, from one viewer's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    /// The viewer.
    You,
    /// The other participant, human or not.
    Opponent,
    /// System notice.
    System,
}

/// A line as shown to one participant. Never reveals the persona.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLine {
    /// Event id.
    pub event_id: EventId,
    /// Speaker.
    pub speaker: Speaker,
    /// Text.
    pub content: String,
}

impl ChatLine {
    /// Mask an event for `viewer`.
    pub fn for_viewer(event: &ChatEvent, viewer: &PlayerId) -> Self {
        let speaker = if event.is_system() {
            Speaker::System
        } else if &event.sender_id == viewer {
            Speaker::You
        } else {
            Speaker::Opponent
        };
        Self {
            event_id: event.event_id,
            speaker,
            content: event.content.clone(),
        }
    }
}

/// Subscribed feed of one session.
pub struct SessionFeed {
    session_id: SessionId,
    subscription: Subscription,
    ordering: Arc<dyn EventOrdering>,
    entries: BTreeMap<EventId, FeedEntry>,
}

impl SessionFeed {
    /// Subscribe to a session's events.
    pub async fn open(
        store: &SharedStore,
        session_id: SessionId,
        ordering: Arc<dyn EventOrdering>,
    ) -> Result<Self, StoreError> {
        let query = Query::collection(collections::EVENTS).filter(Filter::eq("session_id", session_id.to_string()));
        let subscription = store.subscribe(query).await?;
        Ok(Self {
            session_id,
            subscription,
            ordering,
            entries: BTreeMap::new(),
        })
    }

    /// Session id.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn absorb(&mut self, kind: ChangeKind, entry: FeedEntry) -> Option<ChatEvent> {
        if kind == ChangeKind::Removed || self.entries.contains_key(&entry.event.event_id) {
            trace!("Skipping {:?} for {}", kind, entry.event.event_id);
            return None;
        }
        let event = entry.event.clone();
        self.entries.insert(event.event_id, entry);
        Some(event)
    }

    /// Wait for the next event not seen before.
    pub async fn next_event(&mut self) -> Result<ChatEvent, StoreError> {
        loop {
            let change = self.subscription.next().await.ok_or(StoreError::SubscriptionClosed)?;
            let entry = FeedEntry {
                event: change.document.decode()?,
                seq: change.document.create_seq,
            };
            if let Some(event) = self.absorb(change.kind, entry) {
                return Ok(event);
            }
        }
    }

    /// Take every already-delivered event without waiting.
    pub fn drain(&mut self) -> Result<Vec<ChatEvent>, StoreError> {
        let mut fresh = Vec::new();
        while let Some(change) = self.subscription.try_next() {
            let entry = FeedEntry {
                event: change.document.decode()?,
                seq: change.document.create_seq,
            };
            fresh.extend(self.absorb(change.kind, entry));
        }
        Ok(fresh)
    }

    /// Every event seen, in display order.
    pub fn events(&self) -> Vec<ChatEvent> {
        let mut entries: Vec<&FeedEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| self.ordering.compare(a, b));
        entries.into_iter().map(|e| e.event.clone()).collect()
    }

    /// Display lines for one participant.
    pub fn lines_for(&self, viewer: &PlayerId) -> Vec<ChatLine> {
        self.events().iter().map(|e| ChatLine::for_viewer(e, viewer)).collect()
    }

    /// Number of distinct events seen.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Nothing seen yet?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stop listening.
    pub fn close(self) {
        self.subscription.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{encode, MemoryStore, Precondition, WriteOp};
    use chrono::{Duration, Utc};

    async fn write(store: &SharedStore, event: &ChatEvent) {
        store
            .commit(vec![WriteOp::Put {
                key: event.key(),
                data: encode(event).unwrap(),
                precondition: Precondition::None,
            }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_feed_deduplicates_and_filters_sessions() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let session = SessionId::new();
        let mut feed = SessionFeed::open(&store, session, Arc::new(ClientClockOrdering)).await.unwrap();

        let hi = ChatEvent::message(session, PlayerId::new("alice"), "hi");
        write(&store, &hi).await;
        // Redelivery of the same event.
        write(&store, &hi).await;
        write(&store, &ChatEvent::message(SessionId::new(), PlayerId::new("x"), "elsewhere")).await;

        assert_eq!(feed.next_event().await.unwrap(), hi);
        assert!(feed.drain().unwrap().is_empty());
        assert_eq!(feed.len(), 1);
    }

    #[tokio::test]
    async fn test_orderings_can_disagree() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let session = SessionId::new();

        // Written first but stamped later by a fast clock.
        let mut skewed = ChatEvent::message(session, PlayerId::new("alice"), "first");
        skewed.client_timestamp = Utc::now() + Duration::seconds(30);
        let second = ChatEvent::message(session, PlayerId::new("bob"), "second");
        write(&store, &skewed).await;
        write(&store, &second).await;

        let mut by_clock = SessionFeed::open(&store, session, Arc::new(ClientClockOrdering)).await.unwrap();
        let mut by_seq = SessionFeed::open(&store, session, Arc::new(ServerSequenceOrdering)).await.unwrap();
        by_clock.drain().unwrap();
        by_seq.drain().unwrap();

        let clock: Vec<String> = by_clock.events().into_iter().map(|e| e.content).collect();
        let seq: Vec<String> = by_seq.events().into_iter().map(|e| e.content).collect();
        assert_eq!(clock, vec!["first", "second"]);
        assert_eq!(seq, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_lines_mask_the_persona() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let session = SessionId::new();
        let mut feed = SessionFeed::open(&store, session, Arc::new(ServerSequenceOrdering)).await.unwrap();

        write(&store, &ChatEvent::notice(session, "matched")).await;
        write(&store, &ChatEvent::message(session, PlayerId::new("alice"), "hi")).await;
        write(&store, &ChatEvent::message(session, PlayerId::persona(), "hey")).await;
        feed.drain().unwrap();

        let lines = feed.lines_for(&PlayerId::new("alice"));
        let speakers: Vec<Speaker> = lines.iter().map(|l| l.speaker).collect();
        assert_eq!(speakers, vec![Speaker::Opponent, Speaker::You, Speaker::System]);
        let json = serde_json::to_string(&lines).unwrap();
        assert!(!json.contains(crate::game::model::PERSONA_ID));
    }
}
