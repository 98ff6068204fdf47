//! Matchmaker
//!
//! Claim-or-create pairing over the shared ticket pool. Every ownership
//! change of a ticket is one atomic batch guarded by the ticket's version,
//! so a ticket can be claimed at most once.
//!
//! ```text
//! enqueue(p)
//!   ├── claim oldest unmatched ticket of someone else ──► Created(session)
//!   └── none: create own ticket, subscribe to it
//!         ├── recheck: newer claims older (deleting own ticket) ──► Created
//!         └── Waiting(MatchWait) ── next_match() ──► Some(session) / None
//! ```

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::rng::DeterministicRng;
use crate::game::config::GameConfig;
use crate::game::model::{collections, ChatEvent, GameSession, MatchTicket, PlayerId, SessionId};
use crate::store::{
    encode, run_transaction, ChangeKind, Direction, Document, Filter, Order, Precondition, Query,
    SharedStore, StoreError, Subscription, WriteOp,
};

/// Notice written at the top of every new session.
pub const MATCHED_NOTICE: &str = "you've been matched. say hi!";

/// Matchmaking errors.
#[derive(Debug, Clone, Error)]
pub enum MatchmakingError {
    /// The store failed during enqueue, claim or cancel. Retry with backoff.
    #[error("matchmaking unavailable: {0}")]
    MatchmakingUnavailable(#[from] StoreError),

    /// This id cannot queue.
    #[error("invalid player id: {0}")]
    InvalidPlayer(String),
}

/// Result of an enqueue.
#[derive(Debug)]
pub enum Pairing {
    /// This call created a session.
    Created(GameSession),
    /// Someone had already claimed this player's ticket.
    Joined(SessionId),
    /// The player's ticket is in the pool.
    Waiting(MatchWait),
}

impl Pairing {
    /// Session id, unless still waiting.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Pairing::Created(session) => Some(session.session_id),
            Pairing::Joined(id) => Some(*id),
            Pairing::Waiting(_) => None,
        }
    }
}

/// Result of a cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The unmatched ticket was withdrawn.
    Cancelled,
    /// The ticket had already been claimed. Nothing is written; the match stands.
    AlreadyMatched(SessionId),
    /// No ticket.
    NotQueued,
}

/// Pairs players through the ticket pool.
#[derive(Clone)]
pub struct Matchmaker {
    store: SharedStore,
    config: Arc<GameConfig>,
}

impl Matchmaker {
    /// Create a matchmaker.
    pub fn new(store: SharedStore, config: Arc<GameConfig>) -> Self {
        Self { store, config }
    }

    /// Claim a waiting player or join the pool.
    #[instrument(skip(self))]
    pub async fn enqueue(&self, player: &PlayerId) -> Result<Pairing, MatchmakingError> {
        if !player.is_human() {
            return Err(MatchmakingError::InvalidPlayer(player.to_string()));
        }

        let own_key = MatchTicket::key(player);
        let mut own = self.store.get(&own_key).await?;

        if let Some(doc) = &own {
            let ticket = MatchTicket::from_document(doc)?;
            if let Some(session_id) = ticket.matched_session_id {
                self.consume_ticket(doc).await;
                return Ok(Pairing::Joined(session_id));
            }
        }

        // Claim the oldest waiting player.
        for candidate in self.waiting_tickets(player).await? {
            if let Some(session) = self.claim(player, &candidate, own.as_ref()).await? {
                return Ok(Pairing::Created(session));
            }
        }

        if own.is_none() {
            let ticket = MatchTicket::new(player.clone());
            let created = self
                .store
                .commit(vec![WriteOp::Put {
                    key: own_key.clone(),
                    data: encode(&ticket)?,
                    precondition: Precondition::MustNotExist,
                }])
                .await;

            match created {
                Ok(_) | Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }

            own = self.store.get(&own_key).await?;
        }

        let Some(own_doc) = own else {
            // Claimed and consumed between our writes; start over next call.
            return Err(StoreError::NotFound(own_key.to_string()).into());
        };
        if let Some(session_id) = MatchTicket::from_document(&own_doc)?.matched_session_id {
            self.consume_ticket(&own_doc).await;
            return Ok(Pairing::Joined(session_id));
        }

        let subscription = self
            .store
            .subscribe(Query::collection(collections::TICKETS).filter(Filter::eq("owner_id", player.as_str())))
            .await?;

        // Recheck: a ticket created concurrently with ours may be waiting.
        // Only the newer ticket claims the older one.
        for candidate in self.waiting_tickets(player).await? {
            if candidate.create_seq >= own_doc.create_seq {
                continue;
            }
            if let Some(session) = self.claim(player, &candidate, Some(&own_doc)).await? {
                subscription.unsubscribe();
                return Ok(Pairing::Created(session));
            }
        }

        debug!("{} waiting for a match", player);
        Ok(Pairing::Waiting(MatchWait {
            player: player.clone(),
            store: self.store.clone(),
            subscription,
            matched: None,
        }))
    }

    /// Withdraw a player's unmatched ticket. An absent or claimed ticket is
    /// left alone and is not an error.
    #[instrument(skip(self))]
    pub async fn cancel(&self, player: &PlayerId) -> Result<CancelOutcome, MatchmakingError> {
        let player = player.clone();

        let outcome = run_transaction(&self.store, self.config.transaction_attempts, move |mut txn| {
            let key = MatchTicket::key(&player);
            Box::pin(async move {
                let Some(doc) = txn.get(&key).await? else {
                    return Ok((txn, CancelOutcome::NotQueued));
                };
                let ticket = MatchTicket::from_document(&doc)?;
                if let Some(session_id) = ticket.matched_session_id {
                    return Ok((txn, CancelOutcome::AlreadyMatched(session_id)));
                }
                txn.delete(key);
                Ok::<_, MatchmakingError>((txn, CancelOutcome::Cancelled))
            })
        })
        .await?;

        debug!("Cancel: {:?}", outcome);
        Ok(outcome)
    }

    /// Remove the player's ticket once its claim has been seen.
    ///
    /// Returns the claimed session; an absent or unmatched ticket is untouched.
    pub async fn release_claimed(&self, player: &PlayerId) -> Result<Option<SessionId>, MatchmakingError> {
        let Some(doc) = self.store.get(&MatchTicket::key(player)).await? else {
            return Ok(None);
        };
        let session_id = MatchTicket::from_document(&doc)?.matched_session_id;
        if session_id.is_some() {
            self.consume_ticket(&doc).await;
        }
        Ok(session_id)
    }

    /// Pair a waiting player with the persona.
    ///
    /// Withdraws the player's unmatched ticket in the same batch that creates
    /// the session. If a human claimed the ticket first, that session wins.
    #[instrument(skip(self))]
    pub async fn pair_with_persona(&self, player: &PlayerId) -> Result<Pairing, MatchmakingError> {
        if !player.is_human() {
            return Err(MatchmakingError::InvalidPlayer(player.to_string()));
        }
        let player = player.clone();

        let pairing = run_transaction(&self.store, self.config.transaction_attempts, move |mut txn| {
            let player = player.clone();
            Box::pin(async move {
                let key = MatchTicket::key(&player);
                if let Some(doc) = txn.get(&key).await? {
                    let ticket = MatchTicket::from_document(&doc)?;
                    txn.delete(key);
                    if let Some(session_id) = ticket.matched_session_id {
                        return Ok((txn, Pairing::Joined(session_id)));
                    }
                }

                let session = new_session(player, PlayerId::persona());
                txn.create(GameSession::key(&session.session_id), encode(&session)?);
                let notice = ChatEvent::notice(session.session_id, MATCHED_NOTICE);
                txn.create(notice.key(), encode(&notice)?);
                Ok::<_, MatchmakingError>((txn, Pairing::Created(session)))
            })
        })
        .await?;

        if let Pairing::Created(session) = &pairing {
            info!("Paired {} with the persona in session {}", session.player_a, session.session_id);
        }
        Ok(pairing)
    }

    /// Best-effort number of waiting players.
    pub async fn queue_depth(&self) -> Result<usize, MatchmakingError> {
        let query = Query::collection(collections::TICKETS).filter(Filter::is_null("matched_session_id"));
        Ok(self.store.query(&query).await?.len())
    }

    /// Unmatched tickets of other players, oldest first.
    async fn waiting_tickets(&self, player: &PlayerId) -> Result<Vec<Document>, StoreError> {
        let query = Query::collection(collections::TICKETS)
            .filter(Filter::is_null("matched_session_id"))
            .filter(Filter::not_eq("owner_id", player.as_str()))
            .order(Order::Created(Direction::Ascending));
        self.store.query(&query).await
    }

    /// Claim `candidate` in one batch: mark it matched, create the session
    /// and its opening notice, and withdraw our own ticket if we have one.
    /// `None` when someone else got there first.
    async fn claim(
        &self,
        player: &PlayerId,
        candidate: &Document,
        own: Option<&Document>,
    ) -> Result<Option<GameSession>, MatchmakingError> {
        let mut ticket = MatchTicket::from_document(candidate)?;
        let session = new_session(player.clone(), ticket.owner_id.clone());
        ticket.matched_session_id = Some(session.session_id);

        let notice = ChatEvent::notice(session.session_id, MATCHED_NOTICE);
        let mut batch = vec![
            WriteOp::Put {
                key: candidate.key.clone(),
                data: encode(&ticket)?,
                precondition: Precondition::Version(candidate.version),
            },
            WriteOp::Put {
                key: GameSession::key(&session.session_id),
                data: encode(&session)?,
                precondition: Precondition::MustNotExist,
            },
            WriteOp::Put {
                key: notice.key(),
                data: encode(&notice)?,
                precondition: Precondition::MustNotExist,
            },
        ];
        if let Some(own) = own {
            batch.push(WriteOp::Delete {
                key: own.key.clone(),
                precondition: Precondition::Version(own.version),
            });
        }

        match self.store.commit(batch).await {
            Ok(_) => {
                info!(
                    "{} claimed {} into session {}",
                    player, session.player_b, session.session_id
                );
                Ok(Some(session))
            }
            Err(StoreError::Conflict(key)) => {
                debug!("Lost claim race on {}", key);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn consume_ticket(&self, doc: &Document) {
        let delete = WriteOp::Delete {
            key: doc.key.clone(),
            precondition: Precondition::Version(doc.version),
        };
        if let Err(e) = self.store.commit(vec![delete]).await {
            debug!("Matched ticket {} not removed: {}", doc.key, e);
        }
    }
}

/// Session between a claimer and the claimed party, opening turn drawn from
/// the session seed.
fn new_session(player_a: PlayerId, player_b: PlayerId) -> GameSession {
    let session_id = SessionId::new();
    let mut rng = DeterministicRng::for_session(session_id.as_bytes(), &[player_a.as_str(), player_b.as_str()]);
    let a_starts = rng.next_coin();
    GameSession::new(session_id, player_a, player_b, a_starts)
}

// =============================================================================
// WAITING
// =============================================================================

/// A ticket in the pool, listening for its claim.
pub struct MatchWait {
    player: PlayerId,
    store: SharedStore,
    subscription: Subscription,
    matched: Option<SessionId>,
}

impl std::fmt::Debug for MatchWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchWait")
            .field("player", &self.player)
            .field("matched", &self.matched)
            .finish()
    }
}

impl MatchWait {
    /// Waiting player.
    pub fn player(&self) -> &PlayerId {
        &self.player
    }

    /// Wait for the ticket to be claimed.
    ///
    /// `Some(session)` once claimed (the ticket is then removed); `None` if the
    /// ticket disappeared unmatched, e.g. after a cancel. Cancel safe.
    pub async fn next_match(&mut self) -> Result<Option<SessionId>, MatchmakingError> {
        if let Some(session_id) = self.matched {
            return Ok(Some(session_id));
        }

        loop {
            let change = self
                .subscription
                .next()
                .await
                .ok_or(StoreError::SubscriptionClosed)?;

            let ticket = MatchTicket::from_document(&change.document)?;
            match (change.kind, ticket.matched_session_id) {
                (ChangeKind::Removed, None) => return Ok(None),
                (ChangeKind::Removed, Some(session_id)) => {
                    self.matched = Some(session_id);
                    return Ok(Some(session_id));
                }
                (_, Some(session_id)) => {
                    self.matched = Some(session_id);
                    let delete = WriteOp::Delete {
                        key: change.document.key.clone(),
                        precondition: Precondition::Version(change.document.version),
                    };
                    if let Err(e) = self.store.commit(vec![delete]).await {
                        warn!("Claimed ticket of {} not removed: {}", self.player, e);
                    }
                    info!("{} matched into session {}", self.player, session_id);
                    return Ok(Some(session_id));
                }
                (_, None) => continue,
            }
        }
    }

    /// Matched session observed so far.
    pub fn matched(&self) -> Option<SessionId> {
        self.matched
    }

    /// Stop listening. The ticket stays in the pool.
    pub fn close(self) {
        self.subscription.unsubscribe();
    }
}
