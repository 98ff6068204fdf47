//! Game Engine
//!
//! Facade over the matchmaker, the arbiters, the ledger and the feed. Every
//! entry point takes explicit player and session ids.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::game::arbiter::{ArbiterDeps, ArbiterHandle, ArbiterRegistry};
use crate::game::config::{ConfigError, GameConfig};
use crate::game::feed::{ClientClockOrdering, EventOrdering, SessionFeed};
use crate::game::matchmaker::{CancelOutcome, MatchWait, Matchmaker, MatchmakingError, Pairing};
use crate::game::model::{ChatEvent, PlayerId, SessionId};
use crate::game::persona::{CompletionService, PersonaResponder};
use crate::game::session::{SessionError, SessionSnapshot};
use crate::game::settlement::{Ledger, Settlement};
use crate::store::{SharedStore, StoreError};

/// Result of [`GameEngine::enqueue`].
#[derive(Debug)]
pub enum Enqueued {
    /// The player is in a session.
    Matched(SessionId),
    /// The player's ticket is waiting.
    Waiting(MatchWait),
}

/// The engine.
pub struct GameEngine {
    store: SharedStore,
    config: Arc<GameConfig>,
    matchmaker: Matchmaker,
    ledger: Ledger,
    arbiters: ArbiterRegistry,
    ordering: Arc<dyn EventOrdering>,
}

impl GameEngine {
    /// Build an engine over a store and a completion service.
    pub fn new(
        store: SharedStore,
        completions: Arc<dyn CompletionService>,
        config: GameConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        let matchmaker = Matchmaker::new(store.clone(), config.clone());
        let ledger = Ledger::new(store.clone(), config.clone());
        let persona = PersonaResponder::new(completions, config.clone());
        let arbiters = ArbiterRegistry::new(ArbiterDeps {
            store: store.clone(),
            config: config.clone(),
            ledger: ledger.clone(),
            persona,
        });

        Ok(Self {
            store,
            config,
            matchmaker,
            ledger,
            arbiters,
            ordering: Arc::new(ClientClockOrdering),
        })
    }

    /// Replace the feed ordering.
    pub fn with_ordering(mut self, ordering: Arc<dyn EventOrdering>) -> Self {
        self.ordering = ordering;
        self
    }

    /// Configuration.
    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    /// Shared store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Queue a player.
    pub async fn enqueue(&self, player: &PlayerId) -> Result<Enqueued, MatchmakingError> {
        Ok(match self.matchmaker.enqueue(player).await? {
            Pairing::Created(session) => Enqueued::Matched(session.session_id),
            Pairing::Joined(id) => Enqueued::Matched(id),
            Pairing::Waiting(wait) => Enqueued::Waiting(wait),
        })
    }

    /// Withdraw a player's ticket.
    pub async fn cancel(&self, player: &PlayerId) -> Result<CancelOutcome, MatchmakingError> {
        self.matchmaker.cancel(player).await
    }

    /// Remove a ticket whose claim the player has seen.
    pub async fn release_claimed(&self, player: &PlayerId) -> Result<Option<SessionId>, MatchmakingError> {
        self.matchmaker.release_claimed(player).await
    }

    /// Pair a player with the persona.
    pub async fn pair_with_persona(&self, player: &PlayerId) -> Result<SessionId, MatchmakingError> {
        let pairing = self.matchmaker.pair_with_persona(player).await?;
        let session_id = pairing
            .session_id()
            .ok_or_else(|| StoreError::Unavailable("persona pairing left the player waiting".into()))?;
        info!("{} falls back to the persona", player);
        Ok(session_id)
    }

    /// Waiting players (cosmetic).
    pub async fn queue_depth(&self) -> Result<usize, MatchmakingError> {
        self.matchmaker.queue_depth().await
    }

    /// A player's balance.
    pub async fn balance(&self, player: &PlayerId) -> Result<i64, StoreError> {
        self.ledger.balance(player).await
    }

    /// Arbiter handle for a session.
    pub async fn join(&self, session_id: SessionId) -> Result<ArbiterHandle, SessionError> {
        self.arbiters.attach(session_id).await
    }

    /// Send a message.
    pub async fn send(&self, session_id: SessionId, player: &PlayerId, text: &str) -> Result<ChatEvent, SessionError> {
        self.join(session_id).await?.send(player, text).await
    }

    /// Guess the opponent's nature.
    pub async fn guess(
        &self,
        session_id: SessionId,
        player: &PlayerId,
        guessed_ai: bool,
    ) -> Result<Settlement, SessionError> {
        self.join(session_id).await?.guess(player, guessed_ai).await
    }

    /// Observable session state.
    pub async fn watch(&self, session_id: SessionId) -> Result<watch::Receiver<SessionSnapshot>, SessionError> {
        Ok(self.join(session_id).await?.watch())
    }

    /// Live chat feed of a session.
    pub async fn feed(&self, session_id: SessionId) -> Result<SessionFeed, StoreError> {
        SessionFeed::open(&self.store, session_id, self.ordering.clone()).await
    }

    /// Drop finished arbiters. Returns how many.
    pub async fn cleanup(&self) -> usize {
        self.arbiters.cleanup().await
    }

    /// Sessions with a live arbiter.
    pub async fn active_sessions(&self) -> usize {
        self.arbiters.len().await
    }
}
