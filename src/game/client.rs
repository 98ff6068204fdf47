//! Player Client
//!
//! One player's path through the game:
//! `Lobby → Searching → Chatting → Guessing → Result → Lobby`.
//! Lobby and Searching are tracked here; in-session stages come from the
//! arbiter's view for this player.

use std::sync::Arc;

use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::game::arbiter::ArbiterHandle;
use crate::game::engine::{Enqueued, GameEngine};
use crate::game::matchmaker::{CancelOutcome, MatchWait, MatchmakingError};
use crate::game::model::{ChatEvent, PlayerId, SessionId, Stage};
use crate::game::session::{PlayerView, SessionError};
use crate::game::settlement::Settlement;
use crate::store::StoreError;

/// Client errors.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Matchmaking failed.
    #[error(transparent)]
    Matchmaking(#[from] MatchmakingError),

    /// A session action failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Action not valid in the player's current stage.
    #[error("cannot do that while {actual} (needs {expected})")]
    WrongStage {
        /// Stage the action needs.
        expected: Stage,
        /// Player's stage.
        actual: Stage,
    },
}

impl ClientError {
    /// May the same call be retried?
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Matchmaking(MatchmakingError::MatchmakingUnavailable(_)) => true,
            ClientError::Session(e) => e.is_retryable(),
            ClientError::Store(_) => true,
            _ => false,
        }
    }
}

/// One player's game flow.
pub struct PlayerClient {
    engine: Arc<GameEngine>,
    player: PlayerId,
    searching: Option<MatchWait>,
    search_started: Option<Instant>,
    search_seconds: u32,
    session: Option<ArbiterHandle>,
}

impl PlayerClient {
    /// Client in the lobby.
    pub fn new(engine: Arc<GameEngine>, player: PlayerId) -> Self {
        Self {
            engine,
            player,
            searching: None,
            search_started: None,
            search_seconds: 0,
            session: None,
        }
    }

    /// The player.
    pub fn player(&self) -> &PlayerId {
        &self.player
    }

    /// Current stage.
    pub fn stage(&self) -> Stage {
        match (&self.session, &self.searching) {
            (Some(handle), _) => handle.snapshot().view_for(&self.player).stage,
            (None, Some(_)) => Stage::Searching,
            (None, None) => Stage::Lobby,
        }
    }

    /// The player's view of the active session.
    pub fn view(&self) -> Option<PlayerView> {
        self.session.as_ref().map(|h| h.snapshot().view_for(&self.player))
    }

    /// Active session.
    pub fn session(&self) -> Option<&ArbiterHandle> {
        self.session.as_ref()
    }

    /// Seconds spent searching (display only).
    pub fn search_seconds(&self) -> u32 {
        self.search_seconds
    }

    fn require(&self, expected: Stage) -> Result<(), ClientError> {
        let actual = self.stage();
        if actual != expected {
            return Err(ClientError::WrongStage { expected, actual });
        }
        Ok(())
    }

    async fn enter_session(&mut self, session_id: SessionId) -> Result<Stage, ClientError> {
        let handle = self.engine.join(session_id).await?;
        if let Some(wait) = self.searching.take() {
            wait.close();
        }
        self.search_started = None;
        self.session = Some(handle);
        info!("{} entered session {}", self.player, session_id);
        Ok(self.stage())
    }

    /// Lobby → Searching (or straight into a session).
    pub async fn find_match(&mut self) -> Result<Stage, ClientError> {
        self.require(Stage::Lobby)?;

        match self.engine.enqueue(&self.player).await? {
            Enqueued::Matched(session_id) => self.enter_session(session_id).await,
            Enqueued::Waiting(wait) => {
                self.searching = Some(wait);
                self.search_started = Some(Instant::now());
                self.search_seconds = 0;
                Ok(Stage::Searching)
            }
        }
    }

    /// Wait for the ticket to be claimed. Pending forever while not searching.
    ///
    /// Cancel safe. `None` when the ticket vanished unmatched; the player is
    /// back in the lobby.
    pub async fn next_match(&mut self) -> Result<Option<SessionId>, ClientError> {
        let Some(wait) = self.searching.as_mut() else {
            return std::future::pending().await;
        };

        let matched = wait.next_match().await?;
        match matched {
            Some(session_id) => {
                self.enter_session(session_id).await?;
                Ok(Some(session_id))
            }
            None => {
                debug!("Ticket of {} gone without a match", self.player);
                self.searching = None;
                self.search_started = None;
                Ok(None)
            }
        }
    }

    /// When the persona fallback is due, if searching with fallback enabled.
    pub fn fallback_deadline(&self) -> Option<Instant> {
        let after = self.engine.config().persona_fallback_after?;
        self.search_started.map(|start| start + after)
    }

    /// Searching → Chatting against the persona. A human claim that won the
    /// race is joined instead.
    pub async fn fall_back_to_persona(&mut self) -> Result<SessionId, ClientError> {
        self.require(Stage::Searching)?;
        let session_id = self.engine.pair_with_persona(&self.player).await?;
        self.enter_session(session_id).await?;
        Ok(session_id)
    }

    /// Searching → Chatting, respecting the persona fallback.
    pub async fn poll_match(&mut self) -> Result<Option<SessionId>, ClientError> {
        self.require(Stage::Searching)?;

        match self.fallback_deadline() {
            Some(deadline) => match timeout_at(deadline, self.next_match()).await {
                Ok(matched) => matched,
                Err(_) => self.fall_back_to_persona().await.map(Some),
            },
            None => self.next_match().await,
        }
    }

    /// Advance the search counter by one second. Display only.
    pub fn tick_search(&mut self) -> u32 {
        if self.searching.is_some() {
            self.search_seconds += 1;
        }
        self.search_seconds
    }

    /// Searching → Lobby.
    ///
    /// A cancel that loses the race to a claim is not an error: the player
    /// enters the claimed session instead.
    pub async fn cancel(&mut self) -> Result<CancelOutcome, ClientError> {
        if self.searching.is_none() {
            return Ok(CancelOutcome::NotQueued);
        }
        let outcome = self.engine.cancel(&self.player).await?;
        if let CancelOutcome::AlreadyMatched(session_id) = outcome {
            debug!("Cancel of {} came after a claim", self.player);
            self.enter_session(session_id).await?;
            self.engine.release_claimed(&self.player).await?;
            return Ok(outcome);
        }
        if let Some(wait) = self.searching.take() {
            wait.close();
        }
        self.search_started = None;
        self.search_seconds = 0;
        Ok(outcome)
    }

    /// Send a chat message.
    pub async fn send(&mut self, text: &str) -> Result<ChatEvent, ClientError> {
        let handle = self.active(Stage::Chatting)?;
        Ok(handle.send(&self.player, text).await?)
    }

    /// Guess whether the opponent was the persona.
    pub async fn guess(&mut self, guessed_ai: bool) -> Result<Settlement, ClientError> {
        let handle = self.active(Stage::Guessing)?;
        Ok(handle.guess(&self.player, guessed_ai).await?)
    }

    /// Result → Lobby.
    pub fn play_again(&mut self) -> Result<(), ClientError> {
        self.require(Stage::Result)?;
        self.session = None;
        Ok(())
    }

    /// The player's balance.
    pub async fn balance(&self) -> Result<i64, ClientError> {
        Ok(self.engine.balance(&self.player).await?)
    }

    /// Waiting players (cosmetic).
    pub async fn queue_depth(&self) -> Result<usize, ClientError> {
        Ok(self.engine.queue_depth().await?)
    }

    fn active(&self, expected: Stage) -> Result<ArbiterHandle, ClientError> {
        self.require(expected)?;
        self.session.clone().ok_or(ClientError::WrongStage {
            expected,
            actual: Stage::Lobby,
        })
    }
}
