//! Session State Machine
//!
//! Store-free rules for one session: the turn gate, the chat clock and the
//! one-shot guess. The arbiter proposes changes through this machine, commits
//! them to the store, and only then accepts the committed record back.

use serde::{Serialize, Deserialize};

use crate::game::model::{ChatEvent, GameSession, GuessOutcome, PlayerId, SessionId, Stage};
use crate::game::settlement::SettlementError;
use crate::store::StoreError;

/// Result of one clock tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not chatting; the clock is stopped.
    Idle,
    /// Still chatting with this many seconds left.
    Running(u32),
    /// Time is up and the move to `Guessing` has not been committed yet.
    Expired,
}

/// Session errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// Sent while it is the other party's turn.
    #[error("not your turn")]
    TurnViolation,

    /// Guess already made for this session.
    #[error("already guessed")]
    AlreadyGuessed,

    /// Action not valid in the current stage.
    #[error("expected stage {expected}, session is {actual}")]
    InvalidStage {
        /// Stage the action needs.
        expected: Stage,
        /// Stage the session is in.
        actual: Stage,
    },

    /// The chat clock ran out.
    #[error("chat time is up")]
    TimeUp,

    /// Player is not in this session (or cannot act in it).
    #[error("not a participant")]
    NotAParticipant,

    /// No such session.
    #[error("session not found")]
    SessionNotFound,

    /// Message is empty after trimming.
    #[error("empty message")]
    EmptyMessage,

    /// Message exceeds the length limit.
    #[error("message longer than {0} characters")]
    MessageTooLong(usize),

    /// The settlement transaction failed; the session is still guessing.
    #[error("settlement failed: {0}")]
    SettlementFailed(StoreError),

    /// The arbiter for this session has stopped.
    #[error("session closed")]
    SessionClosed,

    /// Store error while committing a session change.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Errors caused by the network boundary; the call may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::SettlementFailed(_) | SessionError::Store(_))
    }
}

impl From<SettlementError> for SessionError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::Failed(e) => SessionError::SettlementFailed(e),
            SettlementError::SessionNotFound => SessionError::SessionNotFound,
            SettlementError::NotAParticipant => SessionError::NotAParticipant,
            SettlementError::NotGuessing(actual) => SessionError::InvalidStage {
                expected: Stage::Guessing,
                actual,
            },
        }
    }
}

/// One session's rules and clock.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    session: GameSession,
    time_left: u32,
    max_message_chars: usize,
}

impl SessionMachine {
    /// Wrap a session record. The clock starts full when chatting.
    pub fn new(session: GameSession, chat_seconds: u32, max_message_chars: usize) -> Self {
        let time_left = if session.stage == Stage::Chatting { chat_seconds } else { 0 };
        Self {
            session,
            time_left,
            max_message_chars,
        }
    }

    /// Current record.
    pub fn session(&self) -> &GameSession {
        &self.session
    }

    /// Session id.
    pub fn session_id(&self) -> SessionId {
        self.session.session_id
    }

    /// Session stage.
    pub fn stage(&self) -> Stage {
        self.session.stage
    }

    /// Seconds left on the chat clock.
    pub fn time_left(&self) -> u32 {
        self.time_left
    }

    /// Whose turn it is.
    pub fn current_turn(&self) -> &PlayerId {
        &self.session.current_turn
    }

    /// Validate a send and build the event plus the turn-flipped record.
    ///
    /// Rejections never touch the store.
    pub fn propose_send(&self, sender: &PlayerId, text: &str) -> Result<(ChatEvent, GameSession), SessionError> {
        let opponent = self
            .session
            .opponent_of(sender)
            .ok_or(SessionError::NotAParticipant)?
            .clone();

        if self.session.stage != Stage::Chatting {
            return Err(SessionError::InvalidStage {
                expected: Stage::Chatting,
                actual: self.session.stage,
            });
        }
        if self.time_left == 0 {
            return Err(SessionError::TimeUp);
        }
        if &self.session.current_turn != sender {
            return Err(SessionError::TurnViolation);
        }

        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if text.chars().count() > self.max_message_chars {
            return Err(SessionError::MessageTooLong(self.max_message_chars));
        }

        let event = ChatEvent::message(self.session.session_id, sender.clone(), text);
        let mut next = self.session.clone();
        next.current_turn = opponent;
        Ok((event, next))
    }

    /// Advance the clock by one second.
    pub fn tick(&mut self) -> TickOutcome {
        if self.session.stage != Stage::Chatting {
            return TickOutcome::Idle;
        }
        self.time_left = self.time_left.saturating_sub(1);
        if self.time_left == 0 {
            TickOutcome::Expired
        } else {
            TickOutcome::Running(self.time_left)
        }
    }

    /// Record for the move to `Guessing`. `None` unless the clock ran out.
    pub fn propose_expiry(&self) -> Option<GameSession> {
        if self.session.stage != Stage::Chatting || self.time_left > 0 {
            return None;
        }
        let mut next = self.session.clone();
        next.stage = Stage::Guessing;
        Some(next)
    }

    /// Validate a guess locally.
    pub fn check_guess(&self, guesser: &PlayerId) -> Result<(), SessionError> {
        if !guesser.is_human() || !self.session.is_participant(guesser) {
            return Err(SessionError::NotAParticipant);
        }
        if self.session.outcome_for(guesser).is_some() {
            return Err(SessionError::AlreadyGuessed);
        }
        if self.session.stage != Stage::Guessing {
            return Err(SessionError::InvalidStage {
                expected: Stage::Guessing,
                actual: self.session.stage,
            });
        }
        Ok(())
    }

    /// Adopt a committed record.
    pub fn accept(&mut self, session: GameSession) {
        if session.stage != Stage::Chatting {
            self.time_left = 0;
        }
        self.session = session;
    }

    /// Snapshot for observers.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.session.clone(),
            time_left: self.time_left,
        }
    }
}

// =============================================================================
// OBSERVABLE STATE
// =============================================================================

/// Full session state published by the arbiter.
///
/// Carries the ground truth; use [`SessionSnapshot::view_for`] before
/// showing anything to a player.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Committed record.
    pub session: GameSession,
    /// Seconds left on the chat clock.
    pub time_left: u32,
}

impl SessionSnapshot {
    /// What one participant may see. The opponent's nature stays hidden
    /// until that participant has guessed.
    pub fn view_for(&self, player: &PlayerId) -> PlayerView {
        let outcome = self.session.outcome_for(player).cloned();
        PlayerView {
            session_id: self.session.session_id,
            stage: self.session.stage_for(player),
            your_turn: &self.session.current_turn == player,
            time_left: self.time_left,
            opponent_was_ai: outcome.as_ref().map(|o| o.actually_ai),
            outcome,
        }
    }
}

/// One participant's view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerView {
    /// Session id.
    pub session_id: SessionId,
    /// Stage for this player.
    pub stage: Stage,
    /// May this player send now?
    pub your_turn: bool,
    /// Seconds left on the chat clock.
    pub time_left: u32,
    /// Revealed after the guess.
    pub opponent_was_ai: Option<bool>,
    /// This player's settled outcome.
    pub outcome: Option<GuessOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn alice() -> PlayerId {
        PlayerId::new("alice")
    }

    fn bob() -> PlayerId {
        PlayerId::new("bob")
    }

    fn machine(a_starts: bool) -> SessionMachine {
        let session = GameSession::new(SessionId::new(), alice(), bob(), a_starts);
        SessionMachine::new(session, 120, 500)
    }

    fn send(m: &mut SessionMachine, who: &PlayerId, text: &str) -> Result<ChatEvent, SessionError> {
        let (event, next) = m.propose_send(who, text)?;
        m.accept(next);
        Ok(event)
    }

    #[test]
    fn test_turn_gate() {
        let mut m = machine(true);

        assert!(matches!(m.propose_send(&bob(), "hi"), Err(SessionError::TurnViolation)));

        let event = send(&mut m, &alice(), "  hi there ").unwrap();
        assert_eq!(event.content, "hi there");
        assert_eq!(event.sender_id, alice());
        assert_eq!(m.current_turn(), &bob());

        assert!(matches!(m.propose_send(&alice(), "again"), Err(SessionError::TurnViolation)));
    }

    #[test]
    fn test_rejected_send_changes_nothing() {
        let m = machine(true);
        let before = m.session().clone();
        let _ = m.propose_send(&bob(), "out of turn");
        assert_eq!(m.session(), &before);
    }

    #[test]
    fn test_message_validation() {
        let m = machine(true);
        assert!(matches!(m.propose_send(&alice(), "   "), Err(SessionError::EmptyMessage)));
        let long = "x".repeat(501);
        assert!(matches!(m.propose_send(&alice(), &long), Err(SessionError::MessageTooLong(500))));
        assert!(matches!(
            m.propose_send(&PlayerId::new("mallory"), "hi"),
            Err(SessionError::NotAParticipant)
        ));
    }

    #[test]
    fn test_clock_expires_without_messages() {
        let session = GameSession::new(SessionId::new(), alice(), bob(), true);
        let mut m = SessionMachine::new(session, 3, 500);

        assert_eq!(m.tick(), TickOutcome::Running(2));
        assert_eq!(m.tick(), TickOutcome::Running(1));
        assert!(m.propose_expiry().is_none());
        assert_eq!(m.tick(), TickOutcome::Expired);

        // Sends are refused once time is up, whoever's turn it is.
        assert!(matches!(m.propose_send(&alice(), "late"), Err(SessionError::TimeUp)));

        let next = m.propose_expiry().unwrap();
        assert_eq!(next.stage, Stage::Guessing);
        m.accept(next);
        assert_eq!(m.stage(), Stage::Guessing);
        assert_eq!(m.tick(), TickOutcome::Idle);
    }

    #[test]
    fn test_expiry_repeats_until_committed() {
        let session = GameSession::new(SessionId::new(), alice(), bob(), true);
        let mut m = SessionMachine::new(session, 1, 500);
        assert_eq!(m.tick(), TickOutcome::Expired);
        assert_eq!(m.tick(), TickOutcome::Expired);
    }

    #[test]
    fn test_guess_rules() {
        let mut m = machine(true);
        assert!(matches!(
            m.check_guess(&alice()),
            Err(SessionError::InvalidStage { expected: Stage::Guessing, actual: Stage::Chatting })
        ));

        let mut guessing = m.session().clone();
        guessing.stage = Stage::Guessing;
        m.accept(guessing.clone());
        assert!(m.check_guess(&alice()).is_ok());
        assert!(matches!(m.check_guess(&PlayerId::persona()), Err(SessionError::NotAParticipant)));

        guessing.outcomes.push(GuessOutcome {
            session_id: guessing.session_id,
            guesser_id: alice(),
            guessed_ai: true,
            actually_ai: false,
            points_delta: -25,
        });
        m.accept(guessing);
        assert!(matches!(m.check_guess(&alice()), Err(SessionError::AlreadyGuessed)));
        assert!(m.check_guess(&bob()).is_ok());
    }

    #[test]
    fn test_view_hides_ground_truth_until_guess() {
        let session = GameSession::new(SessionId::new(), alice(), PlayerId::persona(), true);
        let mut m = SessionMachine::new(session, 120, 500);

        let view = m.snapshot().view_for(&alice());
        assert_eq!(view.stage, Stage::Chatting);
        assert!(view.your_turn);
        assert_eq!(view.opponent_was_ai, None);

        let mut settled = m.session().clone();
        settled.stage = Stage::Result;
        settled.outcomes.push(GuessOutcome {
            session_id: settled.session_id,
            guesser_id: alice(),
            guessed_ai: true,
            actually_ai: true,
            points_delta: 50,
        });
        m.accept(settled);

        let view = m.snapshot().view_for(&alice());
        assert_eq!(view.stage, Stage::Result);
        assert_eq!(view.opponent_was_ai, Some(true));
        assert_eq!(view.time_left, 0);
    }

    proptest! {
        #[test]
        fn prop_turn_alternates(a_starts in any::<bool>(), attempts in proptest::collection::vec(any::<bool>(), 1..40)) {
            let mut m = machine(a_starts);
            for by_alice in attempts {
                let who = if by_alice { alice() } else { bob() };
                let before = m.current_turn().clone();
                let result = send(&mut m, &who, "msg");
                if who == before {
                    prop_assert!(result.is_ok());
                    prop_assert_ne!(m.current_turn(), &before);
                } else {
                    prop_assert!(matches!(result, Err(SessionError::TurnViolation)));
                    prop_assert_eq!(m.current_turn(), &before);
                }
            }
        }
    }
}
