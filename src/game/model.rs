//! Game Records
//!
//! Documents persisted in the shared store: tickets, sessions, chat events,
//! guess outcomes and balances.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::store::{DocKey, Document, StoreError};

/// Store collections used by the engine.
pub mod collections {
    /// Waiting players.
    pub const TICKETS: &str = "tickets";
    /// Game sessions.
    pub const SESSIONS: &str = "sessions";
    /// Chat events of every session.
    pub const EVENTS: &str = "events";
    /// Point balances.
    pub const BALANCES: &str = "balances";
}

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Reserved id of the synthetic opponent.
pub const PERSONA_ID: &str = "~persona";

/// Sender id of system notices.
pub const SYSTEM_SENDER: &str = "system";

/// Player identity as issued by the (external) auth provider.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    /// Wrap an identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The synthetic persona.
    pub fn persona() -> Self {
        Self(PERSONA_ID.to_string())
    }

    /// Sender of system notices.
    pub fn system() -> Self {
        Self(SYSTEM_SENDER.to_string())
    }

    /// Is this the synthetic persona?
    pub fn is_persona(&self) -> bool {
        self.0 == PERSONA_ID
    }

    /// Is this the system sender?
    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM_SENDER
    }

    /// Can this id queue for a match?
    pub fn is_human(&self) -> bool {
        !self.0.trim().is_empty() && !self.is_persona() && !self.is_system()
    }

    /// Raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique session identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from the hyphenated form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Raw bytes (seed derivation).
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique chat event identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// STAGE
// =============================================================================

/// Game stage, as seen by one player.
///
/// Sessions are only ever stored in `Chatting`, `Guessing` or `Result`;
/// `Lobby` and `Searching` exist before a session does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// No active session.
    Lobby,
    /// Waiting for an opponent.
    Searching,
    /// Timed, turn-locked chat.
    Chatting,
    /// Waiting for the guess.
    Guessing,
    /// Settled.
    Result,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Lobby => "lobby",
            Stage::Searching => "searching",
            Stage::Chatting => "chatting",
            Stage::Guessing => "guessing",
            Stage::Result => "result",
        };
        f.write_str(name)
    }
}

// =============================================================================
// MATCH TICKET
// =============================================================================

/// One waiting player.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchTicket {
    /// Owner.
    pub owner_id: PlayerId,
    /// When the ticket was created (server clock).
    pub enqueued_at: DateTime<Utc>,
    /// Set exactly once by whoever claims the ticket.
    pub matched_session_id: Option<SessionId>,
}

impl MatchTicket {
    /// Fresh unmatched ticket.
    pub fn new(owner_id: PlayerId) -> Self {
        Self {
            owner_id,
            enqueued_at: Utc::now(),
            matched_session_id: None,
        }
    }

    /// Store key; one ticket per player.
    pub fn key(owner: &PlayerId) -> DocKey {
        DocKey::new(collections::TICKETS, owner.as_str())
    }

    /// Decode a ticket; the store's creation time is authoritative.
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut ticket: MatchTicket = doc.decode()?;
        ticket.enqueued_at = doc.created_at;
        Ok(ticket)
    }
}

// =============================================================================
// GAME SESSION
// =============================================================================

/// Authoritative record of one match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameSession {
    /// Session id.
    pub session_id: SessionId,
    /// First slot (the claiming player).
    pub player_a: PlayerId,
    /// Second slot (claimed player or the persona).
    pub player_b: PlayerId,
    /// Who may send next.
    pub current_turn: PlayerId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Session stage.
    pub stage: Stage,
    /// Ground truth: the opponent slot holds the persona.
    pub resolved_as_ai: bool,
    /// One outcome per human guesser.
    #[serde(default)]
    pub outcomes: Vec<GuessOutcome>,
}

impl GameSession {
    /// New session in `Chatting`. `a_starts` picks the opening turn.
    pub fn new(session_id: SessionId, player_a: PlayerId, player_b: PlayerId, a_starts: bool) -> Self {
        let current_turn = if a_starts { player_a.clone() } else { player_b.clone() };
        let resolved_as_ai = player_b.is_persona();
        Self {
            session_id,
            player_a,
            player_b,
            current_turn,
            created_at: Utc::now(),
            stage: Stage::Chatting,
            resolved_as_ai,
            outcomes: Vec::new(),
        }
    }

    /// Store key.
    pub fn key(id: &SessionId) -> DocKey {
        DocKey::new(collections::SESSIONS, id.to_string())
    }

    /// Is this player in the session?
    pub fn is_participant(&self, player: &PlayerId) -> bool {
        &self.player_a == player || &self.player_b == player
    }

    /// The other slot.
    pub fn opponent_of(&self, player: &PlayerId) -> Option<&PlayerId> {
        if &self.player_a == player {
            Some(&self.player_b)
        } else if &self.player_b == player {
            Some(&self.player_a)
        } else {
            None
        }
    }

    /// Does the opponent slot hold the persona?
    pub fn has_persona(&self) -> bool {
        self.player_b.is_persona()
    }

    /// Participants that guess.
    pub fn humans(&self) -> impl Iterator<Item = &PlayerId> {
        [&self.player_a, &self.player_b]
            .into_iter()
            .filter(|p| !p.is_persona())
    }

    /// Outcome recorded for a guesser.
    pub fn outcome_for(&self, player: &PlayerId) -> Option<&GuessOutcome> {
        self.outcomes.iter().find(|o| &o.guesser_id == player)
    }

    /// Has every human guessed?
    pub fn all_humans_guessed(&self) -> bool {
        self.humans().all(|p| self.outcome_for(p).is_some())
    }

    /// Stage as seen by one participant.
    pub fn stage_for(&self, player: &PlayerId) -> Stage {
        if self.outcome_for(player).is_some() {
            Stage::Result
        } else {
            self.stage
        }
    }
}

// =============================================================================
// CHAT EVENT
// =============================================================================

/// Immutable chat message or system notice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Event id.
    pub event_id: EventId,
    /// Owning session.
    pub session_id: SessionId,
    /// Player id, persona id or `"system"`.
    pub sender_id: PlayerId,
    /// Text.
    pub content: String,
    /// Sender's clock.
    pub client_timestamp: DateTime<Utc>,
}

impl ChatEvent {
    /// Message from a participant.
    pub fn message(session_id: SessionId, sender_id: PlayerId, content: impl Into<String>) -> Self {
        Self {
            event_id: EventId::new(),
            session_id,
            sender_id,
            content: content.into(),
            client_timestamp: Utc::now(),
        }
    }

    /// System notice.
    pub fn notice(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::message(session_id, PlayerId::system(), content)
    }

    /// Store key.
    pub fn key(&self) -> DocKey {
        DocKey::new(collections::EVENTS, self.event_id.to_string())
    }

    /// Is this a system notice?
    pub fn is_system(&self) -> bool {
        self.sender_id.is_system()
    }
}

// =============================================================================
// OUTCOME / BALANCE
// =============================================================================

/// Result of one player's guess.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuessOutcome {
    /// Session.
    pub session_id: SessionId,
    /// Who guessed.
    pub guesser_id: PlayerId,
    /// The guess.
    pub guessed_ai: bool,
    /// Ground truth copied from the session.
    pub actually_ai: bool,
    /// Applied balance change.
    pub points_delta: i64,
}

impl GuessOutcome {
    /// Was the guess right?
    pub fn is_correct(&self) -> bool {
        self.guessed_ai == self.actually_ai
    }
}

/// A player's point balance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Owner.
    pub player_id: PlayerId,
    /// Current points.
    pub points: i64,
}

impl Balance {
    /// Store key.
    pub fn key(player: &PlayerId) -> DocKey {
        DocKey::new(collections::BALANCES, player.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::encode;

    #[test]
    fn test_player_id_kinds() {
        assert!(PlayerId::new("alice").is_human());
        assert!(!PlayerId::persona().is_human());
        assert!(!PlayerId::system().is_human());
        assert!(!PlayerId::new("  ").is_human());
        assert!(PlayerId::persona().is_persona());
    }

    #[test]
    fn test_session_slots() {
        let a = PlayerId::new("alice");
        let b = PlayerId::new("bob");
        let session = GameSession::new(SessionId::new(), a.clone(), b.clone(), false);

        assert_eq!(session.current_turn, b);
        assert_eq!(session.stage, Stage::Chatting);
        assert!(!session.resolved_as_ai);
        assert_eq!(session.opponent_of(&a), Some(&b));
        assert_eq!(session.opponent_of(&b), Some(&a));
        assert_eq!(session.opponent_of(&PlayerId::new("carol")), None);
        assert_eq!(session.humans().count(), 2);
    }

    #[test]
    fn test_persona_session_is_resolved_as_ai() {
        let a = PlayerId::new("alice");
        let session = GameSession::new(SessionId::new(), a.clone(), PlayerId::persona(), true);
        assert!(session.resolved_as_ai);
        assert!(session.has_persona());
        assert_eq!(session.humans().collect::<Vec<_>>(), vec![&a]);
    }

    #[test]
    fn test_stage_for_guesser() {
        let a = PlayerId::new("alice");
        let b = PlayerId::new("bob");
        let mut session = GameSession::new(SessionId::new(), a.clone(), b.clone(), true);
        session.stage = Stage::Guessing;
        session.outcomes.push(GuessOutcome {
            session_id: session.session_id,
            guesser_id: a.clone(),
            guessed_ai: false,
            actually_ai: false,
            points_delta: 50,
        });

        assert_eq!(session.stage_for(&a), Stage::Result);
        assert_eq!(session.stage_for(&b), Stage::Guessing);
        assert!(!session.all_humans_guessed());
    }

    #[test]
    fn test_ticket_uses_store_clock() {
        let ticket = MatchTicket::new(PlayerId::new("alice"));
        let created_at = Utc::now() - chrono::Duration::seconds(30);
        let doc = Document {
            key: MatchTicket::key(&ticket.owner_id),
            data: encode(&ticket).unwrap(),
            version: 1,
            create_seq: 1,
            update_seq: 1,
            created_at,
        };

        let decoded = MatchTicket::from_document(&doc).unwrap();
        assert_eq!(decoded.enqueued_at, created_at);
        assert_eq!(decoded.matched_session_id, None);
    }

    #[test]
    fn test_session_document_shape() {
        let session = GameSession::new(SessionId::new(), PlayerId::new("a"), PlayerId::persona(), true);
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["stage"], "chatting");
        assert_eq!(json["player_b"], PERSONA_ID);
        assert_eq!(json["resolved_as_ai"], true);
    }
}
