//! Protocol Messages
//!
//! Wire format between a player's UI and the gateway. JSON text frames,
//! tagged by `type`.
//!
//! The protocol never carries a sender id for chat lines; the viewer sees
//! `you`, `opponent` or `system`, so the persona cannot be told apart on
//! the wire.

use serde::{Serialize, Deserialize};

use crate::game::client::ClientError;
use crate::game::feed::ChatLine;
use crate::game::matchmaker::MatchmakingError;
use crate::game::model::{GuessOutcome, SessionId};
use crate::game::session::{PlayerView, SessionError};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Identify the connection. Must come first.
    Hello {
        /// Player identifier, taken as-is.
        player_id: String,
    },

    /// Lobby → Searching.
    Enqueue,

    /// Searching → Lobby.
    Cancel,

    /// Chat message on the player's turn.
    Send {
        /// Message text.
        text: String,
    },

    /// Guess the opponent's nature.
    Guess {
        /// `true` for "it was an AI".
        is_ai: bool,
    },

    /// Result → Lobby.
    PlayAgain,

    /// Liveness probe.
    Ping {
        /// Echoed back.
        #[serde(default)]
        timestamp: u64,
    },
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to `hello`.
    Welcome {
        /// Current balance.
        balance: i64,
        /// Waiting players.
        queue_depth: usize,
    },

    /// Still looking for an opponent.
    Searching {
        /// Waiting players.
        queue_depth: usize,
        /// Seconds spent searching.
        seconds: u32,
    },

    /// Paired into a session.
    Matched {
        /// The session.
        session_id: SessionId,
    },

    /// Session state as this player may see it.
    Session(PlayerView),

    /// A chat line, masked for this player.
    Chat(ChatLine),

    /// The guess was settled.
    Settled {
        /// The outcome.
        outcome: GuessOutcome,
        /// Balance after the outcome.
        new_balance: i64,
    },

    /// A request failed.
    Error(ServerError),

    /// Reply to `ping`.
    Pong {
        /// Echo of the ping.
        timestamp: u64,
        /// Server time in milliseconds.
        server_time: u64,
    },

    /// The server is going away.
    Shutdown {
        /// Why.
        reason: String,
    },
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Whether repeating the request may succeed.
    pub retryable: bool,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed message.
    InvalidInput,
    /// No `hello` yet.
    NotIdentified,
    /// Action not valid in the current stage.
    WrongStage,
    /// Not the sender's turn.
    NotYourTurn,
    /// Chat clock ran out.
    TimeUp,
    /// Guess already recorded.
    AlreadyGuessed,
    /// Empty or overlong message.
    MessageRejected,
    /// Unknown session or not a participant.
    SessionNotFound,
    /// Store or matchmaking unavailable.
    Unavailable,
    /// Connection limit reached.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

impl ServerError {
    /// Plain error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<&SessionError> for ErrorCode {
    fn from(e: &SessionError) -> Self {
        match e {
            SessionError::TurnViolation => ErrorCode::NotYourTurn,
            SessionError::AlreadyGuessed => ErrorCode::AlreadyGuessed,
            SessionError::InvalidStage { .. } => ErrorCode::WrongStage,
            SessionError::TimeUp => ErrorCode::TimeUp,
            SessionError::EmptyMessage | SessionError::MessageTooLong(_) => ErrorCode::MessageRejected,
            SessionError::NotAParticipant | SessionError::SessionNotFound => ErrorCode::SessionNotFound,
            SessionError::SettlementFailed(_) | SessionError::Store(_) => ErrorCode::Unavailable,
            SessionError::SessionClosed => ErrorCode::InternalError,
        }
    }
}

impl From<&ClientError> for ServerError {
    fn from(e: &ClientError) -> Self {
        let code = match e {
            ClientError::Session(inner) => ErrorCode::from(inner),
            ClientError::Matchmaking(MatchmakingError::InvalidPlayer(_)) => ErrorCode::InvalidInput,
            ClientError::Matchmaking(MatchmakingError::MatchmakingUnavailable(_)) => ErrorCode::Unavailable,
            ClientError::Store(_) => ErrorCode::Unavailable,
            ClientError::WrongStage { .. } => ErrorCode::WrongStage,
        };
        Self {
            code,
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::feed::Speaker;
    use crate::game::model::{EventId, Stage};
    use crate::store::StoreError;

    #[test]
    fn test_client_message_tags() {
        let msg = ClientMessage::from_json(r#"{"type":"hello","player_id":"alice"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Hello { player_id: "alice".into() });

        let msg = ClientMessage::from_json(r#"{"type":"guess","is_ai":true}"#).unwrap();
        assert_eq!(msg, ClientMessage::Guess { is_ai: true });

        let msg = ClientMessage::from_json(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping { timestamp: 0 });

        let json = ClientMessage::PlayAgain.to_json().unwrap();
        assert_eq!(json, r#"{"type":"play_again"}"#);
    }

    #[test]
    fn test_rejects_unknown_type() {
        assert!(ClientMessage::from_json(r#"{"type":"teleport"}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_session_view_is_flattened() {
        let view = PlayerView {
            session_id: SessionId::new(),
            stage: Stage::Chatting,
            your_turn: true,
            time_left: 42,
            opponent_was_ai: None,
            outcome: None,
        };
        let msg = ServerMessage::Session(view.clone());
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"session""#));
        assert!(json.contains(r#""time_left":42"#));
        assert_eq!(ServerMessage::from_json(&json).unwrap(), ServerMessage::Session(view));
    }

    #[test]
    fn test_chat_line_has_no_sender_id() {
        let msg = ServerMessage::Chat(ChatLine {
            event_id: EventId::new(),
            speaker: Speaker::Opponent,
            content: "hey".into(),
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""speaker":"opponent""#));
        assert!(!json.contains("sender"));
    }

    #[test]
    fn test_error_mapping() {
        let err = ServerError::from(&ClientError::Session(SessionError::TurnViolation));
        assert_eq!(err.code, ErrorCode::NotYourTurn);
        assert!(!err.retryable);

        let err = ServerError::from(&ClientError::Store(StoreError::Unavailable("down".into())));
        assert_eq!(err.code, ErrorCode::Unavailable);
        assert!(err.retryable);

        let err = ServerError::from(&ClientError::WrongStage {
            expected: Stage::Guessing,
            actual: Stage::Chatting,
        });
        assert_eq!(err.code, ErrorCode::WrongStage);

        let json = ServerMessage::Error(err).to_json().unwrap();
        assert!(json.contains("wrong_stage"));
    }
}
