//! Game Module
//!
//! The Human-or-AI engine: records, rules, pairing, arbitration, the
//! persona, settlement and the per-player flow.
//!
//! ## Module Structure
//!
//! - `model`: Store documents and identifiers
//! - `config`: Tunables
//! - `session`: Pure per-session state machine
//! - `matchmaker`: Claim-or-create pairing over the ticket pool
//! - `arbiter`: One authoritative actor per session
//! - `persona`: Completion-service adapter for the synthetic opponent
//! - `settlement`: Exactly-once balance updates
//! - `feed`: Deduplicated chat feed with pluggable ordering
//! - `engine`: Facade over all of the above
//! - `client`: One player's stage flow

pub mod model;
pub mod config;
pub mod session;
pub mod matchmaker;
pub mod arbiter;
pub mod persona;
pub mod settlement;
pub mod feed;
pub mod engine;
pub mod client;

// Re-export key types
pub use model::{ChatEvent, GameSession, GuessOutcome, MatchTicket, PlayerId, SessionId, Stage};
pub use config::{ConfigError, GameConfig};
pub use session::{PlayerView, SessionError, SessionSnapshot};
pub use matchmaker::{CancelOutcome, MatchWait, MatchmakingError};
pub use arbiter::ArbiterHandle;
pub use persona::{CompletionService, PersonaError, ScriptedCompletions};
pub use settlement::{Settlement, SettlementError};
pub use feed::{ClientClockOrdering, EventOrdering, ServerSequenceOrdering, SessionFeed};
pub use engine::{Enqueued, GameEngine};
pub use client::{ClientError, PlayerClient};
