//! # Human-or-AI Game Server
//!
//! Matchmaking and session engine for the "Human or AI?" chat game: two
//! strangers, or one stranger and a synthetic persona, chat in turns
//! against a clock, then each human guesses what the other side was.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    HUMAN-OR-AI SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  └── rng.rs      - Seeded Xorshift128+ PRNG                  │
//! │                                                              │
//! │  store/          - Shared document store                     │
//! │  ├── document.rs - Documents, queries, write batches         │
//! │  └── memory.rs   - In-process store with subscriptions       │
//! │                                                              │
//! │  game/           - Game logic                                │
//! │  ├── model.rs    - Tickets, sessions, events, balances       │
//! │  ├── session.rs  - Turn/stage state machine                  │
//! │  ├── matchmaker.rs - Claim-or-create pairing                 │
//! │  ├── arbiter.rs  - Authoritative actor per session           │
//! │  ├── persona.rs  - Synthetic opponent                        │
//! │  ├── settlement.rs - Exactly-once scoring                    │
//! │  ├── feed.rs     - Ordered, deduplicated chat feed           │
//! │  ├── engine.rs   - Facade                                    │
//! │  └── client.rs   - One player's stage flow                   │
//! │                                                              │
//! │  network/        - WebSocket gateway                         │
//! │  ├── server.rs   - Connection handling                       │
//! │  └── protocol.rs - Message types                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency
//!
//! - A ticket is claimed at most once; claims are conditional writes.
//! - Only a session's arbiter writes its turn and stage.
//! - Each human's guess is settled exactly once, even across retries.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod store;

// Re-export commonly used types
pub use core::rng::DeterministicRng;
pub use game::{GameConfig, GameEngine, PlayerClient, PlayerId, SessionId, Stage};
pub use store::{DocumentStore, MemoryStore, SharedStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Chat phase length (seconds)
pub const DEFAULT_CHAT_SECONDS: u64 = 120;

/// Points for a correct guess
pub const DEFAULT_REWARD: i64 = 50;

/// Points lost for a wrong guess
pub const DEFAULT_PENALTY: i64 = 25;
