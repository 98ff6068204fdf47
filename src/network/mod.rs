//! Network Layer
//!
//! WebSocket gateway between player UIs and the engine.
//! This layer holds no game rules; every action goes through `game/`.

pub mod protocol;
pub mod server;

pub use protocol::{ClientMessage, ErrorCode, ServerError, ServerMessage};
pub use server::{GameServer, GameServerError, ServerConfig};
