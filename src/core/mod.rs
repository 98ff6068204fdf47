//! Core deterministic primitives.
//!
//! Seeded randomness shared by the matchmaker and the session arbiter.

pub mod rng;

pub use rng::{DeterministicRng, derive_session_seed};
