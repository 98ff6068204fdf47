//! Deterministic Random Number Generator
//!
//! Xorshift128+ seeded per session. Every random choice a session makes
//! (who speaks first, how long the persona "thinks") is drawn from a
//! generator derived from the session id, so a session can be replayed
//! from its record.

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

/// Deterministic PRNG using Xorshift128+ algorithm.
///
/// # Example
///
/// ```
/// use human_or_ai::core::rng::DeterministicRng;
///
/// let mut rng = DeterministicRng::new(12345);
/// let value = rng.next_u64();
/// assert_eq!(value, 6233086606872742541); // Always the same!
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Ensure state is never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Create the generator for one session.
    pub fn for_session(session_id: &[u8; 16], participants: &[&str]) -> Self {
        Self::new(derive_session_seed(session_id, participants))
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a random integer in range [min, max] (inclusive).
    #[inline]
    pub fn next_u64_range(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        let span = max - min;
        if span == u64::MAX {
            return self.next_u64();
        }
        min + self.next_u64() % (span + 1)
    }

    /// Fair coin flip.
    #[inline]
    pub fn next_coin(&mut self) -> bool {
        self.next_u64() >> 63 == 1
    }
}

/// SplitMix64 for seed initialization.
/// Produces well-distributed values from sequential seeds.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive a session seed from the session id and its participants.
///
/// Participants are hashed in the order given; callers pass them in
/// slot order (`player_a`, `player_b`).
pub fn derive_session_seed(session_id: &[u8; 16], participants: &[&str]) -> u64 {
    let mut hasher = Sha256::new();

    // Domain separator
    hasher.update(b"HUMAN_OR_AI_SESSION_V1");
    hasher.update(session_id);

    for participant in participants {
        hasher.update((participant.len() as u32).to_le_bytes());
        hasher.update(participant.as_bytes());
    }

    let hash = hasher.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[0..8]);
    u64::from_le_bytes(seed)
}

// =============================================================================
// TESTS
// =============================================================================
