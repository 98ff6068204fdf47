//! Game Configuration
//!
//! Tunables for the clock, the scoring and the persona. Defaults match the
//! live game; every value can be overridden from the environment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::core::rng::DeterministicRng;
use crate::{DEFAULT_CHAT_SECONDS, DEFAULT_PENALTY, DEFAULT_REWARD};

/// Inclusive duration range, sampled uniformly in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    /// Lower bound.
    pub min: Duration,
    /// Upper bound.
    pub max: Duration,
}

impl DelayRange {
    /// Range from millisecond bounds.
    pub const fn from_millis(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_millis(min),
            max: Duration::from_millis(max),
        }
    }

    /// Draw a delay.
    pub fn sample(&self, rng: &mut DeterministicRng) -> Duration {
        let ms = rng.next_u64_range(self.min.as_millis() as u64, self.max.as_millis() as u64);
        Duration::from_millis(ms)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid value {value:?} for {var}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },

    /// Reward and penalty must differ.
    #[error("reward and penalty must not be symmetric (both {0})")]
    SymmetricScoring(i64),

    /// A value that must be positive is not.
    #[error("{0} must be positive")]
    NotPositive(&'static str),

    /// A delay range has min > max.
    #[error("{0} has min greater than max")]
    InvertedRange(&'static str),

    /// Persona and human reply delays must differ.
    #[error("persona_reply_delay must differ from human_reply_delay")]
    SymmetricDelays,
}

/// Game configuration.
#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Length of the chat phase.
    pub chat_duration: Duration,
    /// Points for a correct guess.
    pub reward: i64,
    /// Points lost for a wrong guess (magnitude).
    pub penalty: i64,
    /// Balance of a player with no balance record.
    pub starting_balance: i64,
    /// Chat events handed to the persona per reply.
    pub persona_history: usize,
    /// Persona thinking delay before a reply. Must differ from
    /// `human_reply_delay`.
    pub persona_reply_delay: DelayRange,
    /// Reply latency band of a simulated human player.
    pub human_reply_delay: DelayRange,
    /// Persona thinking delay before its opening line.
    pub persona_opening_delay: DelayRange,
    /// Simulated typing time per reply character.
    pub persona_typing_per_char: Duration,
    /// Persona replies are cut to this many characters.
    pub persona_max_reply_chars: usize,
    /// Searching this long pairs the player with the persona. `None` disables.
    pub persona_fallback_after: Option<Duration>,
    /// Longest accepted chat message.
    pub max_message_chars: usize,
    /// Conflict re-runs for store transactions.
    pub transaction_attempts: usize,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            chat_duration: Duration::from_secs(DEFAULT_CHAT_SECONDS),
            reward: DEFAULT_REWARD,
            penalty: DEFAULT_PENALTY,
            starting_balance: 0,
            persona_history: 6,
            persona_reply_delay: DelayRange::from_millis(1_500, 4_000),
            human_reply_delay: DelayRange::from_millis(2_500, 9_000),
            persona_opening_delay: DelayRange::from_millis(800, 2_000),
            persona_typing_per_char: Duration::from_millis(45),
            persona_max_reply_chars: 120,
            persona_fallback_after: Some(Duration::from_secs(15)),
            max_message_chars: 500,
            transaction_attempts: 5,
        }
    }
}

fn env_parse<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(None),
    }
}

impl GameConfig {
    /// Defaults overridden by `HOA_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(secs) = env_parse::<u64>("HOA_CHAT_SECONDS")? {
            config.chat_duration = Duration::from_secs(secs);
        }
        if let Some(reward) = env_parse("HOA_REWARD")? {
            config.reward = reward;
        }
        if let Some(penalty) = env_parse("HOA_PENALTY")? {
            config.penalty = penalty;
        }
        if let Some(balance) = env_parse("HOA_STARTING_BALANCE")? {
            config.starting_balance = balance;
        }
        if let Some(secs) = env_parse::<u64>("HOA_PERSONA_FALLBACK_SECONDS")? {
            config.persona_fallback_after = (secs > 0).then(|| Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the game cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chat_duration.as_secs() == 0 {
            return Err(ConfigError::NotPositive("chat_duration"));
        }
        if self.reward <= 0 {
            return Err(ConfigError::NotPositive("reward"));
        }
        if self.penalty <= 0 {
            return Err(ConfigError::NotPositive("penalty"));
        }
        if self.reward == self.penalty {
            return Err(ConfigError::SymmetricScoring(self.reward));
        }
        if self.max_message_chars == 0 {
            return Err(ConfigError::NotPositive("max_message_chars"));
        }
        if self.persona_max_reply_chars == 0 {
            return Err(ConfigError::NotPositive("persona_max_reply_chars"));
        }
        if self.persona_reply_delay.min > self.persona_reply_delay.max {
            return Err(ConfigError::InvertedRange("persona_reply_delay"));
        }
        if self.persona_opening_delay.min > self.persona_opening_delay.max {
            return Err(ConfigError::InvertedRange("persona_opening_delay"));
        }
        if self.human_reply_delay.min > self.human_reply_delay.max {
            return Err(ConfigError::InvertedRange("human_reply_delay"));
        }
        if self.persona_reply_delay == self.human_reply_delay {
            return Err(ConfigError::SymmetricDelays);
        }
        Ok(())
    }

    /// Chat clock in whole seconds.
    pub fn chat_seconds(&self) -> u32 {
        self.chat_duration.as_secs().min(u32::MAX as u64) as u32
    }
}
