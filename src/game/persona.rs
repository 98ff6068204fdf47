//! Persona Responder
//!
//! Adapter between a session and the external text-completion service that
//! plays the synthetic opponent. Failures never reach the player: they turn
//! into short in-character fallback lines, so the turn always flips back.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::rng::DeterministicRng;
use crate::game::config::{DelayRange, GameConfig};
use crate::game::model::{ChatEvent, EventId};

/// Style contract sent with every completion.
pub const PERSONA_DIRECTIVE: &str = "you are chatting with a stranger in a game where they try to tell \
whether you are a person or a bot. reply like a real person texting: short, lower-case, casual, \
sometimes a typo, no lists, no emoji spam. never say you are an ai, a bot, an assistant or a \
language model, and never offer help. one or two short sentences at most.";

/// Prompt for the persona's first message.
pub const OPENING_PROMPT: &str = "(the chat just started and you go first. say something to open.)";

/// Used when the opening line cannot be generated.
pub const OPENING_FALLBACK: &str = "hey";

/// Used when a reply cannot be generated.
pub const LAG_FALLBACK: &str = "sorry lag, what did u say";

/// Persona errors. Logged and absorbed, never surfaced.
#[derive(Debug, Clone, Error)]
pub enum PersonaError {
    /// The completion call failed.
    #[error("persona unavailable: {0}")]
    PersonaUnavailable(String),

    /// The completion was empty after shaping.
    #[error("empty completion")]
    EmptyCompletion,
}

/// Speaker of a completion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human opponent.
    User,
    /// The persona.
    Assistant,
}

/// One history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMessage {
    /// Speaker.
    pub role: Role,
    /// Text.
    pub content: String,
}

impl CompletionMessage {
    /// Message from the human.
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    /// Message from the persona.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Request to the completion service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Style contract.
    pub directive: String,
    /// Ordered history, oldest first.
    pub messages: Vec<CompletionMessage>,
}

/// External text-completion service.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Produce one reply.
    async fn complete(&self, request: CompletionRequest) -> Result<String, PersonaError>;
}

// =============================================================================
// PERSONA TURN
// =============================================================================

/// Which line the persona is producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    /// First message of the session.
    Opening,
    /// Answer to a human message.
    Reply,
}

/// One synthetic reply being negotiated. Never persisted.
#[derive(Debug, Clone)]
pub struct PersonaTurn {
    /// Opening or reply.
    pub kind: TurnKind,
    /// History handed to the service, oldest first.
    pub history: Vec<CompletionMessage>,
    /// Style contract.
    pub directive: &'static str,
    /// Sampled thinking delay before typing time is added.
    pub thinking_delay: Duration,
}

/// A shaped line plus the delay to wait before delivering it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaReply {
    /// Text to send.
    pub text: String,
    /// Total delay (thinking plus typing).
    pub delay: Duration,
}

/// Drives the completion service for the persona.
#[derive(Clone)]
pub struct PersonaResponder {
    service: Arc<dyn CompletionService>,
    config: Arc<GameConfig>,
}

impl PersonaResponder {
    /// Create a responder.
    pub fn new(service: Arc<dyn CompletionService>, config: Arc<GameConfig>) -> Self {
        Self { service, config }
    }

    /// Plan the opening line.
    pub fn opening_turn(&self, rng: &mut DeterministicRng) -> PersonaTurn {
        PersonaTurn {
            kind: TurnKind::Opening,
            history: vec![CompletionMessage::user(OPENING_PROMPT)],
            directive: PERSONA_DIRECTIVE,
            thinking_delay: self.config.persona_opening_delay.sample(rng),
        }
    }

    /// Plan a reply to `new_message`.
    ///
    /// `transcript` is the session so far; the last `persona_history`
    /// non-system events before `new_message` are kept.
    pub fn reply_turn(
        &self,
        transcript: &[ChatEvent],
        new_message: &ChatEvent,
        rng: &mut DeterministicRng,
    ) -> PersonaTurn {
        let mut history = recent_history(transcript, new_message.event_id, self.config.persona_history);
        history.push(CompletionMessage::user(new_message.content.clone()));

        PersonaTurn {
            kind: TurnKind::Reply,
            history,
            directive: PERSONA_DIRECTIVE,
            thinking_delay: self.config.persona_reply_delay.sample(rng),
        }
    }

    /// Produce the line for a planned turn. Never fails.
    pub async fn take_turn(&self, turn: &PersonaTurn) -> PersonaReply {
        let text = match turn.kind {
            TurnKind::Opening => self.opening_line().await,
            TurnKind::Reply => self.reply(turn.history.clone()).await,
        };
        let range = match turn.kind {
            TurnKind::Opening => self.config.persona_opening_delay,
            TurnKind::Reply => self.config.persona_reply_delay,
        };
        let delay = self.thinking_delay(turn.thinking_delay, range, &text);
        PersonaReply { text, delay }
    }

    /// First message; falls back to [`OPENING_FALLBACK`].
    pub async fn opening_line(&self) -> String {
        let messages = vec![CompletionMessage::user(OPENING_PROMPT)];
        match self.complete(messages).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Persona opening line failed, using fallback: {}", e);
                OPENING_FALLBACK.to_string()
            }
        }
    }

    /// Reply to the history; falls back to [`LAG_FALLBACK`].
    pub async fn reply(&self, history: Vec<CompletionMessage>) -> String {
        match self.complete(history).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Persona reply failed, using fallback: {}", e);
                LAG_FALLBACK.to_string()
            }
        }
    }

    /// Thinking delay plus typing time, capped at twice the range maximum.
    pub fn thinking_delay(&self, base: Duration, range: DelayRange, text: &str) -> Duration {
        let typing = self.config.persona_typing_per_char * text.chars().count() as u32;
        (base + typing).min(range.max * 2)
    }

    async fn complete(&self, messages: Vec<CompletionMessage>) -> Result<String, PersonaError> {
        let request = CompletionRequest {
            directive: PERSONA_DIRECTIVE.to_string(),
            messages,
        };

        #[cfg(feature = "debug-tracing")]
        tracing::trace!("Completion request: {:?}", request);

        let raw = self.service.complete(request).await?;
        let shaped = shape_reply(&raw, self.config.persona_max_reply_chars)?;
        debug!("Persona line: {:?}", shaped);
        Ok(shaped)
    }
}

/// Last `limit` non-system events before `exclude`, mapped to roles.
fn recent_history(transcript: &[ChatEvent], exclude: EventId, limit: usize) -> Vec<CompletionMessage> {
    let relevant: Vec<&ChatEvent> = transcript
        .iter()
        .filter(|e| !e.is_system() && e.event_id != exclude)
        .collect();
    let start = relevant.len().saturating_sub(limit);

    relevant[start..]
        .iter()
        .map(|e| {
            if e.sender_id.is_persona() {
                CompletionMessage::assistant(e.content.clone())
            } else {
                CompletionMessage::user(e.content.clone())
            }
        })
        .collect()
}

/// Make a raw completion look typed.
pub fn shape_reply(raw: &str, max_chars: usize) -> Result<String, PersonaError> {
    let mut text = raw.trim().to_lowercase();

    let unquoted = text.trim_matches(|c: char| c == '"' || c == '\'' || c == '“' || c == '”').trim();
    text = unquoted.to_string();

    if text.ends_with('.') && !text.ends_with("..") {
        text.pop();
    }

    if text.chars().count() > max_chars {
        text = text.chars().take(max_chars).collect::<String>().trim_end().to_string();
    }

    if text.is_empty() {
        return Err(PersonaError::EmptyCompletion);
    }
    Ok(text)
}

// =============================================================================
// SCRIPTED SERVICE
// =============================================================================

/// Canned lines for the demo server and tests.
const CANNED_LINES: &[&str] = &[
    "haha yeah",
    "wait what do you mean",
    "idk honestly, kinda tired today",
    "lol fair",
    "where are you from?",
    "that's wild",
    "hmm not sure, you?",
    "ok that's actually funny",
];

/// Deterministic in-process [`CompletionService`].
pub struct ScriptedCompletions {
    lines: Vec<String>,
    next: AtomicUsize,
    failing: AtomicBool,
    calls: AtomicUsize,
    last_request: Mutex<Option<CompletionRequest>>,
}

impl ScriptedCompletions {
    /// Service cycling through the built-in casual lines.
    pub fn new() -> Self {
        Self::with_lines(CANNED_LINES.iter().map(|s| s.to_string()).collect())
    }

    /// Service cycling through `lines`.
    pub fn with_lines(lines: Vec<String>) -> Self {
        Self {
            lines,
            next: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Make every call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Completion calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most recent request.
    pub async fn last_request(&self) -> Option<CompletionRequest> {
        self.last_request.lock().await.clone()
    }
}

impl Default for ScriptedCompletions {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletions {
    async fn complete(&self, request: CompletionRequest) -> Result<String, PersonaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().await = Some(request);

        if self.failing.load(Ordering::SeqCst) {
            return Err(PersonaError::PersonaUnavailable("scripted failure".into()));
        }
        if self.lines.is_empty() {
            return Ok(String::new());
        }
        let i = self.next.fetch_add(1, Ordering::SeqCst) % self.lines.len();
        Ok(self.lines[i].clone())
    }
}
