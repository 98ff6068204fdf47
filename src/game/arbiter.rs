//! Session Arbiter
//!
//! One actor task per session. It is the only writer of the session's turn,
//! stage and chat events; players propose actions through an
//! [`ArbiterHandle`] and observe the result on a `watch` channel.
//!
//! ```text
//! ┌──────────┐  Send/Guess   ┌──────────────┐  batch   ┌───────┐
//! │  handle  │ ────────────► │   arbiter    │ ───────► │ store │
//! │ (player) │ ◄──────────── │ (1 per game) │          └───────┘
//! └──────────┘   snapshots   └──────┬───────┘
//!                                   │ spawn / PersonaLine
//!                              ┌────▼────┐
//!                              │ persona │
//!                              └─────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::rng::DeterministicRng;
use crate::game::config::GameConfig;
use crate::game::model::{collections, ChatEvent, GameSession, PlayerId, SessionId, Stage};
use crate::game::persona::{PersonaResponder, PersonaTurn};
use crate::game::session::{SessionError, SessionMachine, SessionSnapshot, TickOutcome};
use crate::game::settlement::{Ledger, Settlement, SettlementError};
use crate::store::{encode, run_transaction, Direction, Filter, Order, Query, SharedStore, StoreError};

/// Notice written when the chat clock runs out.
pub const TIME_UP_NOTICE: &str = "time's up! was that a human or an ai?";

/// Command queue depth per session.
const COMMAND_BUFFER: usize = 64;

enum Command {
    Send {
        player: PlayerId,
        text: String,
        reply: oneshot::Sender<Result<ChatEvent, SessionError>>,
    },
    Guess {
        player: PlayerId,
        guessed_ai: bool,
        reply: oneshot::Sender<Result<Settlement, SessionError>>,
    },
    PersonaLine {
        generation: u64,
        text: String,
    },
}

/// Collaborators shared by every arbiter.
#[derive(Clone)]
pub struct ArbiterDeps {
    /// Shared store.
    pub store: SharedStore,
    /// Game configuration.
    pub config: Arc<GameConfig>,
    /// Balance ledger.
    pub ledger: Ledger,
    /// Persona adapter.
    pub persona: PersonaResponder,
}

// =============================================================================
// HANDLE
// =============================================================================

/// A player's connection to a session arbiter.
#[derive(Clone)]
pub struct ArbiterHandle {
    session_id: SessionId,
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl ArbiterHandle {
    /// Session id.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Propose a chat message.
    pub async fn send(&self, player: &PlayerId, text: &str) -> Result<ChatEvent, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                player: player.clone(),
                text: text.to_string(),
                reply,
            })
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Submit a guess.
    pub async fn guess(&self, player: &PlayerId, guessed_ai: bool) -> Result<Settlement, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Guess {
                player: player.clone(),
                guessed_ai,
                reply,
            })
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Observable session state.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Latest published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Has the arbiter stopped?
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

// =============================================================================
// ACTOR
// =============================================================================

struct PendingLine {
    generation: u64,
    text: String,
}

struct SessionArbiter {
    machine: SessionMachine,
    deps: ArbiterDeps,
    transcript: Vec<ChatEvent>,
    rng: DeterministicRng,
    commands: mpsc::WeakSender<Command>,
    snapshots: watch::Sender<SessionSnapshot>,
    /// Bumped whenever outstanding persona lines become stale.
    persona_generation: u64,
    /// Persona line whose commit failed; retried on the next tick.
    pending_line: Option<PendingLine>,
}

/// Seconds left on a session's clock, measured from its creation.
fn remaining_seconds(session: &GameSession, config: &GameConfig) -> u32 {
    let elapsed = (Utc::now() - session.created_at).num_seconds().max(0) as u64;
    config.chat_duration.as_secs().saturating_sub(elapsed).min(u32::MAX as u64) as u32
}

/// Start an arbiter for a stored session.
pub fn spawn_arbiter(deps: ArbiterDeps, session: GameSession, transcript: Vec<ChatEvent>) -> ArbiterHandle {
    let session_id = session.session_id;
    let remaining = remaining_seconds(&session, &deps.config);
    let machine = SessionMachine::new(session, remaining, deps.config.max_message_chars);

    let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
    let (snapshot_tx, snapshot_rx) = watch::channel(machine.snapshot());

    let participants = [machine.session().player_a.as_str(), machine.session().player_b.as_str()];
    let mut rng = DeterministicRng::for_session(session_id.as_bytes(), &participants);
    // The first draw picked the opening turn.
    rng.next_coin();

    let arbiter = SessionArbiter {
        machine,
        deps,
        transcript,
        rng,
        commands: commands.downgrade(),
        snapshots: snapshot_tx,
        persona_generation: 0,
        pending_line: None,
    };
    tokio::spawn(arbiter.run(receiver));

    ArbiterHandle {
        session_id,
        commands,
        snapshots: snapshot_rx,
    }
}

impl SessionArbiter {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let session_id = self.machine.session_id();
        debug!("Arbiter for {} started", session_id);

        let start = Instant::now() + Duration::from_secs(1);
        let mut clock = interval_at(start, Duration::from_secs(1));
        clock.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.maybe_open();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = clock.tick(), if self.machine.stage() == Stage::Chatting => {
                    self.on_tick().await;
                }
            }
        }

        debug!("Arbiter for {} stopped", session_id);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Send { player, text, reply } => {
                let result = self.handle_send(&player, &text).await;
                let _ = reply.send(result);
            }
            Command::Guess { player, guessed_ai, reply } => {
                let result = self.handle_guess(&player, guessed_ai).await;
                let _ = reply.send(result);
            }
            Command::PersonaLine { generation, text } => {
                self.deliver_persona_line(PendingLine { generation, text }).await;
            }
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.machine.snapshot());
    }

    // -------------------------------------------------------------------------
    // Chat
    // -------------------------------------------------------------------------

    async fn handle_send(&mut self, player: &PlayerId, text: &str) -> Result<ChatEvent, SessionError> {
        if player.is_persona() {
            return Err(SessionError::NotAParticipant);
        }
        let event = self.commit_message(player, text).await?;

        if self.machine.session().has_persona() {
            let turn = self
                .deps
                .persona
                .reply_turn(&self.transcript, &event, &mut self.rng);
            self.schedule_persona(turn);
        }
        Ok(event)
    }

    /// Validate locally, then commit the event and the turn flip as one batch.
    async fn commit_message(&mut self, sender: &PlayerId, text: &str) -> Result<ChatEvent, SessionError> {
        let (event, proposed) = self.machine.propose_send(sender, text)?;

        let committed = {
            let event = event.clone();
            let sender = sender.clone();
            let next_turn = proposed.current_turn.clone();
            run_transaction(&self.deps.store, self.deps.config.transaction_attempts, move |mut txn| {
                let event = event.clone();
                let sender = sender.clone();
                let next_turn = next_turn.clone();
                Box::pin(async move {
                    let key = GameSession::key(&event.session_id);
                    let mut stored: GameSession = txn
                        .get(&key)
                        .await?
                        .ok_or(SessionError::SessionNotFound)?
                        .decode()?;

                    if stored.stage != Stage::Chatting {
                        return Err(SessionError::InvalidStage {
                            expected: Stage::Chatting,
                            actual: stored.stage,
                        });
                    }
                    if stored.current_turn != sender {
                        return Err(SessionError::TurnViolation);
                    }

                    stored.current_turn = next_turn;
                    txn.put(key, encode(&stored)?);
                    txn.create(event.key(), encode(&event)?);
                    Ok::<_, SessionError>((txn, stored))
                })
            })
            .await
        };

        match committed {
            Ok(session) => {
                debug!("{} sent in {}", sender, session.session_id);
                self.machine.accept(session);
                self.transcript.push(event.clone());
                self.publish();
                Ok(event)
            }
            Err(e) => {
                warn!("Send by {} not committed: {}", sender, e);
                self.resync().await;
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Persona
    // -------------------------------------------------------------------------

    fn maybe_open(&mut self) {
        let session = self.machine.session();
        let persona_spoke = self.transcript.iter().any(|e| e.sender_id.is_persona());
        if session.has_persona()
            && session.stage == Stage::Chatting
            && session.current_turn.is_persona()
            && !persona_spoke
        {
            let turn = self.deps.persona.opening_turn(&mut self.rng);
            self.schedule_persona(turn);
        }
    }

    fn schedule_persona(&mut self, turn: PersonaTurn) {
        self.persona_generation += 1;
        let generation = self.persona_generation;
        let persona = self.deps.persona.clone();
        let commands = self.commands.clone();

        tokio::spawn(async move {
            let reply = persona.take_turn(&turn).await;
            tokio::time::sleep(reply.delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands
                    .send(Command::PersonaLine {
                        generation,
                        text: reply.text,
                    })
                    .await;
            }
        });
    }

    async fn deliver_persona_line(&mut self, line: PendingLine) {
        if line.generation != self.persona_generation {
            debug!("Dropping stale persona line");
            return;
        }
        if self.machine.stage() != Stage::Chatting || self.machine.time_left() == 0 {
            debug!("Dropping persona line after the clock ran out");
            return;
        }

        let persona = PlayerId::persona();
        match self.commit_message(&persona, &line.text).await {
            Ok(_) => {}
            Err(SessionError::Store(e)) => {
                warn!("Persona line not committed, retrying next tick: {}", e);
                self.pending_line = Some(line);
            }
            Err(e) => debug!("Persona line rejected: {}", e),
        }
    }

    // -------------------------------------------------------------------------
    // Clock
    // -------------------------------------------------------------------------

    async fn on_tick(&mut self) {
        match self.machine.tick() {
            TickOutcome::Running(_) => {
                self.publish();
                if let Some(line) = self.pending_line.take() {
                    self.deliver_persona_line(line).await;
                }
            }
            TickOutcome::Expired => self.commit_expiry().await,
            TickOutcome::Idle => {}
        }
    }

    /// Move to `Guessing`. Retried on every tick until it commits.
    async fn commit_expiry(&mut self) {
        let Some(proposed) = self.machine.propose_expiry() else {
            return;
        };
        let session_id = proposed.session_id;

        let committed = run_transaction(&self.deps.store, self.deps.config.transaction_attempts, move |mut txn| {
            Box::pin(async move {
                let key = GameSession::key(&session_id);
                let mut stored: GameSession = txn
                    .get(&key)
                    .await?
                    .ok_or(StoreError::NotFound(key.to_string()))?
                    .decode()?;

                if stored.stage != Stage::Chatting {
                    return Ok((txn, (stored, None)));
                }

                stored.stage = Stage::Guessing;
                let notice = ChatEvent::notice(session_id, TIME_UP_NOTICE);
                txn.put(key, encode(&stored)?);
                txn.create(notice.key(), encode(&notice)?);
                Ok::<_, StoreError>((txn, (stored, Some(notice))))
            })
        })
        .await;

        match committed {
            Ok((session, notice)) => {
                info!("Session {} chat time is up", session_id);
                self.machine.accept(session);
                self.transcript.extend(notice);
                self.persona_generation += 1;
                self.pending_line = None;
                self.publish();
            }
            Err(e) => {
                warn!("Expiry of {} not committed, retrying: {}", session_id, e);
                self.publish();
            }
        }
    }

    // -------------------------------------------------------------------------
    // Guess
    // -------------------------------------------------------------------------

    async fn handle_guess(&mut self, player: &PlayerId, guessed_ai: bool) -> Result<Settlement, SessionError> {
        self.machine.check_guess(player)?;

        match self.deps.ledger.settle(self.machine.session_id(), player, guessed_ai).await {
            Ok(settlement) => {
                self.machine.accept(settlement.session.clone());
                self.publish();
                Ok(settlement)
            }
            Err(SettlementError::Failed(e)) => {
                // Outcome unknown; a retry replays it if the write landed.
                warn!("Settlement for {} failed: {}", player, e);
                Err(SessionError::SettlementFailed(e))
            }
            Err(e) => {
                self.resync().await;
                Err(e.into())
            }
        }
    }

    /// Reload the session record after a rejected or failed commit.
    async fn resync(&mut self) {
        let key = GameSession::key(&self.machine.session_id());
        match self.deps.store.get(&key).await {
            Ok(Some(doc)) => match doc.decode::<GameSession>() {
                Ok(session) => {
                    self.machine.accept(session);
                    self.publish();
                }
                Err(e) => warn!("Session {} unreadable: {}", key, e),
            },
            Ok(None) => warn!("Session {} vanished", key),
            Err(e) => debug!("Resync of {} failed: {}", key, e),
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Live arbiters by session.
pub struct ArbiterRegistry {
    deps: ArbiterDeps,
    arbiters: RwLock<BTreeMap<SessionId, ArbiterHandle>>,
}

impl ArbiterRegistry {
    /// Create an empty registry.
    pub fn new(deps: ArbiterDeps) -> Self {
        Self {
            deps,
            arbiters: RwLock::new(BTreeMap::new()),
        }
    }

    /// Live handle for a session, loading it and starting its arbiter if needed.
    pub async fn attach(&self, session_id: SessionId) -> Result<ArbiterHandle, SessionError> {
        if let Some(handle) = self.get(session_id).await {
            return Ok(handle);
        }

        let mut arbiters = self.arbiters.write().await;
        if let Some(handle) = arbiters.get(&session_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let session: GameSession = self
            .deps
            .store
            .get(&GameSession::key(&session_id))
            .await?
            .ok_or(SessionError::SessionNotFound)?
            .decode()?;

        let query = Query::collection(collections::EVENTS)
            .filter(Filter::eq("session_id", session_id.to_string()))
            .order(Order::Created(Direction::Ascending));
        let transcript = self
            .deps
            .store
            .query(&query)
            .await?
            .iter()
            .map(|doc| doc.decode::<ChatEvent>())
            .collect::<Result<Vec<_>, _>>()?;

        let handle = spawn_arbiter(self.deps.clone(), session, transcript);
        arbiters.insert(session_id, handle.clone());
        info!("Arbiter attached for session {}", session_id);
        Ok(handle)
    }

    /// Live handle, if one is running.
    pub async fn get(&self, session_id: SessionId) -> Option<ArbiterHandle> {
        self.arbiters
            .read()
            .await
            .get(&session_id)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Drop handles of settled or stopped sessions. Returns how many.
    pub async fn cleanup(&self) -> usize {
        let mut arbiters = self.arbiters.write().await;
        let before = arbiters.len();
        arbiters.retain(|_, h| !h.is_closed() && h.snapshot().session.stage != Stage::Result);
        before - arbiters.len()
    }

    /// Number of tracked sessions.
    pub async fn len(&self) -> usize {
        self.arbiters.read().await.len()
    }

    /// No sessions tracked?
    pub async fn is_empty(&self) -> bool {
        self.arbiters.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::config::DelayRange;
    use crate::game::persona::{ScriptedCompletions, LAG_FALLBACK};
    use crate::store::{DocumentStore, MemoryStore, Precondition, WriteOp};

    struct Fixture {
        memory: Arc<MemoryStore>,
        service: Arc<ScriptedCompletions>,
        registry: ArbiterRegistry,
        ledger: Ledger,
    }

    fn fixture(config: GameConfig) -> Fixture {
        let memory = Arc::new(MemoryStore::new());
        let store: SharedStore = memory.clone();
        let config = Arc::new(config);
        let service = Arc::new(ScriptedCompletions::with_lines(vec!["Hey there.".into()]));
        let ledger = Ledger::new(store.clone(), config.clone());
        let deps = ArbiterDeps {
            store,
            config: config.clone(),
            ledger: ledger.clone(),
            persona: PersonaResponder::new(service.clone(), config),
        };
        Fixture {
            memory,
            service,
            registry: ArbiterRegistry::new(deps),
            ledger,
        }
    }

    fn short_clock(secs: u64) -> GameConfig {
        GameConfig {
            chat_duration: Duration::from_secs(secs),
            ..Default::default()
        }
    }

    async fn store_session(memory: &MemoryStore, session: &GameSession) {
        memory
            .commit(vec![WriteOp::Put {
                key: GameSession::key(&session.session_id),
                data: encode(session).unwrap(),
                precondition: Precondition::MustNotExist,
            }])
            .await
            .unwrap();
    }

    async fn wait_for<F>(handle: &ArbiterHandle, mut pred: F)
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = handle.watch();
        tokio::time::timeout(Duration::from_secs(300), async {
            loop {
                if pred(&*rx.borrow_and_update()) {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    async fn stored(memory: &MemoryStore, id: SessionId) -> GameSession {
        memory
            .get(&GameSession::key(&id))
            .await
            .unwrap()
            .unwrap()
            .decode()
            .unwrap()
    }

    fn alice() -> PlayerId {
        PlayerId::new("alice")
    }

    fn bob() -> PlayerId {
        PlayerId::new("bob")
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_commits_event_and_turn_flip() {
        let fx = fixture(GameConfig::default());
        let session = GameSession::new(SessionId::new(), alice(), bob(), true);
        store_session(&fx.memory, &session).await;
        let handle = fx.registry.attach(session.session_id).await.unwrap();

        assert!(matches!(handle.send(&bob(), "hi").await, Err(SessionError::TurnViolation)));
        assert_eq!(fx.memory.count(collections::EVENTS).await, 0);

        let event = handle.send(&alice(), "hi").await.unwrap();
        assert_eq!(event.sender_id, alice());
        assert_eq!(fx.memory.count(collections::EVENTS).await, 1);
        assert_eq!(stored(&fx.memory, session.session_id).await.current_turn, bob());
        assert!(handle.snapshot().view_for(&bob()).your_turn);

        assert!(matches!(handle.send(&alice(), "again").await, Err(SessionError::TurnViolation)));
        handle.send(&bob(), "hello").await.unwrap();
        assert_eq!(stored(&fx.memory, session.session_id).await.current_turn, alice());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_on_send_keeps_turn() {
        let fx = fixture(GameConfig::default());
        let session = GameSession::new(SessionId::new(), alice(), bob(), true);
        store_session(&fx.memory, &session).await;
        let handle = fx.registry.attach(session.session_id).await.unwrap();

        fx.memory.fail_next_commits(1).await;
        assert!(matches!(handle.send(&alice(), "hi").await, Err(SessionError::Store(_))));
        assert!(handle.snapshot().view_for(&alice()).your_turn);
        handle.send(&alice(), "hi").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_moves_to_guessing_without_messages() {
        let fx = fixture(short_clock(3));
        let session = GameSession::new(SessionId::new(), alice(), bob(), true);
        store_session(&fx.memory, &session).await;
        let handle = fx.registry.attach(session.session_id).await.unwrap();

        wait_for(&handle, |s| s.session.stage == Stage::Guessing).await;
        assert_eq!(handle.snapshot().time_left, 0);
        assert_eq!(stored(&fx.memory, session.session_id).await.stage, Stage::Guessing);
        assert_eq!(fx.memory.count(collections::EVENTS).await, 1);
        assert!(matches!(handle.send(&alice(), "late").await, Err(SessionError::InvalidStage { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persona_replies_and_returns_turn() {
        let fx = fixture(GameConfig::default());
        let session = GameSession::new(SessionId::new(), alice(), PlayerId::persona(), true);
        store_session(&fx.memory, &session).await;
        let handle = fx.registry.attach(session.session_id).await.unwrap();

        handle.send(&alice(), "hi").await.unwrap();
        assert!(!handle.snapshot().view_for(&alice()).your_turn);

        let me = alice();
        wait_for(&handle, |s| s.session.current_turn == me).await;
        assert_eq!(fx.service.calls(), 1);
        assert_eq!(fx.memory.count(collections::EVENTS).await, 2);

        let record = stored(&fx.memory, session.session_id).await;
        assert!(record.resolved_as_ai);
        assert_eq!(record.current_turn, alice());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persona_opens_when_it_has_first_turn() {
        let fx = fixture(GameConfig::default());
        let session = GameSession::new(SessionId::new(), alice(), PlayerId::persona(), false);
        store_session(&fx.memory, &session).await;
        let handle = fx.registry.attach(session.session_id).await.unwrap();

        let me = alice();
        wait_for(&handle, |s| s.session.current_turn == me).await;
        assert_eq!(fx.memory.count(collections::EVENTS).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persona_failure_still_flips_turn() {
        let fx = fixture(GameConfig::default());
        fx.service.set_failing(true);
        let session = GameSession::new(SessionId::new(), alice(), PlayerId::persona(), true);
        store_session(&fx.memory, &session).await;
        let handle = fx.registry.attach(session.session_id).await.unwrap();

        handle.send(&alice(), "hi").await.unwrap();
        let me = alice();
        wait_for(&handle, |s| s.session.current_turn == me).await;

        let events = fx.memory.query(&Query::collection(collections::EVENTS)).await.unwrap();
        assert!(events.iter().any(|d| d.field("content") == LAG_FALLBACK));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_persona_reply_is_discarded() {
        let fx = fixture(GameConfig {
            chat_duration: Duration::from_secs(2),
            persona_reply_delay: DelayRange::from_millis(5_000, 5_000),
            ..Default::default()
        });
        let session = GameSession::new(SessionId::new(), alice(), PlayerId::persona(), true);
        store_session(&fx.memory, &session).await;
        let handle = fx.registry.attach(session.session_id).await.unwrap();

        handle.send(&alice(), "hi").await.unwrap();
        wait_for(&handle, |s| s.session.stage == Stage::Guessing).await;
        tokio::time::sleep(Duration::from_secs(20)).await;

        // The human message and the time-up notice only.
        assert_eq!(fx.memory.count(collections::EVENTS).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guess_settles_once() {
        let fx = fixture(short_clock(1));
        let session = GameSession::new(SessionId::new(), alice(), PlayerId::persona(), true);
        store_session(&fx.memory, &session).await;
        let handle = fx.registry.attach(session.session_id).await.unwrap();

        assert!(matches!(handle.guess(&alice(), true).await, Err(SessionError::InvalidStage { .. })));
        wait_for(&handle, |s| s.session.stage == Stage::Guessing).await;

        let settlement = handle.guess(&alice(), true).await.unwrap();
        assert_eq!(settlement.outcome.points_delta, 50);
        assert!(matches!(handle.guess(&alice(), false).await, Err(SessionError::AlreadyGuessed)));
        assert_eq!(fx.ledger.balance(&alice()).await.unwrap(), 50);

        let view = handle.snapshot().view_for(&alice());
        assert_eq!(view.stage, Stage::Result);
        assert_eq!(view.opponent_was_ai, Some(true));

        assert_eq!(fx.registry.cleanup().await, 1);
        assert!(fx.registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_settlement_stays_guessing() {
        let fx = fixture(short_clock(1));
        let session = GameSession::new(SessionId::new(), alice(), bob(), true);
        store_session(&fx.memory, &session).await;
        let handle = fx.registry.attach(session.session_id).await.unwrap();
        wait_for(&handle, |s| s.session.stage == Stage::Guessing).await;

        fx.memory.fail_next_commits(1).await;
        let err = handle.guess(&alice(), false).await.unwrap_err();
        assert!(matches!(err, SessionError::SettlementFailed(_)));
        assert!(err.is_retryable());
        assert_eq!(handle.snapshot().view_for(&alice()).stage, Stage::Guessing);

        let settlement = handle.guess(&alice(), false).await.unwrap();
        assert_eq!(settlement.outcome.points_delta, 50);
        assert_eq!(fx.ledger.balance(&alice()).await.unwrap(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_reuses_live_arbiter() {
        let fx = fixture(GameConfig::default());
        let session = GameSession::new(SessionId::new(), alice(), bob(), true);
        store_session(&fx.memory, &session).await;

        let first = fx.registry.attach(session.session_id).await.unwrap();
        let second = fx.registry.attach(session.session_id).await.unwrap();
        first.send(&alice(), "hi").await.unwrap();
        assert!(second.snapshot().view_for(&bob()).your_turn);
        assert_eq!(fx.registry.len().await, 1);

        assert!(matches!(
            fx.registry.attach(SessionId::new()).await,
            Err(SessionError::SessionNotFound)
        ));
    }
}
