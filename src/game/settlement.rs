//! Economy Settlement
//!
//! Applies a guess to the guesser's balance and to the session record in a
//! single store transaction. The stored outcome doubles as the dedup marker,
//! so a retry after a commit that was reported as failed never pays twice.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::game::config::GameConfig;
use crate::game::model::{Balance, GameSession, GuessOutcome, PlayerId, SessionId, Stage};
use crate::store::{encode, run_transaction, SharedStore, StoreError};

/// Settlement errors.
#[derive(Debug, Clone, Error)]
pub enum SettlementError {
    /// The transaction did not commit; nothing was applied.
    #[error("settlement failed: {0}")]
    Failed(#[from] StoreError),

    /// No such session.
    #[error("session not found")]
    SessionNotFound,

    /// The session is not waiting for guesses.
    #[error("session is {0}, not guessing")]
    NotGuessing(Stage),

    /// The guesser is not a human participant.
    #[error("not a participant")]
    NotAParticipant,
}

/// Balance change for one guess.
pub fn points_delta(guessed_ai: bool, actually_ai: bool, reward: i64, penalty: i64) -> i64 {
    if guessed_ai == actually_ai {
        reward
    } else {
        -penalty
    }
}

/// A committed (or replayed) settlement.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    /// The guesser's outcome.
    pub outcome: GuessOutcome,
    /// Balance after the outcome was applied.
    pub new_balance: i64,
    /// The outcome was already stored; nothing was written this time.
    pub replayed: bool,
    /// Session record as committed.
    pub session: GameSession,
}

/// Point balances in the shared store.
#[derive(Clone)]
pub struct Ledger {
    store: SharedStore,
    config: Arc<GameConfig>,
}

impl Ledger {
    /// Create a ledger.
    pub fn new(store: SharedStore, config: Arc<GameConfig>) -> Self {
        Self { store, config }
    }

    /// Current balance; players without a record have the starting balance.
    pub async fn balance(&self, player: &PlayerId) -> Result<i64, StoreError> {
        match self.store.get(&Balance::key(player)).await? {
            Some(doc) => Ok(doc.decode::<Balance>()?.points),
            None => Ok(self.config.starting_balance),
        }
    }

    /// Settle one player's guess.
    #[instrument(skip(self), fields(session = %session_id))]
    pub async fn settle(
        &self,
        session_id: SessionId,
        guesser: &PlayerId,
        guessed_ai: bool,
    ) -> Result<Settlement, SettlementError> {
        let config = self.config.clone();
        let guesser = guesser.clone();

        let settlement = run_transaction(&self.store, self.config.transaction_attempts, move |mut txn| {
            let config = config.clone();
            let guesser = guesser.clone();
            Box::pin(async move {
                let session_key = GameSession::key(&session_id);
                let mut session: GameSession = txn
                    .get(&session_key)
                    .await?
                    .ok_or(SettlementError::SessionNotFound)?
                    .decode()?;

                if !guesser.is_human() || !session.is_participant(&guesser) {
                    return Err(SettlementError::NotAParticipant);
                }

                let balance_key = Balance::key(&guesser);
                let current = match txn.get(&balance_key).await? {
                    Some(doc) => doc.decode::<Balance>()?.points,
                    None => config.starting_balance,
                };

                if let Some(outcome) = session.outcome_for(&guesser).cloned() {
                    debug!("Outcome for {} already stored", guesser);
                    let settlement = Settlement {
                        outcome,
                        new_balance: current,
                        replayed: true,
                        session,
                    };
                    return Ok((txn, settlement));
                }

                if session.stage != Stage::Guessing {
                    return Err(SettlementError::NotGuessing(session.stage));
                }

                let actually_ai = session.resolved_as_ai;
                let outcome = GuessOutcome {
                    session_id,
                    guesser_id: guesser.clone(),
                    guessed_ai,
                    actually_ai,
                    points_delta: points_delta(guessed_ai, actually_ai, config.reward, config.penalty),
                };

                session.outcomes.push(outcome.clone());
                if session.all_humans_guessed() {
                    session.stage = Stage::Result;
                }

                let new_balance = current + outcome.points_delta;
                let balance = Balance {
                    player_id: guesser.clone(),
                    points: new_balance,
                };
                txn.put(balance_key, encode(&balance)?);
                txn.put(session_key, encode(&session)?);

                let settlement = Settlement {
                    outcome,
                    new_balance,
                    replayed: false,
                    session,
                };
                Ok((txn, settlement))
            })
        })
        .await?;

        if !settlement.replayed {
            info!(
                "Settled {}: guessed_ai={} actually_ai={} delta={:+} balance={}",
                settlement.outcome.guesser_id,
                settlement.outcome.guessed_ai,
                settlement.outcome.actually_ai,
                settlement.outcome.points_delta,
                settlement.new_balance
            );
        }
        Ok(settlement)
    }

    /// Add `amount` to a balance atomically. Returns the new balance.
    pub async fn credit(&self, player: &PlayerId, amount: i64) -> Result<i64, StoreError> {
        let starting = self.config.starting_balance;
        let player = player.clone();

        run_transaction(&self.store, self.config.transaction_attempts, move |mut txn| {
            let player = player.clone();
            Box::pin(async move {
                let key = Balance::key(&player);
                let current = match txn.get(&key).await? {
                    Some(doc) => doc.decode::<Balance>()?.points,
                    None => starting,
                };
                let points = current + amount;
                txn.put(key, encode(&Balance { player_id: player, points })?);
                Ok((txn, points))
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Precondition, WriteOp};
    use proptest::prelude::*;

    async fn setup(stage: Stage, opponent: PlayerId) -> (Arc<MemoryStore>, Ledger, GameSession) {
        let memory = Arc::new(MemoryStore::new());
        let store: SharedStore = memory.clone();
        let mut session = GameSession::new(SessionId::new(), PlayerId::new("alice"), opponent, true);
        session.stage = stage;
        store
            .commit(vec![WriteOp::Put {
                key: GameSession::key(&session.session_id),
                data: encode(&session).unwrap(),
                precondition: Precondition::MustNotExist,
            }])
            .await
            .unwrap();
        let ledger = Ledger::new(store, Arc::new(GameConfig::default()));
        (memory, ledger, session)
    }

    #[tokio::test]
    async fn test_correct_guess_pays_reward() {
        let (_, ledger, session) = setup(Stage::Guessing, PlayerId::persona()).await;
        let alice = PlayerId::new("alice");

        let settlement = ledger.settle(session.session_id, &alice, true).await.unwrap();
        assert_eq!(settlement.outcome.points_delta, 50);
        assert_eq!(settlement.new_balance, 50);
        assert!(!settlement.replayed);
        assert_eq!(settlement.session.stage, Stage::Result);
        assert_eq!(ledger.balance(&alice).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_wrong_guess_costs_penalty() {
        let (_, ledger, session) = setup(Stage::Guessing, PlayerId::new("bob")).await;
        let alice = PlayerId::new("alice");

        let settlement = ledger.settle(session.session_id, &alice, true).await.unwrap();
        assert_eq!(settlement.outcome.points_delta, -25);
        assert_eq!(ledger.balance(&alice).await.unwrap(), -25);
        // Bob has not guessed yet.
        assert_eq!(settlement.session.stage, Stage::Guessing);

        let bob = ledger.settle(session.session_id, &PlayerId::new("bob"), false).await.unwrap();
        assert_eq!(bob.outcome.points_delta, 50);
        assert_eq!(bob.session.stage, Stage::Result);
    }

    #[tokio::test]
    async fn test_settle_rejects_wrong_stage_and_strangers() {
        let (_, ledger, session) = setup(Stage::Chatting, PlayerId::persona()).await;

        let err = ledger.settle(session.session_id, &PlayerId::new("alice"), true).await;
        assert!(matches!(err, Err(SettlementError::NotGuessing(Stage::Chatting))));

        let err = ledger.settle(session.session_id, &PlayerId::new("carol"), true).await;
        assert!(matches!(err, Err(SettlementError::NotAParticipant)));

        let err = ledger.settle(session.session_id, &PlayerId::persona(), true).await;
        assert!(matches!(err, Err(SettlementError::NotAParticipant)));

        let err = ledger.settle(SessionId::new(), &PlayerId::new("alice"), true).await;
        assert!(matches!(err, Err(SettlementError::SessionNotFound)));
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_nothing_behind() {
        let (memory, ledger, session) = setup(Stage::Guessing, PlayerId::persona()).await;
        let alice = PlayerId::new("alice");

        memory.fail_next_commits(1).await;
        let err = ledger.settle(session.session_id, &alice, true).await;
        assert!(matches!(err, Err(SettlementError::Failed(StoreError::Unavailable(_)))));
        assert_eq!(ledger.balance(&alice).await.unwrap(), 0);

        let settlement = ledger.settle(session.session_id, &alice, true).await.unwrap();
        assert!(!settlement.replayed);
        assert_eq!(settlement.new_balance, 50);
    }

    #[tokio::test]
    async fn test_retry_after_committed_failure_is_not_double_applied() {
        let (memory, ledger, session) = setup(Stage::Guessing, PlayerId::persona()).await;
        let alice = PlayerId::new("alice");

        memory.fail_after_next_commits(1).await;
        assert!(ledger.settle(session.session_id, &alice, true).await.is_err());

        let retry = ledger.settle(session.session_id, &alice, true).await.unwrap();
        assert!(retry.replayed);
        assert_eq!(retry.outcome.points_delta, 50);
        assert_eq!(retry.new_balance, 50);
        assert_eq!(ledger.balance(&alice).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_concurrent_credits_do_not_lose_updates() {
        let (_, ledger, session) = setup(Stage::Guessing, PlayerId::persona()).await;
        let alice = PlayerId::new("alice");

        let credit = {
            let ledger = ledger.clone();
            let alice = alice.clone();
            tokio::spawn(async move { ledger.credit(&alice, 10).await })
        };
        let settle = ledger.settle(session.session_id, &alice, true);

        let (credited, settled) = tokio::join!(credit, settle);
        credited.unwrap().unwrap();
        settled.unwrap();

        assert_eq!(ledger.balance(&alice).await.unwrap(), 60);
    }

    proptest! {
        #[test]
        fn prop_points_delta(guessed in any::<bool>(), actual in any::<bool>(), reward in 1i64..1000, penalty in 1i64..1000) {
            let delta = points_delta(guessed, actual, reward, penalty);
            if guessed == actual {
                prop_assert_eq!(delta, reward);
            } else {
                prop_assert_eq!(delta, -penalty);
            }
        }
    }
}
