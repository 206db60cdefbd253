//! Round lifecycle and settlement engine
//!
//! Data flow per round:
//!   RoundScheduler -> RoundManager::lock -> SettlementEngine::settle
//!   -> RewardDistributor::apply -> RoundManager::finalize
//!
//! Stakes flow into the StakeBook while the round is open. The
//! [`PredictionMarket`] facade wires the components together for the service
//! binary, the HTTP API and the scheduler.

pub mod distributor;
pub mod feed;
pub mod ledger;
pub mod round_manager;
pub mod scheduler;
pub mod settlement;
pub mod stake_book;

#[cfg(test)]
mod distributor_tests;
#[cfg(test)]
mod stake_book_tests;
#[cfg(test)]
mod test_fixtures;

pub use distributor::{DistributionReceipt, RewardDistributor};
pub use feed::{EngagementFeed, EngagementSnapshot, HttpEngagementFeed, StaticEngagementFeed};
pub use ledger::{BalanceLedger, InMemoryBalanceLedger, LedgerApply, MutationKind, SqliteBalanceLedger};
pub use round_manager::{RoundManager, RoundOutcome};
pub use scheduler::{RoundScheduler, TickReport};
pub use settlement::SettlementEngine;
pub use stake_book::{PoolStats, StakeBook};

use crate::config::EngineConfig;
use crate::engine::ledger::BalanceMutation;
use crate::error::EngineError;
use crate::models::{
    Amount, Category, ClipId, PoolSummary, Round, RoundRef, RoundState, SettlementResult, Stake,
};
use crate::store::EngineDb;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// How `complete_settlement` closed a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    Settled {
        result: SettlementResult,
        receipt: DistributionReceipt,
    },
    Voided {
        receipt: DistributionReceipt,
    },
}

pub struct PredictionMarket {
    config: EngineConfig,
    rounds: Arc<RoundManager>,
    book: Arc<StakeBook>,
    settlement: Arc<SettlementEngine>,
    distributor: Arc<RewardDistributor>,
    /// Serializes settlement completion and administrative void per round.
    closing: Mutex<HashMap<RoundRef, Arc<Mutex<()>>>>,
}

impl PredictionMarket {
    /// Engine with no durable store.
    pub fn new_in_memory(config: EngineConfig) -> Self {
        let rounds = Arc::new(RoundManager::new(&config));
        let book = Arc::new(StakeBook::new(&config, rounds.clone()));
        let settlement = Arc::new(SettlementEngine::new(&config));
        let distributor = Arc::new(RewardDistributor::new(Arc::new(InMemoryBalanceLedger::new())));
        Self {
            config,
            rounds,
            book,
            settlement,
            distributor,
            closing: Mutex::new(HashMap::new()),
        }
    }

    /// Engine backed by the SQLite store, with state restored from it.
    pub fn with_store(config: EngineConfig, db: Arc<EngineDb>) -> Result<Self, EngineError> {
        let rounds = Arc::new(RoundManager::with_store(&config, db.clone()));
        let book = Arc::new(StakeBook::with_store(&config, rounds.clone(), db.clone()));
        let settlement = Arc::new(SettlementEngine::with_store(&config, db.clone()));
        let distributor = Arc::new(RewardDistributor::new(Arc::new(SqliteBalanceLedger::new(db))));

        let restored_rounds = rounds.restore()?;
        let restored_stakes = book.restore()?;
        let restored_results = settlement.restore()?;
        info!(
            rounds = restored_rounds,
            stakes = restored_stakes,
            settlements = restored_results,
            "📂 Engine state restored"
        );

        Ok(Self {
            config,
            rounds,
            book,
            settlement,
            distributor,
            closing: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rounds(&self) -> &Arc<RoundManager> {
        &self.rounds
    }

    pub fn stake_book(&self) -> &Arc<StakeBook> {
        &self.book
    }

    pub fn settlement(&self) -> &Arc<SettlementEngine> {
        &self.settlement
    }

    pub fn distributor(&self) -> &Arc<RewardDistributor> {
        &self.distributor
    }

    pub fn open_round(
        &self,
        category: Category,
        candidate_clip_ids: Vec<ClipId>,
        now: DateTime<Utc>,
    ) -> Result<Round, EngineError> {
        self.rounds.open(category, candidate_clip_ids, now)
    }

    pub fn place_stake(
        &self,
        round_ref: &RoundRef,
        user_id: &str,
        clip_id: &str,
        amount: Amount,
    ) -> Result<Stake, EngineError> {
        self.book.record(round_ref, user_id, clip_id, amount)
    }

    pub fn settlement_result(&self, round_ref: &RoundRef) -> Option<SettlementResult> {
        self.settlement.result(round_ref)
    }

    pub fn balance_of(&self, user_id: &str) -> Result<Amount, EngineError> {
        self.distributor.ledger().balance_of(user_id)
    }

    pub fn remainder_total(&self) -> Result<Amount, EngineError> {
        self.distributor.ledger().remainder_total()
    }

    pub fn pool_summary(
        &self,
        round_ref: &RoundRef,
        now: DateTime<Utc>,
    ) -> Result<PoolSummary, EngineError> {
        let round = self.rounds.get(round_ref)?;
        Ok(self.summarize(&round, now))
    }

    /// Summaries of every non-terminal round, ordered by category.
    pub fn active_pools(&self, now: DateTime<Utc>) -> Vec<PoolSummary> {
        Category::ALL
            .into_iter()
            .filter_map(|category| self.rounds.active_round(category))
            .map(|round| self.summarize(&round, now))
            .collect()
    }

    fn summarize(&self, round: &Round, now: DateTime<Utc>) -> PoolSummary {
        let stats = self.book.pool_stats(&round.round_ref);
        PoolSummary {
            round_ref: round.round_ref,
            pool_id: round.round_ref.to_string(),
            category: round.round_ref.category,
            state: round.state,
            total_staked: stats.total_staked,
            participants: stats.participants,
            stake_count: stats.stake_count,
            candidate_count: round.candidate_clip_ids.len(),
            time_left_secs: (round.locks_at - now).num_seconds().max(0),
        }
    }

    /// Move a round forward to Settling from wherever it is (Open or Locked).
    pub fn advance_to_settling(&self, round_ref: &RoundRef) -> Result<Round, EngineError> {
        let round = self.rounds.get(round_ref)?;
        if round.state == RoundState::Open {
            self.rounds.lock(round_ref)?;
        }
        self.rounds.begin_settlement(round_ref)
    }

    /// Settle, distribute and finalize a frozen round.
    ///
    /// Safe to call again after any partial failure: settlement returns the
    /// stored result and distribution is keyed by round. A round whose
    /// stakes were already refunded is finished as Voided. An invariant
    /// violation flags the round for review and leaves it in Settling.
    pub fn complete_settlement(
        &self,
        round_ref: &RoundRef,
        snapshot: &EngagementSnapshot,
    ) -> Result<SettlementOutcome, EngineError> {
        let guard = self.closing_guard(round_ref);
        let _held = guard.lock();

        let round = self.rounds.get(round_ref)?;
        if let Some(reason) = &round.review_reason {
            return Err(EngineError::InvariantViolation {
                round_ref: *round_ref,
                detail: format!("round under manual review: {}", reason),
            });
        }
        match round.state {
            RoundState::Open => {
                return Err(EngineError::RoundNotFrozen {
                    round_ref: *round_ref,
                    state: round.state,
                })
            }
            RoundState::Voided => {
                let receipt = self.distributor.refund(round_ref, &self.book)?;
                return Ok(SettlementOutcome::Voided { receipt });
            }
            RoundState::Locked | RoundState::Settling | RoundState::Settled => {}
        }

        let round = self.rounds.begin_settlement(round_ref)?;
        if self.applied_kind(round_ref)? == Some(MutationKind::Refund) {
            warn!(round = %round_ref, "Stakes already refunded, finishing void");
            return self.finish_void(round_ref).map(|receipt| SettlementOutcome::Voided { receipt });
        }

        let result = match self.settlement.settle(&round, snapshot, &self.book) {
            Ok(result) => result,
            Err(EngineError::EmptyCandidateSet(_)) => {
                warn!(round = %round_ref, "Round has no candidates, voiding");
                return self.finish_void(round_ref).map(|receipt| SettlementOutcome::Voided { receipt });
            }
            Err(e) => return Err(self.escalate(round_ref, e)),
        };

        let receipt = self
            .distributor
            .apply(&result)
            .map_err(|e| self.escalate(round_ref, e))?;
        if round.state == RoundState::Settling {
            self.rounds.finalize(
                round_ref,
                RoundOutcome::Settled {
                    winner_clip_ids: result.winner_clip_ids.clone(),
                },
            )?;
        }
        Ok(SettlementOutcome::Settled { result, receipt })
    }

    /// Administrative void: walk the round forward to Voided and refund
    /// every stake.
    pub fn void_round(&self, round_ref: &RoundRef) -> Result<DistributionReceipt, EngineError> {
        let guard = self.closing_guard(round_ref);
        let _held = guard.lock();

        let round = self.rounds.get(round_ref)?;
        if self.settlement.result(round_ref).is_some() {
            return Err(EngineError::AlreadySettled(*round_ref));
        }
        if round.state.is_terminal() {
            return Err(EngineError::InvalidTransition {
                round_ref: *round_ref,
                from: round.state,
                to: RoundState::Voided,
            });
        }

        self.advance_to_settling(round_ref)?;
        let receipt = self.finish_void(round_ref)?;
        warn!(
            round = %round_ref,
            refunded = receipt.credit_count,
            "⛔ Round voided by administrator"
        );
        Ok(receipt)
    }

    /// Refund (once) and finalize a Settling round as Voided.
    fn finish_void(&self, round_ref: &RoundRef) -> Result<DistributionReceipt, EngineError> {
        let receipt = self.distributor.refund(round_ref, &self.book)?;
        self.rounds.finalize(round_ref, RoundOutcome::Voided)?;
        Ok(receipt)
    }

    fn applied_kind(&self, round_ref: &RoundRef) -> Result<Option<MutationKind>, EngineError> {
        self.distributor
            .ledger()
            .applied_kind(&BalanceMutation::idempotency_key_for(round_ref))
    }

    fn closing_guard(&self, round_ref: &RoundRef) -> Arc<Mutex<()>> {
        self.closing.lock().entry(*round_ref).or_default().clone()
    }

    /// Flag invariant violations for manual review; pass everything through.
    fn escalate(&self, round_ref: &RoundRef, err: EngineError) -> EngineError {
        if let EngineError::InvariantViolation { detail, .. } = &err {
            if let Err(flag_err) = self.rounds.flag_for_review(round_ref, detail) {
                warn!(round = %round_ref, error = %flag_err, "Failed to flag round for review");
            }
        }
        err
    }
}
