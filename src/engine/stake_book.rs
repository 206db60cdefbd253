//! Append-only stake ledger
//!
//! One ledger per round, created lazily on first stake. Appends for a round
//! run under that round's RoundManager mutex, so a stake is either recorded
//! before `lock` or rejected after it. Different rounds never share a lock.

use crate::config::EngineConfig;
use crate::engine::round_manager::RoundManager;
use crate::error::{EngineError, StakeRejection};
use crate::models::{Amount, ClipId, RoundRef, RoundState, Stake, StakeId, UserId};
use crate::store::{EngineDb, MAX_STORED_AMOUNT};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Aggregate view of one round's pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_staked: Amount,
    pub stake_count: usize,
    /// Distinct users with at least one stake
    pub participants: usize,
}

#[derive(Debug, Default)]
struct RoundLedger {
    stakes: Vec<Stake>,
    total: Amount,
    per_user: HashMap<UserId, usize>,
}

impl RoundLedger {
    fn push(&mut self, stake: Stake) {
        self.total = self.total.saturating_add(stake.amount);
        *self.per_user.entry(stake.user_id.clone()).or_insert(0) += 1;
        self.stakes.push(stake);
    }
}

pub struct StakeBook {
    rounds: Arc<RoundManager>,
    min_stake: Amount,
    max_stakes_per_user: Option<usize>,
    /// Ceiling for a round's pool; the store's range when one is attached.
    max_pool: Amount,
    ledgers: RwLock<HashMap<RoundRef, Arc<RwLock<RoundLedger>>>>,
    db: Option<Arc<EngineDb>>,
}

impl StakeBook {
    pub fn new(config: &EngineConfig, rounds: Arc<RoundManager>) -> Self {
        Self {
            rounds,
            min_stake: config.min_stake,
            max_stakes_per_user: config.max_stakes_per_user,
            max_pool: Amount::MAX,
            ledgers: RwLock::new(HashMap::new()),
            db: None,
        }
    }

    pub fn with_store(config: &EngineConfig, rounds: Arc<RoundManager>, db: Arc<EngineDb>) -> Self {
        Self {
            max_pool: MAX_STORED_AMOUNT,
            db: Some(db),
            ..Self::new(config, rounds)
        }
    }

    /// Load persisted stakes. Stakes arrive ordered by round and sequence.
    pub fn restore(&self) -> Result<usize, EngineError> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let stakes = db.load_stakes().map_err(EngineError::storage)?;
        let count = stakes.len();
        for stake in stakes {
            self.ledger(&stake.round_ref).write().push(stake);
        }
        Ok(count)
    }

    /// Validate and append a stake.
    ///
    /// Checks, in order: round is Open, amount meets the minimum, clip is a
    /// candidate, per-user cap, pool overflow. Any failure leaves the book
    /// unchanged.
    pub fn record(
        &self,
        round_ref: &RoundRef,
        user_id: &str,
        clip_id: &str,
        amount: Amount,
    ) -> Result<Stake, EngineError> {
        let result = self.rounds.with_round(round_ref, |round| {
            if round.state != RoundState::Open {
                return Err(StakeRejection::RoundClosed { state: round.state }.into());
            }
            if amount < self.min_stake {
                return Err(StakeRejection::BelowMinimum {
                    amount,
                    minimum: self.min_stake,
                }
                .into());
            }
            if !round.is_candidate(clip_id) {
                return Err(StakeRejection::InvalidClip {
                    clip_id: clip_id.to_string(),
                }
                .into());
            }

            let ledger = self.ledger(round_ref);
            let mut ledger = ledger.write();
            if let Some(limit) = self.max_stakes_per_user {
                if ledger.per_user.get(user_id).copied().unwrap_or(0) >= limit {
                    return Err(StakeRejection::StakeLimitReached { limit }.into());
                }
            }
            let fits = ledger
                .total
                .checked_add(amount)
                .map_or(false, |total| total <= self.max_pool);
            if !fits {
                return Err(StakeRejection::AmountOverflow.into());
            }

            let stake = Stake {
                stake_id: StakeId::generate(),
                round_ref: *round_ref,
                seq: ledger.stakes.len() as u64,
                user_id: user_id.to_string(),
                clip_id: clip_id.to_string(),
                amount,
                placed_at: Utc::now(),
            };
            if let Some(db) = &self.db {
                db.insert_stake(&stake).map_err(EngineError::storage)?;
            }
            ledger.push(stake.clone());
            Ok(stake)
        });

        match &result {
            Ok(stake) => info!(
                round = %round_ref,
                stake_id = %stake.stake_id,
                user_id = %user_id,
                clip_id = %clip_id,
                amount = amount,
                "✅ Stake recorded"
            ),
            Err(e) => debug!(
                round = %round_ref,
                user_id = %user_id,
                clip_id = %clip_id,
                amount = amount,
                error = %e,
                "Stake rejected"
            ),
        }
        result
    }

    /// Summed stake amount per clip. Sizes payouts; never used for ranking.
    pub fn totals_by_clip(&self, round_ref: &RoundRef) -> BTreeMap<ClipId, Amount> {
        let mut totals: BTreeMap<ClipId, Amount> = BTreeMap::new();
        if let Some(ledger) = self.existing(round_ref) {
            for stake in &ledger.read().stakes {
                // Cannot overflow: the round total is bounded at record time.
                let entry = totals.entry(stake.clip_id.clone()).or_insert(0);
                *entry = entry.saturating_add(stake.amount);
            }
        }
        totals
    }

    /// Stakes on one clip in append order.
    pub fn stakes_for(&self, round_ref: &RoundRef, clip_id: &str) -> Vec<Stake> {
        self.existing(round_ref)
            .map(|ledger| {
                ledger
                    .read()
                    .stakes
                    .iter()
                    .filter(|s| s.clip_id == clip_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every stake of the round in append order.
    pub fn stakes(&self, round_ref: &RoundRef) -> Vec<Stake> {
        self.existing(round_ref)
            .map(|ledger| ledger.read().stakes.clone())
            .unwrap_or_default()
    }

    pub fn len(&self, round_ref: &RoundRef) -> usize {
        self.existing(round_ref)
            .map(|ledger| ledger.read().stakes.len())
            .unwrap_or(0)
    }

    pub fn pool_stats(&self, round_ref: &RoundRef) -> PoolStats {
        self.existing(round_ref)
            .map(|ledger| {
                let ledger = ledger.read();
                PoolStats {
                    total_staked: ledger.total,
                    stake_count: ledger.stakes.len(),
                    participants: ledger.per_user.len(),
                }
            })
            .unwrap_or_default()
    }

    fn existing(&self, round_ref: &RoundRef) -> Option<Arc<RwLock<RoundLedger>>> {
        self.ledgers.read().get(round_ref).cloned()
    }

    fn ledger(&self, round_ref: &RoundRef) -> Arc<RwLock<RoundLedger>> {
        if let Some(ledger) = self.existing(round_ref) {
            return ledger;
        }
        self.ledgers
            .write()
            .entry(*round_ref)
            .or_default()
            .clone()
    }
}
