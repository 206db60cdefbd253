//! Settlement engine
//!
//! Ranks a frozen round's candidates by engagement, picks the winner set and
//! splits the pool pro-rata across stakes on winning clips. Results are
//! persisted insert-if-absent, so settling a round again returns the stored
//! result unchanged.
//!
//! Rounding: each payout is `floor(pool * stake / winning_total)` in u128; the
//! truncation residue goes to the largest winning stake (lowest sequence on
//! ties). With no winning stake the whole pool becomes the remainder.

use crate::config::EngineConfig;
use crate::engine::feed::{engagement_order, EngagementSnapshot};
use crate::engine::stake_book::StakeBook;
use crate::error::EngineError;
use crate::models::{Amount, ClipId, RankedClip, Round, RoundRef, RoundState, SettlementResult, Stake};
use crate::store::EngineDb;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

pub struct SettlementEngine {
    max_winners: usize,
    results: RwLock<HashMap<RoundRef, SettlementResult>>,
    db: Option<Arc<EngineDb>>,
}

impl SettlementEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_winners: config.max_winners,
            results: RwLock::new(HashMap::new()),
            db: None,
        }
    }

    pub fn with_store(config: &EngineConfig, db: Arc<EngineDb>) -> Self {
        Self {
            db: Some(db),
            ..Self::new(config)
        }
    }

    pub fn restore(&self) -> Result<usize, EngineError> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let stored = db.load_settlements().map_err(EngineError::storage)?;
        let count = stored.len();
        let mut results = self.results.write();
        for result in stored {
            results.insert(result.round_ref, result);
        }
        Ok(count)
    }

    pub fn result(&self, round_ref: &RoundRef) -> Option<SettlementResult> {
        self.results.read().get(round_ref).cloned()
    }

    /// Settle a frozen round. Returns the stored result when one exists.
    pub fn settle(
        &self,
        round: &Round,
        snapshot: &EngagementSnapshot,
        book: &StakeBook,
    ) -> Result<SettlementResult, EngineError> {
        if let Some(existing) = self.result(&round.round_ref) {
            return Ok(existing);
        }
        if !matches!(round.state, RoundState::Locked | RoundState::Settling) {
            return Err(EngineError::RoundNotFrozen {
                round_ref: round.round_ref,
                state: round.state,
            });
        }
        if round.candidate_clip_ids.is_empty() {
            return Err(EngineError::EmptyCandidateSet(round.round_ref));
        }

        let ranking = rank_candidates(&round.candidate_clip_ids, snapshot);
        let winner_clip_ids: Vec<_> = ranking
            .iter()
            .take(self.max_winners)
            .map(|c| c.clip_id.clone())
            .collect();

        let total_pool: u128 = book
            .totals_by_clip(&round.round_ref)
            .values()
            .map(|a| *a as u128)
            .sum();
        let total_pool = Amount::try_from(total_pool).map_err(|_| EngineError::InvariantViolation {
            round_ref: round.round_ref,
            detail: format!("pool {} exceeds amount range", total_pool),
        })?;

        let mut winning: Vec<Stake> = winner_clip_ids
            .iter()
            .flat_map(|clip| book.stakes_for(&round.round_ref, clip))
            .collect();
        winning.sort_by_key(|s| s.seq);

        let (payouts, remainder) = split_pool(&round.round_ref, total_pool, &winning)?;

        let result = SettlementResult {
            round_ref: round.round_ref,
            ranking,
            winner_clip_ids,
            total_pool,
            winning_stake_ids: winning.iter().map(|s| s.stake_id.clone()).collect(),
            payouts: winning
                .iter()
                .zip(payouts)
                .map(|(s, amount)| (s.stake_id.clone(), amount))
                .collect(),
            recipients: winning
                .iter()
                .map(|s| (s.stake_id.clone(), s.user_id.clone()))
                .collect(),
            remainder,
        };
        verify(&result)?;

        self.persist(result)
    }

    fn persist(&self, result: SettlementResult) -> Result<SettlementResult, EngineError> {
        let mut results = self.results.write();
        if let Some(existing) = results.get(&result.round_ref) {
            return Ok(existing.clone());
        }
        let stored = match &self.db {
            Some(db) => db.insert_settlement(&result).map_err(EngineError::storage)?,
            None => result,
        };
        info!(
            round = %stored.round_ref,
            total_pool = stored.total_pool,
            winners = ?stored.winner_clip_ids,
            winning_stakes = stored.winning_stake_ids.len(),
            remainder = stored.remainder,
            "🏁 Round settled"
        );
        results.insert(stored.round_ref, stored.clone());
        Ok(stored)
    }
}

/// Every candidate with its like count, in final rank order.
pub fn rank_candidates(candidates: &[ClipId], snapshot: &EngagementSnapshot) -> Vec<RankedClip> {
    let mut ranking: Vec<RankedClip> = candidates
        .iter()
        .map(|clip_id| RankedClip {
            clip_id: clip_id.clone(),
            like_count: snapshot.like_count(clip_id),
        })
        .collect();
    ranking.sort_by(engagement_order);
    ranking
}

/// Pro-rata split of `pool` across `winning` (append order). Returns one
/// payout per stake plus the undistributed remainder.
fn split_pool(
    round_ref: &RoundRef,
    pool: Amount,
    winning: &[Stake],
) -> Result<(Vec<Amount>, Amount), EngineError> {
    let winning_total: u128 = winning.iter().map(|s| s.amount as u128).sum();
    if winning_total == 0 {
        return Ok((vec![0; winning.len()], pool));
    }

    let pool = pool as u128;
    let mut shares: Vec<u128> = winning
        .iter()
        .map(|s| pool * s.amount as u128 / winning_total)
        .collect();
    let distributed: u128 = shares.iter().sum();
    let residue = pool.checked_sub(distributed).ok_or_else(|| EngineError::InvariantViolation {
        round_ref: *round_ref,
        detail: format!("shares {} exceed pool {}", distributed, pool),
    })?;

    // Largest stake, earliest sequence on ties.
    if let Some((idx, _)) = winning
        .iter()
        .enumerate()
        .max_by_key(|(_, s)| (s.amount, std::cmp::Reverse(s.seq)))
    {
        shares[idx] += residue;
    }

    let payouts = shares
        .into_iter()
        .map(|share| {
            Amount::try_from(share).map_err(|_| EngineError::InvariantViolation {
                round_ref: *round_ref,
                detail: format!("payout {} exceeds amount range", share),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((payouts, 0))
}

/// Conservation and bounds checks on a computed result.
pub fn verify(result: &SettlementResult) -> Result<(), EngineError> {
    let violation = |detail: String| -> Result<(), EngineError> {
        error!(round = %result.round_ref, detail = %detail, "❌ Settlement invariant violated");
        Err(EngineError::InvariantViolation {
            round_ref: result.round_ref,
            detail,
        })
    };

    if !result.is_conserved() {
        return violation(format!(
            "paid {} + remainder {} != pool {}",
            result.total_paid(),
            result.remainder,
            result.total_pool
        ));
    }
    if result.total_paid() > result.total_pool as u128 {
        return violation(format!(
            "paid {} exceeds pool {}",
            result.total_paid(),
            result.total_pool
        ));
    }
    let orphaned = result
        .payouts
        .keys()
        .filter(|id| !result.recipients.contains_key(*id))
        .count();
    if orphaned > 0 {
        return violation(format!("{} payouts without a recipient", orphaned));
    }
    Ok(())
}
