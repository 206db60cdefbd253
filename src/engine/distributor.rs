//! Reward distribution
//!
//! Turns a stored SettlementResult (or a voided round's stakes) into one
//! balance mutation keyed by the round ref. Payout and refund share that key,
//! so a round is credited at most once, either way.

use crate::engine::ledger::{BalanceCredit, BalanceLedger, BalanceMutation, LedgerApply, MutationKind};
use crate::engine::settlement::verify;
use crate::engine::stake_book::StakeBook;
use crate::error::EngineError;
use crate::models::{Amount, RoundRef, SettlementResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionReceipt {
    pub round_ref: RoundRef,
    pub kind: MutationKind,
    pub outcome: LedgerApply,
    pub credit_count: usize,
    pub total_credited: u128,
    pub remainder: Amount,
}

pub struct RewardDistributor {
    ledger: Arc<dyn BalanceLedger>,
    /// Serializes check-then-apply per round.
    guards: Mutex<HashMap<RoundRef, Arc<Mutex<()>>>>,
}

impl RewardDistributor {
    pub fn new(ledger: Arc<dyn BalanceLedger>) -> Self {
        Self {
            ledger,
            guards: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn BalanceLedger> {
        &self.ledger
    }

    /// Credit every payout in `result`, once. Later calls for the same round
    /// change nothing.
    pub fn apply(&self, result: &SettlementResult) -> Result<DistributionReceipt, EngineError> {
        verify(result)?;

        let credits = result
            .payouts
            .iter()
            .map(|(stake_id, amount)| {
                let user_id = result.recipients.get(stake_id).cloned().ok_or_else(|| {
                    EngineError::InvariantViolation {
                        round_ref: result.round_ref,
                        detail: format!("no recipient for stake {}", stake_id),
                    }
                })?;
                Ok(BalanceCredit {
                    user_id,
                    stake_id: stake_id.clone(),
                    amount: *amount,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        let mutation = BalanceMutation {
            idempotency_key: BalanceMutation::idempotency_key_for(&result.round_ref),
            round_ref: result.round_ref,
            kind: MutationKind::Payout,
            credits,
            remainder: result.remainder,
        };
        self.apply_once(mutation)
    }

    /// Return every stake of a voided round to its owner, once.
    pub fn refund(
        &self,
        round_ref: &RoundRef,
        book: &StakeBook,
    ) -> Result<DistributionReceipt, EngineError> {
        let credits = book
            .stakes(round_ref)
            .into_iter()
            .map(|stake| BalanceCredit {
                user_id: stake.user_id,
                stake_id: stake.stake_id,
                amount: stake.amount,
            })
            .collect();

        let mutation = BalanceMutation {
            idempotency_key: BalanceMutation::idempotency_key_for(round_ref),
            round_ref: *round_ref,
            kind: MutationKind::Refund,
            credits,
            remainder: 0,
        };
        self.apply_once(mutation)
    }

    fn apply_once(&self, mutation: BalanceMutation) -> Result<DistributionReceipt, EngineError> {
        let guard = self.guard(&mutation.round_ref);
        let _held = guard.lock();

        let round_ref = mutation.round_ref;
        let receipt = |outcome| DistributionReceipt {
            round_ref,
            kind: mutation.kind,
            outcome,
            credit_count: mutation.credits.len(),
            total_credited: mutation.total_credited(),
            remainder: mutation.remainder,
        };

        match self.ledger.applied_kind(&mutation.idempotency_key)? {
            Some(kind) if kind == mutation.kind => {
                debug!(round = %round_ref, kind = kind.as_str(), "Distribution already applied");
                return Ok(receipt(LedgerApply::AlreadyApplied));
            }
            Some(MutationKind::Payout) => return Err(EngineError::AlreadySettled(round_ref)),
            Some(MutationKind::Refund) => {
                return Err(EngineError::InvariantViolation {
                    round_ref,
                    detail: "payout attempted for a refunded round".to_string(),
                })
            }
            None => {}
        }

        let outcome = self.ledger.apply(&mutation)?;
        if outcome == LedgerApply::Applied {
            info!(
                round = %round_ref,
                kind = mutation.kind.as_str(),
                credits = mutation.credits.len(),
                total_credited = %mutation.total_credited(),
                remainder = mutation.remainder,
                "💰 Balances credited"
            );
        }
        Ok(receipt(outcome))
    }

    fn guard(&self, round_ref: &RoundRef) -> Arc<Mutex<()>> {
        self.guards.lock().entry(*round_ref).or_default().clone()
    }
}
