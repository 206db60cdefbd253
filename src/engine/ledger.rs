//! Balance ledger collaborator
//!
//! The RewardDistributor writes user credits through this seam. Every mutation
//! carries an idempotency key (the round ref) and the ledger itself refuses a
//! key it has already applied, so a duplicate never changes a balance even if
//! the distributor's own check is bypassed.

use crate::error::EngineError;
use crate::models::{Amount, RoundRef, StakeId, UserId};
use crate::store::{EngineDb, StorageRangeError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Payout,
    Refund,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Payout => "payout",
            MutationKind::Refund => "refund",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "payout" => Some(MutationKind::Payout),
            "refund" => Some(MutationKind::Refund),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceCredit {
    pub user_id: UserId,
    pub stake_id: StakeId,
    pub amount: Amount,
}

/// One atomic balance change for a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceMutation {
    pub idempotency_key: String,
    pub round_ref: RoundRef,
    pub kind: MutationKind,
    pub credits: Vec<BalanceCredit>,
    /// Credited to the remainder bucket, never to a user.
    pub remainder: Amount,
}

impl BalanceMutation {
    pub fn idempotency_key_for(round_ref: &RoundRef) -> String {
        round_ref.to_string()
    }

    pub fn total_credited(&self) -> u128 {
        self.credits.iter().map(|c| c.amount as u128).sum()
    }

    pub fn credits_by_user(&self) -> BTreeMap<UserId, u128> {
        let mut by_user: BTreeMap<UserId, u128> = BTreeMap::new();
        for credit in &self.credits {
            *by_user.entry(credit.user_id.clone()).or_insert(0) += credit.amount as u128;
        }
        by_user
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerApply {
    Applied,
    /// The key was already applied; nothing changed.
    AlreadyApplied,
}

pub trait BalanceLedger: Send + Sync {
    /// Apply the mutation unless its key was already applied.
    fn apply(&self, mutation: &BalanceMutation) -> Result<LedgerApply, EngineError>;

    /// Kind of the mutation applied under `key`, if any.
    fn applied_kind(&self, key: &str) -> Result<Option<MutationKind>, EngineError>;

    fn balance_of(&self, user_id: &str) -> Result<Amount, EngineError>;

    fn remainder_total(&self) -> Result<Amount, EngineError>;
}

// =============================================================================
// IN-MEMORY LEDGER
// =============================================================================

#[derive(Debug, Default)]
struct MemoryLedgerState {
    balances: HashMap<UserId, Amount>,
    applied: HashMap<String, MutationKind>,
    remainder: Amount,
}

/// Process-local ledger for tests and runs without a store.
#[derive(Debug, Default)]
pub struct InMemoryBalanceLedger {
    state: Mutex<MemoryLedgerState>,
}

impl InMemoryBalanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balances(&self) -> BTreeMap<UserId, Amount> {
        self.state
            .lock()
            .balances
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

impl BalanceLedger for InMemoryBalanceLedger {
    fn apply(&self, mutation: &BalanceMutation) -> Result<LedgerApply, EngineError> {
        let mut state = self.state.lock();
        if state.applied.contains_key(&mutation.idempotency_key) {
            return Ok(LedgerApply::AlreadyApplied);
        }

        // Compute every new balance before writing any of them.
        let overflow = || EngineError::InvariantViolation {
            round_ref: mutation.round_ref,
            detail: "balance overflow".to_string(),
        };
        let mut next: Vec<(UserId, Amount)> = Vec::new();
        for (user, credit) in mutation.credits_by_user() {
            let current = state.balances.get(&user).copied().unwrap_or(0) as u128;
            let updated = u64::try_from(current + credit).map_err(|_| overflow())?;
            next.push((user, updated));
        }
        let remainder = state
            .remainder
            .checked_add(mutation.remainder)
            .ok_or_else(overflow)?;

        for (user, balance) in next {
            state.balances.insert(user, balance);
        }
        state.remainder = remainder;
        state
            .applied
            .insert(mutation.idempotency_key.clone(), mutation.kind);
        Ok(LedgerApply::Applied)
    }

    fn applied_kind(&self, key: &str) -> Result<Option<MutationKind>, EngineError> {
        Ok(self.state.lock().applied.get(key).copied())
    }

    fn balance_of(&self, user_id: &str) -> Result<Amount, EngineError> {
        Ok(self.state.lock().balances.get(user_id).copied().unwrap_or(0))
    }

    fn remainder_total(&self) -> Result<Amount, EngineError> {
        Ok(self.state.lock().remainder)
    }
}

// =============================================================================
// SQLITE LEDGER
// =============================================================================

/// Durable ledger backed by the engine store.
#[derive(Clone)]
pub struct SqliteBalanceLedger {
    db: Arc<EngineDb>,
}

impl SqliteBalanceLedger {
    pub fn new(db: Arc<EngineDb>) -> Self {
        Self { db }
    }
}

fn ledger_unavailable(err: anyhow::Error) -> EngineError {
    EngineError::DependencyUnavailable {
        dependency: "balance_ledger",
        reason: format!("{:#}", err),
    }
}

impl BalanceLedger for SqliteBalanceLedger {
    fn apply(&self, mutation: &BalanceMutation) -> Result<LedgerApply, EngineError> {
        let applied = self.db.apply_balance_mutation(mutation).map_err(|err| {
            match err.downcast_ref::<StorageRangeError>() {
                Some(range) => EngineError::InvariantViolation {
                    round_ref: mutation.round_ref,
                    detail: range.to_string(),
                },
                None => ledger_unavailable(err),
            }
        })?;
        Ok(if applied {
            LedgerApply::Applied
        } else {
            LedgerApply::AlreadyApplied
        })
    }

    fn applied_kind(&self, key: &str) -> Result<Option<MutationKind>, EngineError> {
        self.db.mutation_kind(key).map_err(ledger_unavailable)
    }

    fn balance_of(&self, user_id: &str) -> Result<Amount, EngineError> {
        self.db.balance_of(user_id).map_err(ledger_unavailable)
    }

    fn remainder_total(&self) -> Result<Amount, EngineError> {
        self.db.remainder_total().map_err(ledger_unavailable)
    }
}
