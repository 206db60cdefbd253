//! Core data model for prediction rounds
//!
//! Rounds, stakes and settlement results are plain serde types. Ownership and
//! mutation rules live in the engine components; nothing here enforces state
//! transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// FIXED-POINT AMOUNT
// =============================================================================

/// Token amount in the smallest settlement unit (9 decimals, like lamports).
/// All settlement arithmetic is integer; floats only appear at the API edge.
pub type Amount = u64;

/// Conversion factor: 1 token = 1_000_000_000 units
pub const AMOUNT_SCALE: u64 = 1_000_000_000;

/// Convert a token value to fixed-point units. Negative and non-finite
/// values yield `None`.
#[inline]
pub fn to_amount(value: f64) -> Option<Amount> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let units = (value * AMOUNT_SCALE as f64).round();
    if units > u64::MAX as f64 {
        return None;
    }
    Some(units as Amount)
}

/// Convert fixed-point units to a token value for display.
#[inline]
pub fn from_amount(amount: Amount) -> f64 {
    amount as f64 / AMOUNT_SCALE as f64
}

pub type ClipId = String;
pub type UserId = String;

// =============================================================================
// CATEGORY
// =============================================================================

/// Fixed set of feed categories. Each category runs an independent round
/// timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Entertainment,
    Gaming,
    Knowledge,
    Lifestyle,
    Nature,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Entertainment,
        Category::Gaming,
        Category::Knowledge,
        Category::Lifestyle,
        Category::Nature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Entertainment => "entertainment",
            Category::Gaming => "gaming",
            Category::Knowledge => "knowledge",
            Category::Lifestyle => "lifestyle",
            Category::Nature => "nature",
        }
    }

    /// Short prefix used in pool ids (`ent_round46`).
    pub fn pool_prefix(&self) -> &'static str {
        match self {
            Category::Entertainment => "ent",
            Category::Gaming => "game",
            Category::Knowledge => "know",
            Category::Lifestyle => "life",
            Category::Nature => "nat",
        }
    }

    /// Accepts either the slug or the pool prefix, case-insensitive.
    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s || c.pool_prefix() == s)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ROUND
// =============================================================================

/// Identifies one round: category plus its per-category round number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoundRef {
    pub category: Category,
    pub round_number: u64,
}

impl RoundRef {
    pub fn new(category: Category, round_number: u64) -> Self {
        Self {
            category,
            round_number,
        }
    }
}

impl fmt::Display for RoundRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_round{}", self.category.pool_prefix(), self.round_number)
    }
}

impl FromStr for RoundRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, number) = s
            .split_once("_round")
            .ok_or_else(|| format!("malformed round ref: {}", s))?;
        let category =
            Category::from_str(prefix).ok_or_else(|| format!("unknown category: {}", prefix))?;
        let round_number = number
            .parse::<u64>()
            .map_err(|e| format!("invalid round number in {}: {}", s, e))?;
        Ok(RoundRef::new(category, round_number))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    Open,
    Locked,
    Settling,
    Settled,
    Voided,
}

impl RoundState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundState::Open => "open",
            RoundState::Locked => "locked",
            RoundState::Settling => "settling",
            RoundState::Settled => "settled",
            RoundState::Voided => "voided",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(RoundState::Open),
            "locked" => Some(RoundState::Locked),
            "settling" => Some(RoundState::Settling),
            "settled" => Some(RoundState::Settled),
            "voided" => Some(RoundState::Voided),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundState::Settled | RoundState::Voided)
    }

    /// Position in the one-way lifecycle. Both terminal states share the
    /// last step.
    pub fn step(&self) -> u8 {
        match self {
            RoundState::Open => 0,
            RoundState::Locked => 1,
            RoundState::Settling => 2,
            RoundState::Settled | RoundState::Voided => 3,
        }
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed competition cycle for a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub round_ref: RoundRef,
    pub state: RoundState,
    pub opened_at: DateTime<Utc>,
    pub locks_at: DateTime<Utc>,
    /// Fixed at open; engagement changes never alter this set.
    pub candidate_clip_ids: Vec<ClipId>,
    /// Empty until the round is finalized as settled.
    pub winner_clip_ids: Vec<ClipId>,
    /// Set when settlement hit an invariant violation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_reason: Option<String>,
}

impl Round {
    pub fn is_candidate(&self, clip_id: &str) -> bool {
        self.candidate_clip_ids.iter().any(|c| c == clip_id)
    }

    pub fn lock_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.locks_at
    }
}

// =============================================================================
// STAKE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StakeId(pub String);

impl StakeId {
    pub fn generate() -> Self {
        StakeId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable stake record. Only ever appended to the StakeBook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stake {
    pub stake_id: StakeId,
    pub round_ref: RoundRef,
    /// Append position within the round, starting at 0.
    pub seq: u64,
    pub user_id: UserId,
    pub clip_id: ClipId,
    pub amount: Amount,
    pub placed_at: DateTime<Utc>,
}

// =============================================================================
// SETTLEMENT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedClip {
    pub clip_id: ClipId,
    pub like_count: u64,
}

/// Immutable outcome of settling one round.
///
/// Invariant: `payouts.values().sum() + remainder == total_pool`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementResult {
    pub round_ref: RoundRef,
    /// Every candidate in final rank order.
    pub ranking: Vec<RankedClip>,
    pub winner_clip_ids: Vec<ClipId>,
    pub total_pool: Amount,
    /// Ordered by stake sequence.
    pub winning_stake_ids: Vec<StakeId>,
    pub payouts: BTreeMap<StakeId, Amount>,
    /// Owner of every paid stake, so distribution never re-reads the book.
    pub recipients: BTreeMap<StakeId, UserId>,
    /// Undistributed value (the whole pool when nobody backed a winner).
    pub remainder: Amount,
}

impl SettlementResult {
    pub fn total_paid(&self) -> u128 {
        self.payouts.values().map(|a| *a as u128).sum()
    }

    pub fn is_conserved(&self) -> bool {
        self.total_paid() + self.remainder as u128 == self.total_pool as u128
    }
}

/// Pool overview shown on the earn page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSummary {
    pub round_ref: RoundRef,
    pub pool_id: String,
    pub category: Category,
    pub state: RoundState,
    pub total_staked: Amount,
    pub participants: usize,
    pub stake_count: usize,
    pub candidate_count: usize,
    pub time_left_secs: i64,
}
