//! Engine error taxonomy
//!
//! Every engine operation returns `EngineError`. Variants fall into four
//! classes (see [`ErrorKind`]): synchronous validation rejections, state
//! conflicts, unavailable dependencies (retryable on the next scheduler tick),
//! and invariant violations (fatal, round goes to manual review).

use crate::models::{Amount, RoundRef, RoundState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    StateConflict,
    DependencyUnavailable,
    InvariantViolation,
}

/// Specific reason a stake was refused. Returned to the staker verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StakeRejection {
    BelowMinimum { amount: Amount, minimum: Amount },
    RoundClosed { state: RoundState },
    InvalidClip { clip_id: String },
    StakeLimitReached { limit: usize },
    AmountOverflow,
}

impl std::fmt::Display for StakeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BelowMinimum { amount, minimum } => {
                write!(f, "stake {} is below the minimum of {}", amount, minimum)
            }
            Self::RoundClosed { state } => write!(f, "round is closed (state: {})", state),
            Self::InvalidClip { clip_id } => {
                write!(f, "clip {} is not a candidate in this round", clip_id)
            }
            Self::StakeLimitReached { limit } => {
                write!(f, "stake limit of {} per round reached", limit)
            }
            Self::AmountOverflow => write!(f, "stake amount overflows the round pool"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Stake refused; no state change.
    Rejected(StakeRejection),
    NotFound(RoundRef),
    /// A non-terminal round already exists for the category.
    InvalidState {
        round_ref: RoundRef,
        state: RoundState,
    },
    InvalidTransition {
        round_ref: RoundRef,
        from: RoundState,
        to: RoundState,
    },
    /// A settlement result already exists, so the round cannot be voided.
    AlreadySettled(RoundRef),
    /// Settlement requires stakes to be frozen (Locked or Settling).
    RoundNotFrozen {
        round_ref: RoundRef,
        state: RoundState,
    },
    EmptyCandidateSet(RoundRef),
    EngagementSnapshotUnavailable(String),
    DependencyUnavailable {
        dependency: &'static str,
        reason: String,
    },
    InvariantViolation {
        round_ref: RoundRef,
        detail: String,
    },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected(_) => ErrorKind::Validation,
            Self::NotFound(_)
            | Self::InvalidState { .. }
            | Self::InvalidTransition { .. }
            | Self::AlreadySettled(_)
            | Self::RoundNotFrozen { .. }
            | Self::EmptyCandidateSet(_) => ErrorKind::StateConflict,
            Self::EngagementSnapshotUnavailable(_) | Self::DependencyUnavailable { .. } => {
                ErrorKind::DependencyUnavailable
            }
            Self::InvariantViolation { .. } => ErrorKind::InvariantViolation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::DependencyUnavailable
    }

    pub fn storage(err: anyhow::Error) -> Self {
        Self::DependencyUnavailable {
            dependency: "engine_store",
            reason: format!("{:#}", err),
        }
    }
}

impl From<StakeRejection> for EngineError {
    fn from(r: StakeRejection) -> Self {
        Self::Rejected(r)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(r) => write!(f, "Stake rejected: {}", r),
            Self::NotFound(r) => write!(f, "Round {} not found", r),
            Self::InvalidState { round_ref, state } => {
                write!(f, "Round {} is still active (state: {})", round_ref, state)
            }
            Self::InvalidTransition { round_ref, from, to } => {
                write!(f, "Invalid transition for {}: {} -> {}", round_ref, from, to)
            }
            Self::AlreadySettled(r) => write!(f, "Round {} already has a settlement result", r),
            Self::RoundNotFrozen { round_ref, state } => write!(
                f,
                "Round {} cannot be settled while {} (stakes not frozen)",
                round_ref, state
            ),
            Self::EmptyCandidateSet(r) => write!(f, "Round {} has no candidate clips", r),
            Self::EngagementSnapshotUnavailable(msg) => {
                write!(f, "Engagement snapshot unavailable: {}", msg)
            }
            Self::DependencyUnavailable { dependency, reason } => {
                write!(f, "Dependency {} unavailable: {}", dependency, reason)
            }
            Self::InvariantViolation { round_ref, detail } => {
                write!(f, "Invariant violation in {}: {}", round_ref, detail)
            }
        }
    }
}

impl std::error::Error for EngineError {}
