//! Round lifecycle state machine
//!
//! The RoundManager is the only writer of round state. Each round sits behind
//! its own mutex; StakeBook appends run inside that same mutex (see
//! [`RoundManager::with_round`]), which makes `lock` and `record` mutually
//! exclusive per round without any lock across categories.
//!
//! Transitions are one-way: Open -> Locked -> Settling -> {Settled | Voided}.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{Category, ClipId, Round, RoundRef, RoundState};
use crate::store::EngineDb;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Terminal outcome passed to [`RoundManager::finalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Settled { winner_clip_ids: Vec<ClipId> },
    Voided,
}

impl RoundOutcome {
    fn state(&self) -> RoundState {
        match self {
            RoundOutcome::Settled { .. } => RoundState::Settled,
            RoundOutcome::Voided => RoundState::Voided,
        }
    }
}

pub struct RoundManager {
    round_duration: Duration,
    max_candidates: usize,
    rounds: RwLock<HashMap<RoundRef, Arc<Mutex<Round>>>>,
    /// Latest round number per category. Held while opening so two opens for
    /// one category cannot interleave.
    latest: Mutex<HashMap<Category, u64>>,
    db: Option<Arc<EngineDb>>,
}

impl RoundManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            round_duration: config.round_duration(),
            max_candidates: config.max_candidates,
            rounds: RwLock::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
            db: None,
        }
    }

    /// Durable manager. Call [`RoundManager::restore`] to load existing rounds.
    pub fn with_store(config: &EngineConfig, db: Arc<EngineDb>) -> Self {
        Self {
            db: Some(db),
            ..Self::new(config)
        }
    }

    /// Load every persisted round. Intended for startup, before any traffic.
    pub fn restore(&self) -> Result<usize, EngineError> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let stored = db.load_rounds().map_err(EngineError::storage)?;
        let count = stored.len();

        let mut rounds = self.rounds.write();
        let mut latest = self.latest.lock();
        for round in stored {
            let number = latest.entry(round.round_ref.category).or_insert(0);
            *number = (*number).max(round.round_ref.round_number);
            rounds.insert(round.round_ref, Arc::new(Mutex::new(round)));
        }
        Ok(count)
    }

    /// Open the next round for `category`.
    ///
    /// The candidate list is taken as a ranked list: duplicates are dropped
    /// (first occurrence wins) and it is cut to `max_candidates`. It is never
    /// changed afterwards.
    pub fn open(
        &self,
        category: Category,
        candidate_clip_ids: Vec<ClipId>,
        opened_at: DateTime<Utc>,
    ) -> Result<Round, EngineError> {
        let mut latest = self.latest.lock();
        let last_number = latest.get(&category).copied().unwrap_or(0);

        if last_number > 0 {
            let last_ref = RoundRef::new(category, last_number);
            if let Some(last) = self.slot(&last_ref) {
                let state = last.lock().state;
                if !state.is_terminal() {
                    return Err(EngineError::InvalidState {
                        round_ref: last_ref,
                        state,
                    });
                }
            }
        }

        let mut seen = HashSet::new();
        let candidates: Vec<ClipId> = candidate_clip_ids
            .into_iter()
            .filter(|c| seen.insert(c.clone()))
            .take(self.max_candidates)
            .collect();

        let round = Round {
            round_ref: RoundRef::new(category, last_number + 1),
            state: RoundState::Open,
            opened_at,
            locks_at: opened_at + self.round_duration,
            candidate_clip_ids: candidates,
            winner_clip_ids: Vec::new(),
            review_reason: None,
        };

        if let Some(db) = &self.db {
            db.insert_round(&round).map_err(EngineError::storage)?;
        }
        self.rounds
            .write()
            .insert(round.round_ref, Arc::new(Mutex::new(round.clone())));
        latest.insert(category, round.round_ref.round_number);

        info!(
            category = %category,
            round = %round.round_ref,
            candidates = round.candidate_clip_ids.len(),
            locks_at = %round.locks_at,
            "🟢 Round opened"
        );
        Ok(round)
    }

    /// Open -> Locked. Once this returns, no stake can be recorded for the round.
    pub fn lock(&self, round_ref: &RoundRef) -> Result<Round, EngineError> {
        self.transition(round_ref, |round| match round.state {
            RoundState::Open => {
                round.state = RoundState::Locked;
                Ok(true)
            }
            from => Err(EngineError::InvalidTransition {
                round_ref: round.round_ref,
                from,
                to: RoundState::Locked,
            }),
        })
    }

    /// Locked -> Settling. No-op when already Settling or later.
    pub fn begin_settlement(&self, round_ref: &RoundRef) -> Result<Round, EngineError> {
        self.transition(round_ref, |round| match round.state {
            RoundState::Locked => {
                round.state = RoundState::Settling;
                Ok(true)
            }
            from if from.step() > RoundState::Locked.step() => Ok(false),
            from => Err(EngineError::InvalidTransition {
                round_ref: round.round_ref,
                from,
                to: RoundState::Settling,
            }),
        })
    }

    /// Settling -> Settled | Voided.
    pub fn finalize(
        &self,
        round_ref: &RoundRef,
        outcome: RoundOutcome,
    ) -> Result<Round, EngineError> {
        let to = outcome.state();
        self.transition(round_ref, |round| {
            if round.state != RoundState::Settling {
                return Err(EngineError::InvalidTransition {
                    round_ref: round.round_ref,
                    from: round.state,
                    to,
                });
            }
            round.state = to;
            if let RoundOutcome::Settled { winner_clip_ids } = outcome {
                round.winner_clip_ids = winner_clip_ids;
            }
            Ok(true)
        })
    }

    /// Mark a round for manual review. The round keeps its state.
    pub fn flag_for_review(&self, round_ref: &RoundRef, reason: &str) -> Result<Round, EngineError> {
        let round = self.transition(round_ref, |round| {
            if round.review_reason.as_deref() == Some(reason) {
                return Ok(false);
            }
            round.review_reason = Some(reason.to_string());
            Ok(true)
        })?;
        warn!(round = %round_ref, reason = %reason, "🚩 Round flagged for manual review");
        Ok(round)
    }

    pub fn get(&self, round_ref: &RoundRef) -> Result<Round, EngineError> {
        self.slot(round_ref)
            .map(|slot| slot.lock().clone())
            .ok_or(EngineError::NotFound(*round_ref))
    }

    /// The non-terminal round of a category, if any.
    pub fn active_round(&self, category: Category) -> Option<Round> {
        let number = self.latest.lock().get(&category).copied()?;
        let round = self.get(&RoundRef::new(category, number)).ok()?;
        (!round.state.is_terminal()).then_some(round)
    }

    /// Every round of the category in round-number order.
    pub fn history(&self, category: Category) -> Vec<Round> {
        let slots: Vec<Arc<Mutex<Round>>> = self
            .rounds
            .read()
            .iter()
            .filter(|(r, _)| r.category == category)
            .map(|(_, slot)| slot.clone())
            .collect();
        let mut rounds: Vec<Round> = slots.iter().map(|s| s.lock().clone()).collect();
        rounds.sort_by_key(|r| r.round_ref.round_number);
        rounds
    }

    /// Run `f` against the round while holding its mutex. Transitions for the
    /// round wait until `f` returns, so `f` must not block or call back into
    /// the manager for the same round.
    pub(crate) fn with_round<T>(
        &self,
        round_ref: &RoundRef,
        f: impl FnOnce(&Round) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let slot = self.slot(round_ref).ok_or(EngineError::NotFound(*round_ref))?;
        let round = slot.lock();
        f(&round)
    }

    fn slot(&self, round_ref: &RoundRef) -> Option<Arc<Mutex<Round>>> {
        self.rounds.read().get(round_ref).cloned()
    }

    /// Apply `change` to a copy of the round under its mutex. When the closure
    /// reports a change, the copy is persisted first and then published.
    fn transition(
        &self,
        round_ref: &RoundRef,
        change: impl FnOnce(&mut Round) -> Result<bool, EngineError>,
    ) -> Result<Round, EngineError> {
        let slot = self.slot(round_ref).ok_or(EngineError::NotFound(*round_ref))?;
        let mut guard = slot.lock();
        let mut next = guard.clone();
        if !change(&mut next)? {
            return Ok(next);
        }
        if next.state.step() < guard.state.step() {
            return Err(EngineError::InvalidTransition {
                round_ref: *round_ref,
                from: guard.state,
                to: next.state,
            });
        }

        if let Some(db) = &self.db {
            db.update_round(&next).map_err(EngineError::storage)?;
        }
        if next.state != guard.state {
            info!(
                round = %round_ref,
                from = %guard.state,
                to = %next.state,
                "Round state transition"
            );
        }
        *guard = next.clone();
        Ok(next)
    }
}
