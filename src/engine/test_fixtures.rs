//! Shared fixtures for engine tests

use crate::config::EngineConfig;
use crate::engine::feed::EngagementSnapshot;
use crate::engine::ledger::InMemoryBalanceLedger;
use crate::engine::{RewardDistributor, RoundManager, SettlementEngine, StakeBook};
use crate::models::{Category, ClipId, Round};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

/// Ten candidates, best first. c2 and c3 tie on likes.
pub const SCENARIO_LIKES: [(&str, u64); 10] = [
    ("c1", 100),
    ("c2", 90),
    ("c3", 90),
    ("c4", 50),
    ("c5", 40),
    ("c6", 30),
    ("c7", 20),
    ("c8", 10),
    ("c9", 5),
    ("c10", 1),
];

pub fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// Small amounts so hand-computed scenarios stay readable.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        min_stake: 1,
        round_duration_secs: 3_600,
        ..EngineConfig::default()
    }
}

pub fn scenario_candidates() -> Vec<ClipId> {
    SCENARIO_LIKES.iter().map(|(c, _)| c.to_string()).collect()
}

pub fn snapshot_of(likes: &[(&str, u64)]) -> EngagementSnapshot {
    EngagementSnapshot::new(
        likes.iter().map(|(c, n)| (c.to_string(), *n)).collect(),
        t0(),
    )
}

pub fn scenario_snapshot() -> EngagementSnapshot {
    snapshot_of(&SCENARIO_LIKES)
}

/// The engine components wired by hand, without the facade.
pub struct Harness {
    pub rounds: Arc<RoundManager>,
    pub book: StakeBook,
    pub settlement: SettlementEngine,
    pub ledger: Arc<InMemoryBalanceLedger>,
    pub distributor: RewardDistributor,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        let rounds = Arc::new(RoundManager::new(&config));
        let book = StakeBook::new(&config, rounds.clone());
        let settlement = SettlementEngine::new(&config);
        let ledger = Arc::new(InMemoryBalanceLedger::new());
        let distributor = RewardDistributor::new(ledger.clone());
        Self {
            rounds,
            book,
            settlement,
            ledger,
            distributor,
        }
    }

    pub fn open(&self, category: Category, candidates: Vec<ClipId>) -> Round {
        self.rounds.open(category, candidates, t0()).unwrap()
    }

    /// Open -> Locked -> Settling, returning the frozen round.
    pub fn freeze(&self, round: &Round) -> Round {
        self.rounds.lock(&round.round_ref).unwrap();
        self.rounds.begin_settlement(&round.round_ref).unwrap()
    }
}
