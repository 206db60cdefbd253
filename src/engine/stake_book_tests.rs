//! StakeBook validation and aggregation tests

use crate::engine::test_fixtures::{scenario_candidates, test_config, Harness};
use crate::error::{EngineError, StakeRejection};
use crate::models::{Category, RoundRef, RoundState};
use std::collections::HashSet;

#[test]
fn test_record_appends_in_sequence() {
    let h = Harness::new(test_config());
    let round = h.open(Category::Gaming, scenario_candidates());

    let a = h.book.record(&round.round_ref, "u1", "c1", 10).unwrap();
    let b = h.book.record(&round.round_ref, "u1", "c1", 5).unwrap();
    let c = h.book.record(&round.round_ref, "u2", "c3", 7).unwrap();

    assert_eq!((a.seq, b.seq, c.seq), (0, 1, 2));
    assert_ne!(a.stake_id, b.stake_id);
    assert_eq!(a.round_ref, round.round_ref);

    let stakes = h.book.stakes(&round.round_ref);
    assert_eq!(stakes, vec![a.clone(), b.clone(), c.clone()]);
    assert_eq!(h.book.stakes_for(&round.round_ref, "c1"), vec![a, b]);
    assert!(h.book.stakes_for(&round.round_ref, "c2").is_empty());
}

#[test]
fn test_totals_and_pool_stats() {
    let h = Harness::new(test_config());
    let round = h.open(Category::Gaming, scenario_candidates());
    let r = round.round_ref;

    h.book.record(&r, "u1", "c1", 10).unwrap();
    h.book.record(&r, "u2", "c1", 15).unwrap();
    h.book.record(&r, "u1", "c4", 3).unwrap();

    let totals = h.book.totals_by_clip(&r);
    assert_eq!(totals.get("c1"), Some(&25));
    assert_eq!(totals.get("c4"), Some(&3));
    assert_eq!(totals.len(), 2);

    let stats = h.book.pool_stats(&r);
    assert_eq!(stats.total_staked, 28);
    assert_eq!(stats.stake_count, 3);
    assert_eq!(stats.participants, 2);

    // A round with no stakes reports an empty pool
    let other = h.open(Category::Nature, scenario_candidates());
    assert_eq!(h.book.pool_stats(&other.round_ref).total_staked, 0);
    assert!(h.book.totals_by_clip(&other.round_ref).is_empty());
}

#[test]
fn test_record_rejections_leave_book_unchanged() {
    let mut config = test_config();
    config.min_stake = 5;
    let h = Harness::new(config);
    let round = h.open(Category::Knowledge, scenario_candidates());
    let r = round.round_ref;
    h.book.record(&r, "u1", "c1", 5).unwrap();

    assert_eq!(
        h.book.record(&r, "u1", "c1", 4),
        Err(EngineError::Rejected(StakeRejection::BelowMinimum {
            amount: 4,
            minimum: 5
        }))
    );
    assert_eq!(
        h.book.record(&r, "u1", "not-a-candidate", 50),
        Err(EngineError::Rejected(StakeRejection::InvalidClip {
            clip_id: "not-a-candidate".into()
        }))
    );
    assert_eq!(h.book.len(&r), 1);
}

#[test]
fn test_amount_overflow_rejected() {
    let h = Harness::new(test_config());
    let round = h.open(Category::Knowledge, scenario_candidates());
    let r = round.round_ref;

    h.book.record(&r, "whale", "c1", u64::MAX - 10).unwrap();
    assert_eq!(
        h.book.record(&r, "u2", "c2", 11),
        Err(EngineError::Rejected(StakeRejection::AmountOverflow))
    );
    h.book.record(&r, "u2", "c2", 10).unwrap();
    assert_eq!(h.book.pool_stats(&r).total_staked, u64::MAX);
}

#[test]
fn test_per_user_stake_cap() {
    let mut config = test_config();
    config.max_stakes_per_user = Some(2);
    let h = Harness::new(config);
    let round = h.open(Category::Lifestyle, scenario_candidates());
    let r = round.round_ref;

    h.book.record(&r, "u1", "c1", 1).unwrap();
    h.book.record(&r, "u1", "c2", 1).unwrap();
    assert_eq!(
        h.book.record(&r, "u1", "c3", 1),
        Err(EngineError::Rejected(StakeRejection::StakeLimitReached {
            limit: 2
        }))
    );
    // Other users are unaffected
    h.book.record(&r, "u2", "c3", 1).unwrap();
    assert_eq!(h.book.len(&r), 3);
}

#[test]
fn test_unlimited_stakes_without_cap() {
    let h = Harness::new(test_config());
    let round = h.open(Category::Lifestyle, scenario_candidates());
    for _ in 0..25 {
        h.book.record(&round.round_ref, "u1", "c1", 1).unwrap();
    }
    assert_eq!(h.book.len(&round.round_ref), 25);
    let ids: HashSet<_> = h
        .book
        .stakes(&round.round_ref)
        .into_iter()
        .map(|s| s.stake_id)
        .collect();
    assert_eq!(ids.len(), 25);
}

#[test]
fn test_record_on_locked_round_is_round_closed() {
    let h = Harness::new(test_config());
    let round = h.open(Category::Entertainment, scenario_candidates());
    let r = round.round_ref;
    h.book.record(&r, "u1", "c1", 10).unwrap();

    h.rounds.lock(&r).unwrap();
    assert_eq!(
        h.book.record(&r, "u2", "c1", 10),
        Err(EngineError::Rejected(StakeRejection::RoundClosed {
            state: RoundState::Locked
        }))
    );
    assert_eq!(h.book.len(&r), 1);
}

#[test]
fn test_record_on_unknown_round() {
    let h = Harness::new(test_config());
    let missing = RoundRef::new(Category::Gaming, 3);
    assert_eq!(
        h.book.record(&missing, "u1", "c1", 10),
        Err(EngineError::NotFound(missing))
    );
    assert_eq!(h.book.len(&missing), 0);
}
