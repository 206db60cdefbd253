//! RewardDistributor tests: exactly-once credits, refunds, and the guard
//! between the payout and refund paths.

use crate::engine::ledger::{BalanceLedger, LedgerApply, MutationKind};
use crate::engine::test_fixtures::{scenario_candidates, scenario_snapshot, test_config, Harness};
use crate::error::EngineError;
use crate::models::{Category, SettlementResult};
use std::sync::Arc;
use std::thread;

fn settled_scenario(h: &Harness) -> SettlementResult {
    let round = h.open(Category::Entertainment, scenario_candidates());
    h.book.record(&round.round_ref, "U1", "c1", 10).unwrap();
    h.book.record(&round.round_ref, "U2", "c3", 10).unwrap();
    h.book.record(&round.round_ref, "U3", "c9", 5).unwrap();
    let frozen = h.freeze(&round);
    h.settlement.settle(&frozen, &scenario_snapshot(), &h.book).unwrap()
}

#[test]
fn test_apply_credits_winners_once() {
    let h = Harness::new(test_config());
    let result = settled_scenario(&h);

    let first = h.distributor.apply(&result).unwrap();
    assert_eq!(first.outcome, LedgerApply::Applied);
    assert_eq!(first.kind, MutationKind::Payout);
    assert_eq!(first.credit_count, 2);
    assert_eq!(first.total_credited, 25);

    let balances_after_first = h.ledger.balances();
    let second = h.distributor.apply(&result).unwrap();
    assert_eq!(second.outcome, LedgerApply::AlreadyApplied);
    assert_eq!(h.ledger.balances(), balances_after_first);

    // pool 25 over winning 20: 12 and 12, residue 1 to the earlier stake
    assert_eq!(h.ledger.balance_of("U1").unwrap(), 13);
    assert_eq!(h.ledger.balance_of("U2").unwrap(), 12);
    assert_eq!(h.ledger.balance_of("U3").unwrap(), 0);
    assert_eq!(h.ledger.remainder_total().unwrap(), 0);
}

#[test]
fn test_concurrent_apply_credits_once() {
    let h = Arc::new(Harness::new(test_config()));
    let result = Arc::new(settled_scenario(&h));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let h = h.clone();
            let result = result.clone();
            thread::spawn(move || h.distributor.apply(&result).unwrap().outcome)
        })
        .collect();
    let outcomes: Vec<LedgerApply> = handles.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(
        outcomes.iter().filter(|o| **o == LedgerApply::Applied).count(),
        1
    );
    assert_eq!(h.ledger.balance_of("U1").unwrap(), 13);
    assert_eq!(h.ledger.balance_of("U2").unwrap(), 12);
}

#[test]
fn test_refund_returns_exact_stakes() {
    let h = Harness::new(test_config());
    let round = h.open(Category::Gaming, scenario_candidates());
    h.book.record(&round.round_ref, "U1", "c1", 10).unwrap();
    h.book.record(&round.round_ref, "U1", "c2", 4).unwrap();
    h.book.record(&round.round_ref, "U2", "c9", 7).unwrap();
    h.freeze(&round);

    let receipt = h.distributor.refund(&round.round_ref, &h.book).unwrap();
    assert_eq!(receipt.kind, MutationKind::Refund);
    assert_eq!(receipt.total_credited, 21);
    assert_eq!(
        h.distributor.refund(&round.round_ref, &h.book).unwrap().outcome,
        LedgerApply::AlreadyApplied
    );

    assert_eq!(h.ledger.balance_of("U1").unwrap(), 14);
    assert_eq!(h.ledger.balance_of("U2").unwrap(), 7);
}

#[test]
fn test_payout_and_refund_are_mutually_exclusive() {
    let h = Harness::new(test_config());
    let result = settled_scenario(&h);
    h.distributor.apply(&result).unwrap();

    assert_eq!(
        h.distributor.refund(&result.round_ref, &h.book),
        Err(EngineError::AlreadySettled(result.round_ref))
    );

    // The other order: refund first, then a payout attempt
    let h = Harness::new(test_config());
    let result = settled_scenario(&h);
    h.distributor.refund(&result.round_ref, &h.book).unwrap();
    let err = h.distributor.apply(&result).unwrap_err();
    assert!(matches!(err, EngineError::InvariantViolation { .. }));
    assert_eq!(h.ledger.balance_of("U1").unwrap(), 10);
}

#[test]
fn test_tampered_result_is_rejected() {
    let h = Harness::new(test_config());
    let mut result = settled_scenario(&h);
    let stake_id = result.winning_stake_ids[0].clone();
    result.payouts.insert(stake_id, 1_000);

    let err = h.distributor.apply(&result).unwrap_err();
    assert!(matches!(err, EngineError::InvariantViolation { .. }));
    assert_eq!(h.ledger.balances().len(), 0);
    assert_eq!(h.ledger.applied_kind(&result.round_ref.to_string()).unwrap(), None);
}

#[test]
fn test_all_losers_credit_remainder_bucket() {
    let h = Harness::new(test_config());
    let round = h.open(Category::Nature, scenario_candidates());
    h.book.record(&round.round_ref, "U1", "c8", 6).unwrap();
    h.book.record(&round.round_ref, "U2", "c10", 9).unwrap();
    let frozen = h.freeze(&round);
    let result = h.settlement.settle(&frozen, &scenario_snapshot(), &h.book).unwrap();

    let receipt = h.distributor.apply(&result).unwrap();
    assert_eq!(receipt.credit_count, 0);
    assert_eq!(receipt.remainder, 15);
    assert_eq!(h.ledger.remainder_total().unwrap(), 15);
    h.distributor.apply(&result).unwrap();
    assert_eq!(h.ledger.remainder_total().unwrap(), 15);
}
