//! End-to-end round lifecycle against the SQLite store
//!
//! Opens rounds through the scheduler, records stakes, restarts the engine
//! from disk mid-round, then settles and checks balances, the remainder
//! bucket and conservation for every round.

use chrono::{DateTime, Duration, TimeZone, Utc};
use clipstake_backend::engine::{RoundScheduler, StaticEngagementFeed};
use clipstake_backend::models::{Category, RoundRef, RoundState};
use clipstake_backend::store::EngineDb;
use clipstake_backend::{EngineConfig, EngineError, PredictionMarket, StakeRejection};
use std::sync::Arc;
use tempfile::NamedTempFile;

fn config() -> EngineConfig {
    EngineConfig {
        categories: vec![Category::Entertainment, Category::Nature],
        min_stake: 100,
        round_duration_secs: 86_400,
        ..EngineConfig::default()
    }
}

fn start() -> DateTime<Utc> {
    Utc.timestamp_opt(1_710_000_000, 0).unwrap()
}

fn feed() -> Arc<StaticEngagementFeed> {
    let feed = Arc::new(StaticEngagementFeed::new());
    feed.set_category(
        Category::Entertainment,
        &[
            ("e1", 500),
            ("e2", 400),
            ("e3", 300),
            ("e4", 200),
            ("e5", 100),
            ("e6", 50),
            ("e7", 10),
        ],
    );
    feed.set_category(Category::Nature, &[("n1", 9), ("n2", 3)]);
    feed
}

fn boot(path: &str) -> Arc<PredictionMarket> {
    let db = Arc::new(EngineDb::new(path).unwrap());
    Arc::new(PredictionMarket::with_store(config(), db).unwrap())
}

#[tokio::test]
async fn test_full_lifecycle_across_restart() {
    let temp = NamedTempFile::new().unwrap();
    let path = temp.path().to_str().unwrap().to_string();
    let feed = feed();
    let ent1 = RoundRef::new(Category::Entertainment, 1);
    let nat1 = RoundRef::new(Category::Nature, 1);

    // Day 0: rounds open, stakes arrive
    {
        let market = boot(&path);
        let scheduler = RoundScheduler::new(market.clone(), feed.clone());
        let report = scheduler.tick(start()).await;
        assert_eq!(report.opened, vec![ent1, nat1]);

        market.place_stake(&ent1, "alice", "e1", 300).unwrap();
        market.place_stake(&ent1, "bob", "e4", 100).unwrap();
        market.place_stake(&ent1, "carol", "e7", 600).unwrap();
        market.place_stake(&nat1, "dave", "n2", 250).unwrap();
        assert_eq!(
            market.place_stake(&ent1, "erin", "e1", 99),
            Err(EngineError::Rejected(StakeRejection::BelowMinimum {
                amount: 99,
                minimum: 100
            }))
        );
    }

    // Engagement moves after open: e7 surges but was never a top-5 contender
    // at open, and e6 overtakes e5.
    feed.set_likes(Category::Entertainment, "e7", 450);
    feed.set_likes(Category::Entertainment, "e6", 150);

    // Restart, then the lock time passes
    let market = boot(&path);
    assert_eq!(market.stake_book().len(&ent1), 3);
    assert_eq!(market.rounds().get(&ent1).unwrap().state, RoundState::Open);

    let scheduler = RoundScheduler::new(market.clone(), feed.clone());
    let report = scheduler.tick(start() + Duration::days(1)).await;
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.settled, vec![ent1, nat1]);

    let ent_result = market.settlement_result(&ent1).unwrap();
    // e7 is a candidate (top-10 at open) and now ranks second
    assert_eq!(
        ent_result.winner_clip_ids,
        vec!["e1", "e7", "e2", "e3", "e4"]
    );
    assert_eq!(ent_result.total_pool, 1_000);
    assert!(ent_result.is_conserved());

    // Every stake backed a winner: payouts equal the pool, pro-rata
    assert_eq!(market.balance_of("alice").unwrap(), 300);
    assert_eq!(market.balance_of("bob").unwrap(), 100);
    assert_eq!(market.balance_of("carol").unwrap(), 600);

    // Nature: two candidates, both win, dave gets the whole pool
    assert_eq!(market.balance_of("dave").unwrap(), 250);

    // Next rounds are open
    assert_eq!(
        market.active_pools(start() + Duration::days(1)).len(),
        2
    );

    // A second restart re-drives nothing
    drop(scheduler);
    drop(market);
    let market = boot(&path);
    let scheduler = RoundScheduler::new(market.clone(), feed.clone());
    let report = scheduler.tick(start() + Duration::days(1) + Duration::minutes(1)).await;
    assert!(report.is_idle());
    assert_eq!(market.balance_of("alice").unwrap(), 300);
    assert_eq!(market.remainder_total().unwrap(), 0);
}

#[tokio::test]
async fn test_losing_pool_lands_in_remainder_bucket() {
    let temp = NamedTempFile::new().unwrap();
    let path = temp.path().to_str().unwrap().to_string();
    let feed = feed();
    let market = boot(&path);
    let scheduler = RoundScheduler::new(market.clone(), feed.clone());
    scheduler.tick(start()).await;

    let ent1 = RoundRef::new(Category::Entertainment, 1);
    market.place_stake(&ent1, "alice", "e6", 400).unwrap();
    market.place_stake(&ent1, "bob", "e7", 100).unwrap();

    scheduler.tick(start() + Duration::days(1)).await;

    let result = market.settlement_result(&ent1).unwrap();
    assert!(result.winning_stake_ids.is_empty());
    assert_eq!(result.remainder, 500);
    assert_eq!(market.balance_of("alice").unwrap(), 0);
    assert_eq!(market.remainder_total().unwrap(), 500);

    let db = EngineDb::open_existing(&path).unwrap();
    let mutations = db.load_mutations().unwrap();
    assert_eq!(mutations.len(), 2);
    assert_eq!(db.remainder_total().unwrap(), 500);
}
