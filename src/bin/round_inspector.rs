//! Round Inspector CLI
//!
//! Prints rounds, settlement results, applied balance mutations, balances and
//! the remainder bucket from an engine store.
//!
//! Usage:
//!   cargo run --bin round_inspector -- --db clipstake.db
//!   cargo run --bin round_inspector -- --db clipstake.db --category gaming --verbose

use anyhow::{bail, Result};
use clap::Parser;
use clipstake_backend::models::{from_amount, Category, Round, AMOUNT_SCALE};
use clipstake_backend::store::EngineDb;
use std::collections::HashMap;

#[derive(Parser, Debug)]
#[command(name = "round_inspector")]
#[command(about = "Inspect rounds, settlements and balances in a ClipStake store")]
struct Args {
    /// Path to SQLite database
    #[arg(long, env = "CLIPSTAKE_DB_PATH", default_value = "clipstake.db")]
    db: String,

    /// Only show one category (slug or pool prefix)
    #[arg(long)]
    category: Option<String>,

    /// Show every stake and payout
    #[arg(long, default_value = "false")]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let category = match args.category.as_deref() {
        Some(raw) => match Category::from_str(raw) {
            Some(c) => Some(c),
            None => bail!("unknown category {}", raw),
        },
        None => None,
    };

    println!("=== Round Inspector ===");
    println!("Database: {}", args.db);
    println!();

    let db = EngineDb::open_existing(&args.db)?;
    let rounds: Vec<Round> = db
        .load_rounds()?
        .into_iter()
        .filter(|r| category.map_or(true, |c| r.round_ref.category == c))
        .collect();
    let stakes = db.load_stakes()?;
    let settlements: HashMap<_, _> = db
        .load_settlements()?
        .into_iter()
        .map(|s| (s.round_ref, s))
        .collect();

    println!("--- Rounds ({}) ---", rounds.len());
    for round in &rounds {
        let round_stakes: Vec<_> = stakes
            .iter()
            .filter(|s| s.round_ref == round.round_ref)
            .collect();
        let pool: u128 = round_stakes.iter().map(|s| s.amount as u128).sum();
        let review = round
            .review_reason
            .as_deref()
            .map(|r| format!("  REVIEW: {}", r))
            .unwrap_or_default();

        println!(
            "{:<14} {:<9} opened {}  locks {}  candidates {:>2}  stakes {:>4}  pool {:.4}{}",
            round.round_ref.to_string(),
            round.state.as_str(),
            round.opened_at.format("%Y-%m-%d %H:%M"),
            round.locks_at.format("%Y-%m-%d %H:%M"),
            round.candidate_clip_ids.len(),
            round_stakes.len(),
            pool as f64 / AMOUNT_SCALE as f64,
            review,
        );

        if let Some(result) = settlements.get(&round.round_ref) {
            println!(
                "    winners {:?}  winning stakes {}  paid {:.4}  remainder {:.4}",
                result.winner_clip_ids,
                result.winning_stake_ids.len(),
                result.total_paid() as f64 / AMOUNT_SCALE as f64,
                from_amount(result.remainder),
            );
            if args.verbose {
                for (stake_id, amount) in &result.payouts {
                    let user = result.recipients.get(stake_id).map(String::as_str).unwrap_or("?");
                    println!("      payout {} -> {}: {:.4}", stake_id, user, from_amount(*amount));
                }
            }
        }

        if args.verbose {
            for stake in &round_stakes {
                println!(
                    "      #{:<4} {} {} on {}: {:.4}",
                    stake.seq,
                    stake.placed_at.format("%H:%M:%S"),
                    stake.user_id,
                    stake.clip_id,
                    from_amount(stake.amount),
                );
            }
        }
    }
    println!();

    let mutations = db.load_mutations()?;
    println!("--- Balance mutations ({}) ---", mutations.len());
    for m in &mutations {
        if category.map_or(false, |c| m.round_ref.category != c) {
            continue;
        }
        println!(
            "{:<14} {:<7} credits {:>4}  remainder {:.4}",
            m.idempotency_key,
            m.kind.as_str(),
            m.credit_count,
            from_amount(m.remainder),
        );
    }
    println!();

    let balances = db.balances()?;
    println!("--- Balances ({}) ---", balances.len());
    for (user, balance) in &balances {
        println!("{:<24} {:.4}", user, from_amount(*balance));
    }
    println!();

    println!("Remainder bucket: {:.4}", from_amount(db.remainder_total()?));
    println!("=== Inspection Complete ===");
    Ok(())
}
