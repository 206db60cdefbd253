//! SQLite-backed engine store
//!
//! Rounds, stakes, settlement results and balance mutations survive restarts.
//! Key properties:
//! - WAL mode so the inspector can read while the service writes
//! - Settlement results are insert-if-absent (first writer wins)
//! - Balance mutations are keyed by idempotency key and applied in one
//!   transaction together with the balance updates they carry

use crate::engine::ledger::{BalanceMutation, MutationKind};
use crate::models::{Amount, Category, Round, RoundRef, RoundState, SettlementResult, Stake, StakeId};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::sync::Arc;
use tracing::{info, warn};

/// Largest amount, pool, balance or remainder the store can hold (SQLite
/// INTEGER is a signed 64-bit value).
pub const MAX_STORED_AMOUNT: Amount = i64::MAX as Amount;

/// A value that does not fit the store's integer columns. Retrying cannot
/// succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRangeError(pub String);

impl std::fmt::Display for StorageRangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StorageRangeError {}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS rounds (
    category TEXT NOT NULL,
    round_number INTEGER NOT NULL,
    state TEXT NOT NULL,
    opened_at_ms INTEGER NOT NULL,
    locks_at_ms INTEGER NOT NULL,
    candidates_json TEXT NOT NULL,
    winners_json TEXT NOT NULL,
    review_reason TEXT,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (category, round_number)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS stakes (
    stake_id TEXT PRIMARY KEY,
    category TEXT NOT NULL,
    round_number INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    user_id TEXT NOT NULL,
    clip_id TEXT NOT NULL,
    amount INTEGER NOT NULL,
    placed_at_ms INTEGER NOT NULL,
    UNIQUE (category, round_number, seq)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_stakes_round
    ON stakes(category, round_number, seq);

CREATE TABLE IF NOT EXISTS settlements (
    category TEXT NOT NULL,
    round_number INTEGER NOT NULL,
    result_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (category, round_number)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS balance_mutations (
    idempotency_key TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    category TEXT NOT NULL,
    round_number INTEGER NOT NULL,
    credits_json TEXT NOT NULL,
    remainder INTEGER NOT NULL,
    applied_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS balances (
    user_id TEXT PRIMARY KEY,
    balance INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

/// Summary row for an applied balance mutation.
#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub idempotency_key: String,
    pub kind: MutationKind,
    pub round_ref: RoundRef,
    pub credit_count: usize,
    pub remainder: Amount,
    pub applied_at: i64,
}

#[derive(Clone)]
pub struct EngineDb {
    conn: Arc<Mutex<Connection>>,
}

impl EngineDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open engine database at {}", db_path))?;
        Self::init(conn, db_path)
    }

    /// Open an existing store without creating or migrating it (inspector).
    pub fn open_existing(db_path: &str) -> Result<Self> {
        let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_WRITE)
            .with_context(|| format!("Failed to open engine database at {}", db_path))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize engine schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if label != ":memory:" && journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("🗄️  Engine store initialized at: {}", label);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // =========================================================================
    // ROUNDS
    // =========================================================================

    pub fn insert_round(&self, round: &Round) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rounds (category, round_number, state, opened_at_ms, locks_at_ms,
             candidates_json, winners_json, review_reason, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                round.round_ref.category.as_str(),
                to_sql_u64(round.round_ref.round_number)?,
                round.state.as_str(),
                round.opened_at.timestamp_millis(),
                round.locks_at.timestamp_millis(),
                serde_json::to_string(&round.candidate_clip_ids)?,
                serde_json::to_string(&round.winner_clip_ids)?,
                round.review_reason,
                Utc::now().timestamp(),
            ],
        )
        .with_context(|| format!("insert round {}", round.round_ref))?;
        Ok(())
    }

    /// Persist the mutable parts of a round (state, winners, review flag).
    pub fn update_round(&self, round: &Round) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE rounds SET state = ?1, winners_json = ?2, review_reason = ?3, updated_at = ?4
             WHERE category = ?5 AND round_number = ?6",
            params![
                round.state.as_str(),
                serde_json::to_string(&round.winner_clip_ids)?,
                round.review_reason,
                Utc::now().timestamp(),
                round.round_ref.category.as_str(),
                to_sql_u64(round.round_ref.round_number)?,
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("round {} not present in store", round.round_ref));
        }
        Ok(())
    }

    pub fn load_rounds(&self) -> Result<Vec<Round>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT category, round_number, state, opened_at_ms, locks_at_ms,
                    candidates_json, winners_json, review_reason
             FROM rounds ORDER BY category, round_number",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(category, number, state, opened, locks, candidates, winners, review)| -> Result<Round> {
                    Ok(Round {
                        round_ref: RoundRef::new(parse_category(&category)?, from_sql_u64(number)?),
                        state: RoundState::from_str(&state)
                            .ok_or_else(|| anyhow!("unknown round state {}", state))?,
                        opened_at: from_millis(opened)?,
                        locks_at: from_millis(locks)?,
                        candidate_clip_ids: serde_json::from_str(&candidates)?,
                        winner_clip_ids: serde_json::from_str(&winners)?,
                        review_reason: review,
                    })
                },
            )
            .collect()
    }

    // =========================================================================
    // STAKES
    // =========================================================================

    pub fn insert_stake(&self, stake: &Stake) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO stakes (stake_id, category, round_number, seq, user_id, clip_id,
             amount, placed_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                stake.stake_id.as_str(),
                stake.round_ref.category.as_str(),
                to_sql_u64(stake.round_ref.round_number)?,
                to_sql_u64(stake.seq)?,
                stake.user_id,
                stake.clip_id,
                to_sql_u64(stake.amount)?,
                stake.placed_at.timestamp_millis(),
            ],
        )
        .with_context(|| format!("insert stake {}", stake.stake_id))?;
        Ok(())
    }

    /// All stakes ordered by round then append sequence.
    pub fn load_stakes(&self) -> Result<Vec<Stake>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT stake_id, category, round_number, seq, user_id, clip_id, amount, placed_at_ms
             FROM stakes ORDER BY category, round_number, seq",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, category, number, seq, user, clip, amount, placed)| -> Result<Stake> {
                Ok(Stake {
                    stake_id: StakeId(id),
                    round_ref: RoundRef::new(parse_category(&category)?, from_sql_u64(number)?),
                    seq: from_sql_u64(seq)?,
                    user_id: user,
                    clip_id: clip,
                    amount: from_sql_u64(amount)?,
                    placed_at: from_millis(placed)?,
                })
            })
            .collect()
    }

    // =========================================================================
    // SETTLEMENTS
    // =========================================================================

    /// Insert a settlement result unless one already exists for the round.
    /// Returns the stored result, which is the existing one on conflict.
    pub fn insert_settlement(&self, result: &SettlementResult) -> Result<SettlementResult> {
        let conn = self.conn.lock();
        let category = result.round_ref.category.as_str();
        let number = to_sql_u64(result.round_ref.round_number)?;
        conn.execute(
            "INSERT OR IGNORE INTO settlements (category, round_number, result_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                category,
                number,
                serde_json::to_string(result)?,
                Utc::now().timestamp()
            ],
        )?;
        let stored: String = conn.query_row(
            "SELECT result_json FROM settlements WHERE category = ?1 AND round_number = ?2",
            params![category, number],
            |row| row.get(0),
        )?;
        Ok(serde_json::from_str(&stored)?)
    }

    pub fn load_settlements(&self) -> Result<Vec<SettlementResult>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT result_json FROM settlements ORDER BY category, round_number",
        )?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| -> Result<SettlementResult> { Ok(serde_json::from_str(json)?) })
            .collect()
    }

    // =========================================================================
    // BALANCES
    // =========================================================================

    /// Apply a balance mutation exactly once. Returns `false` without touching
    /// any balance when the idempotency key was already applied.
    pub fn apply_balance_mutation(&self, mutation: &BalanceMutation) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().timestamp();

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO balance_mutations (idempotency_key, kind, category,
             round_number, credits_json, remainder, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                mutation.idempotency_key,
                mutation.kind.as_str(),
                mutation.round_ref.category.as_str(),
                to_sql_u64(mutation.round_ref.round_number)?,
                serde_json::to_string(&mutation.credits)?,
                to_sql_u64(mutation.remainder)?,
                now,
            ],
        )?;
        if inserted == 0 {
            // Dropping the transaction rolls back.
            return Ok(false);
        }

        for (user_id, credit) in mutation.credits_by_user() {
            let current: i64 = tx
                .query_row(
                    "SELECT balance FROM balances WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);
            let next = (current as i128)
                .checked_add(credit as i128)
                .filter(|v| *v <= i64::MAX as i128)
                .ok_or_else(|| StorageRangeError(format!("balance overflow for user {}", user_id)))?;
            tx.execute(
                "INSERT INTO balances (user_id, balance, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET balance = excluded.balance,
                 updated_at = excluded.updated_at",
                params![user_id, next as i64, now],
            )?;
        }

        tx.commit()?;
        Ok(true)
    }

    pub fn mutation_kind(&self, idempotency_key: &str) -> Result<Option<MutationKind>> {
        let conn = self.conn.lock();
        let kind: Option<String> = conn
            .query_row(
                "SELECT kind FROM balance_mutations WHERE idempotency_key = ?1",
                params![idempotency_key],
                |row| row.get(0),
            )
            .optional()?;
        kind.map(|k| MutationKind::from_str(&k).ok_or_else(|| anyhow!("unknown mutation kind {}", k)))
            .transpose()
    }

    pub fn load_mutations(&self) -> Result<Vec<MutationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT idempotency_key, kind, category, round_number, credits_json, remainder, applied_at
             FROM balance_mutations ORDER BY applied_at, idempotency_key",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(key, kind, category, number, credits, remainder, applied_at)| -> Result<MutationRecord> {
                let credits: Vec<serde_json::Value> = serde_json::from_str(&credits)?;
                Ok(MutationRecord {
                    idempotency_key: key,
                    kind: MutationKind::from_str(&kind)
                        .ok_or_else(|| anyhow!("unknown mutation kind {}", kind))?,
                    round_ref: RoundRef::new(parse_category(&category)?, from_sql_u64(number)?),
                    credit_count: credits.len(),
                    remainder: from_sql_u64(remainder)?,
                    applied_at,
                })
            })
            .collect()
    }

    pub fn balance_of(&self, user_id: &str) -> Result<Amount> {
        let conn = self.conn.lock();
        let balance: Option<i64> = conn
            .query_row(
                "SELECT balance FROM balances WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        from_sql_u64(balance.unwrap_or(0))
    }

    pub fn balances(&self) -> Result<Vec<(String, Amount)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT user_id, balance FROM balances ORDER BY user_id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(user, balance)| -> Result<(String, Amount)> { Ok((user, from_sql_u64(balance)?)) })
            .collect()
    }

    /// Total value carried to the remainder bucket across all rounds.
    pub fn remainder_total(&self) -> Result<Amount> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(remainder), 0) FROM balance_mutations",
            [],
            |row| row.get(0),
        )?;
        from_sql_u64(total)
    }
}

fn to_sql_u64(v: u64) -> Result<i64> {
    i64::try_from(v).map_err(|_| StorageRangeError(format!("value {} exceeds storage range", v)).into())
}

fn from_sql_u64(v: i64) -> Result<u64> {
    u64::try_from(v).map_err(|_| anyhow!("negative value {} in store", v))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("invalid timestamp {}", ms))
}

fn parse_category(s: &str) -> Result<Category> {
    Category::from_str(s).ok_or_else(|| anyhow!("unknown category {}", s))
}
