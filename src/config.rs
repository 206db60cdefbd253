//! Engine configuration
//!
//! Load order: defaults, then an optional TOML file, then environment
//! variables (including `.env`). CLI flags in the service binary override on
//! top of that.

use crate::models::{Amount, Category};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Categories that get a round timeline
    pub categories: Vec<Category>,
    /// Time from open to lock
    pub round_duration_secs: u64,
    /// Scheduler cadence
    pub tick_interval_secs: u64,
    /// Minimum stake in settlement units (0.1 token)
    pub min_stake: Amount,
    /// Candidate set size taken from the engagement feed at open
    pub max_candidates: usize,
    /// Winner set size at settlement
    pub max_winners: usize,
    /// Optional per-user, per-round stake count cap
    pub max_stakes_per_user: Option<usize>,
    pub db_path: String,
    /// Base URL of the engagement feed; in-process feed when unset
    pub feed_url: Option<String>,
    pub feed_timeout_secs: u64,
    pub listen_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            categories: Category::ALL.to_vec(),
            round_duration_secs: 86_400, // 24h rounds
            tick_interval_secs: 60,
            min_stake: 100_000_000,
            max_candidates: 10,
            max_winners: 5,
            max_stakes_per_user: None,
            db_path: "clipstake.db".to_string(),
            feed_url: None,
            feed_timeout_secs: 10,
            listen_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults, optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("CLIPSTAKE_CATEGORIES") {
            let parsed: Vec<Category> = v.split(',').filter_map(Category::from_str).collect();
            if !parsed.is_empty() {
                self.categories = parsed;
            }
        }
        if let Some(secs) = env_parse("ROUND_DURATION_SECS") {
            self.round_duration_secs = secs;
        }
        if let Some(secs) = env_parse("SCHEDULER_TICK_SECS") {
            self.tick_interval_secs = secs;
        }
        if let Some(units) = env_parse("MIN_STAKE_UNITS") {
            self.min_stake = units;
        }
        if let Some(n) = env_parse("MAX_CANDIDATES") {
            self.max_candidates = n;
        }
        if let Some(n) = env_parse("MAX_WINNERS") {
            self.max_winners = n;
        }
        if let Some(n) = env_parse::<usize>("MAX_STAKES_PER_USER") {
            self.max_stakes_per_user = if n == 0 { None } else { Some(n) };
        }
        if let Ok(v) = env::var("CLIPSTAKE_DB_PATH") {
            if !v.trim().is_empty() {
                self.db_path = v;
            }
        }
        if let Ok(v) = env::var("ENGAGEMENT_FEED_URL") {
            self.feed_url = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Some(secs) = env_parse("ENGAGEMENT_FEED_TIMEOUT_SECS") {
            self.feed_timeout_secs = secs;
        }
        if let Ok(v) = env::var("LISTEN_ADDR") {
            if !v.trim().is_empty() {
                self.listen_addr = v;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_stake == 0 {
            bail!("min_stake must be positive");
        }
        if self.round_duration_secs == 0 {
            bail!("round_duration_secs must be positive");
        }
        if self.tick_interval_secs == 0 {
            bail!("tick_interval_secs must be positive");
        }
        if self.max_winners == 0 {
            bail!("max_winners must be positive");
        }
        if self.max_candidates == 0 {
            bail!("max_candidates must be positive");
        }
        Ok(())
    }

    pub fn round_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.round_duration_secs.min(i64::MAX as u64) as i64)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
