//! Wall-clock driver for round timelines
//!
//! Each tick walks every configured category:
//! - no active round: open one from the feed's current top clips
//! - active round past `locks_at`: lock, settle, distribute, finalize, then
//!   open the next round
//!
//! Failures are logged and reported; the next tick resumes from whatever
//! state the round reached. Rounds flagged for review are skipped.

use crate::engine::feed::{EngagementFeed, EngagementSnapshot};
use crate::engine::{PredictionMarket, SettlementOutcome};
use crate::error::EngineError;
use crate::models::{Category, RoundRef, RoundState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickFailure {
    pub category: Category,
    pub round_ref: Option<RoundRef>,
    pub error: EngineError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub opened: Vec<RoundRef>,
    pub settled: Vec<RoundRef>,
    pub voided: Vec<RoundRef>,
    pub skipped: Vec<RoundRef>,
    pub failures: Vec<TickFailure>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.opened.is_empty()
            && self.settled.is_empty()
            && self.voided.is_empty()
            && self.failures.is_empty()
    }
}

pub struct RoundScheduler {
    market: Arc<PredictionMarket>,
    feed: Arc<dyn EngagementFeed>,
    interval: Duration,
}

impl RoundScheduler {
    pub fn new(market: Arc<PredictionMarket>, feed: Arc<dyn EngagementFeed>) -> Self {
        let interval = market.config().tick_interval();
        Self {
            market,
            feed,
            interval,
        }
    }

    /// Tick until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "⏱️  Round scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick(Utc::now()).await;
                    if !report.is_idle() {
                        info!(
                            opened = report.opened.len(),
                            settled = report.settled.len(),
                            voided = report.voided.len(),
                            failures = report.failures.len(),
                            "Scheduler tick"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Round scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        for category in self.market.config().categories.clone() {
            if let Err(error) = self.tick_category(category, now, &mut report).await {
                let round_ref = self
                    .market
                    .rounds()
                    .active_round(category)
                    .map(|r| r.round_ref);
                warn!(
                    category = %category,
                    round = ?round_ref.map(|r| r.to_string()),
                    error = %error,
                    retryable = error.is_retryable(),
                    "Scheduler step failed, retrying next tick"
                );
                report.failures.push(TickFailure {
                    category,
                    round_ref,
                    error,
                });
            }
        }
        report
    }

    async fn tick_category(
        &self,
        category: Category,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), EngineError> {
        if let Some(round) = self.market.rounds().active_round(category) {
            if round.review_reason.is_some() {
                debug!(round = %round.round_ref, "Round under review, skipping");
                report.skipped.push(round.round_ref);
                return Ok(());
            }
            if round.state == RoundState::Open && !round.lock_due(now) {
                return Ok(());
            }

            let round_ref = round.round_ref;
            let round = self.market.advance_to_settling(&round_ref)?;

            // A stored result or an empty candidate set needs no fresh read.
            let snapshot = if round.candidate_clip_ids.is_empty()
                || self.market.settlement_result(&round_ref).is_some()
            {
                EngagementSnapshot::new(HashMap::new(), now)
            } else {
                self.feed.snapshot(&round.candidate_clip_ids).await?
            };

            match self.market.complete_settlement(&round_ref, &snapshot)? {
                SettlementOutcome::Settled { .. } => report.settled.push(round_ref),
                SettlementOutcome::Voided { .. } => report.voided.push(round_ref),
            }
        }

        let candidates = self
            .feed
            .top_clips(category, self.market.config().max_candidates)
            .await?;
        let round = self.market.open_round(category, candidates, now)?;
        report.opened.push(round.round_ref);
        Ok(())
    }
}
