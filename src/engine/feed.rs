//! Engagement feed collaborator
//!
//! Two reads are needed from the surrounding product:
//! - the top clips of a category by likes (candidate set at open)
//! - a point-in-time like count per clip (ranking at settlement)
//!
//! Staleness is acceptable; unavailability is reported as a retryable error.

use crate::error::EngineError;
use crate::models::{Category, ClipId, RankedClip};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Immutable read of clip like counts. Consumed, never mutated, by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementSnapshot {
    pub taken_at: DateTime<Utc>,
    likes: HashMap<ClipId, u64>,
}

impl EngagementSnapshot {
    pub fn new(likes: HashMap<ClipId, u64>, taken_at: DateTime<Utc>) -> Self {
        Self { taken_at, likes }
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<ClipId>,
    {
        Self::new(
            pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            Utc::now(),
        )
    }

    /// Clips absent from the snapshot count as zero likes.
    pub fn like_count(&self, clip_id: &str) -> u64 {
        self.likes.get(clip_id).copied().unwrap_or(0)
    }

    pub fn contains(&self, clip_id: &str) -> bool {
        self.likes.contains_key(clip_id)
    }

    pub fn len(&self) -> usize {
        self.likes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.likes.is_empty()
    }
}

/// Likes descending, then clip id ascending. Total order, so rankings are
/// reproducible whenever like counts tie.
pub fn engagement_order(a: &RankedClip, b: &RankedClip) -> Ordering {
    b.like_count
        .cmp(&a.like_count)
        .then_with(|| a.clip_id.cmp(&b.clip_id))
}

#[async_trait]
pub trait EngagementFeed: Send + Sync {
    /// Like counts for the given clips.
    async fn snapshot(&self, clip_ids: &[ClipId]) -> Result<EngagementSnapshot, EngineError>;

    /// Top `limit` clips of the category by engagement, best first.
    async fn top_clips(&self, category: Category, limit: usize)
        -> Result<Vec<ClipId>, EngineError>;
}

// =============================================================================
// STATIC FEED
// =============================================================================

/// In-process feed. Used by tests and when no feed URL is configured.
#[derive(Debug, Default)]
pub struct StaticEngagementFeed {
    clips: RwLock<HashMap<Category, HashMap<ClipId, u64>>>,
    unavailable: RwLock<Option<String>>,
}

impl StaticEngagementFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_likes(&self, category: Category, clip_id: &str, likes: u64) {
        self.clips
            .write()
            .entry(category)
            .or_default()
            .insert(clip_id.to_string(), likes);
    }

    pub fn set_category(&self, category: Category, clips: &[(&str, u64)]) {
        let mut map = self.clips.write();
        let entry = map.entry(category).or_default();
        entry.clear();
        for (clip, likes) in clips {
            entry.insert(clip.to_string(), *likes);
        }
    }

    /// Simulate an outage; `None` restores the feed.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *self.unavailable.write() = reason.map(str::to_string);
    }

    fn check_available(&self) -> Result<(), EngineError> {
        match self.unavailable.read().as_ref() {
            Some(reason) => Err(EngineError::EngagementSnapshotUnavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EngagementFeed for StaticEngagementFeed {
    async fn snapshot(&self, clip_ids: &[ClipId]) -> Result<EngagementSnapshot, EngineError> {
        self.check_available()?;
        let clips = self.clips.read();
        let likes = clip_ids
            .iter()
            .filter_map(|id| {
                clips
                    .values()
                    .find_map(|m| m.get(id))
                    .map(|n| (id.clone(), *n))
            })
            .collect();
        Ok(EngagementSnapshot::new(likes, Utc::now()))
    }

    async fn top_clips(
        &self,
        category: Category,
        limit: usize,
    ) -> Result<Vec<ClipId>, EngineError> {
        self.check_available()?;
        let clips = self.clips.read();
        let mut ranked: Vec<RankedClip> = clips
            .get(&category)
            .map(|m| {
                m.iter()
                    .map(|(id, likes)| RankedClip {
                        clip_id: id.clone(),
                        like_count: *likes,
                    })
                    .collect()
            })
            .unwrap_or_default();
        ranked.sort_by(engagement_order);
        Ok(ranked.into_iter().take(limit).map(|r| r.clip_id).collect())
    }
}

// =============================================================================
// HTTP FEED
// =============================================================================

#[derive(Debug, Deserialize)]
struct LikesResponse {
    likes: HashMap<ClipId, u64>,
}

#[derive(Debug, Deserialize)]
struct TopClipsResponse {
    clip_ids: Vec<ClipId>,
}

/// Engagement feed served by the content backend over HTTP.
pub struct HttpEngagementFeed {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEngagementFeed {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

fn feed_unavailable(err: reqwest::Error) -> EngineError {
    EngineError::DependencyUnavailable {
        dependency: "engagement_feed",
        reason: err.to_string(),
    }
}

#[async_trait]
impl EngagementFeed for HttpEngagementFeed {
    async fn snapshot(&self, clip_ids: &[ClipId]) -> Result<EngagementSnapshot, EngineError> {
        let url = format!("{}/engagement", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("clip_ids", clip_ids.join(","))])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| EngineError::EngagementSnapshotUnavailable(e.to_string()))?;
        let body: LikesResponse = response
            .json()
            .await
            .map_err(|e| EngineError::EngagementSnapshotUnavailable(e.to_string()))?;
        debug!(clips = body.likes.len(), "engagement snapshot fetched");
        Ok(EngagementSnapshot::new(body.likes, Utc::now()))
    }

    async fn top_clips(
        &self,
        category: Category,
        limit: usize,
    ) -> Result<Vec<ClipId>, EngineError> {
        let url = format!("{}/categories/{}/top", self.base_url, category.as_str());
        let response = self
            .client
            .get(&url)
            .query(&[("limit", limit.to_string())])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(feed_unavailable)?;
        let body: TopClipsResponse = response.json().await.map_err(feed_unavailable)?;
        Ok(body.clip_ids.into_iter().take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_feed_top_clips_breaks_ties_by_id() {
        let feed = StaticEngagementFeed::new();
        feed.set_category(
            Category::Gaming,
            &[("b", 50), ("a", 50), ("c", 90), ("d", 1)],
        );

        let top = feed.top_clips(Category::Gaming, 3).await.unwrap();
        assert_eq!(top, vec!["c", "a", "b"]);
        assert!(feed.top_clips(Category::Nature, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_static_feed_snapshot_and_outage() {
        let feed = StaticEngagementFeed::new();
        feed.set_likes(Category::Knowledge, "k1", 12);

        let snapshot = feed
            .snapshot(&["k1".to_string(), "zz".to_string()])
            .await
            .unwrap();
        assert_eq!(snapshot.like_count("k1"), 12);
        assert_eq!(snapshot.like_count("zz"), 0);
        assert!(!snapshot.contains("zz"));

        feed.set_unavailable(Some("maintenance"));
        let err = feed.snapshot(&["k1".to_string()]).await.unwrap_err();
        assert!(err.is_retryable());

        feed.set_unavailable(None);
        assert!(feed.snapshot(&["k1".to_string()]).await.is_ok());
    }

    #[test]
    fn test_engagement_order() {
        let mut clips = vec![
            RankedClip { clip_id: "c3".into(), like_count: 90 },
            RankedClip { clip_id: "c2".into(), like_count: 90 },
            RankedClip { clip_id: "c1".into(), like_count: 100 },
        ];
        clips.sort_by(engagement_order);
        let ids: Vec<&str> = clips.iter().map(|c| c.clip_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }
}
