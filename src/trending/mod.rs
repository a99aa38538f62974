use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::access::{self, AuthedUser};
use crate::config::TrendingConfig;
use crate::shared::error::ForumError;
use crate::shared::models::DbTopic;
use crate::shared::schema::{activity_events, posts, topics};
use crate::shared::state::AppState;
use crate::shared::utils::DbPool;

pub const DEFAULT_TRENDING_LIMIT: usize = 25;
pub const MAX_TRENDING_LIMIT: usize = 100;

pub const WEIGHT_POST: f64 = 1.0;
pub const WEIGHT_JOIN: f64 = 0.5;
pub const WEIGHT_VOTE: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Post,
    Join,
    Vote,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Join => "JOIN",
            Self::Vote => "VOTE",
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            Self::Post => WEIGHT_POST,
            Self::Join => WEIGHT_JOIN,
            Self::Vote => WEIGHT_VOTE,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = activity_events)]
pub struct DbActivityEvent {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub post_id: Option<Uuid>,
    pub kind: String,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

/// Contribution of an event at `age_hours` toward the current score.
/// Halves every `half_life_hours`; monotonically decreasing, never negative.
pub fn decay_factor(age_hours: f64, half_life_hours: f64) -> f64 {
    if age_hours <= 0.0 {
        return 1.0;
    }
    0.5_f64.powf(age_hours / half_life_hours)
}

/// Record one qualifying activity event and touch the topic's activity
/// timestamp. Called from the submission path; must stay cheap.
pub fn record_event(
    conn: &mut PgConnection,
    topic_id: Uuid,
    post_id: Option<Uuid>,
    kind: ActivityKind,
) -> Result<(), diesel::result::Error> {
    let now = Utc::now();
    let event = DbActivityEvent {
        id: Uuid::new_v4(),
        topic_id,
        post_id,
        kind: kind.as_str().to_string(),
        weight: kind.weight(),
        created_at: now,
    };
    diesel::insert_into(activity_events::table)
        .values(&event)
        .execute(conn)?;
    diesel::update(topics::table.filter(topics::id.eq(topic_id)))
        .set(topics::last_activity_at.eq(now))
        .execute(conn)?;
    Ok(())
}

/// Fold a window of events into per-topic and per-post decayed sums.
/// Pure in (events, now, half_life): the same inputs always produce the same
/// scores.
pub fn accumulate_scores(
    events: &[DbActivityEvent],
    now: DateTime<Utc>,
    half_life_hours: f64,
) -> (HashMap<Uuid, f64>, HashMap<Uuid, f64>) {
    let mut topic_scores: HashMap<Uuid, f64> = HashMap::new();
    let mut post_scores: HashMap<Uuid, f64> = HashMap::new();
    for event in events {
        let age_hours = (now - event.created_at).num_seconds() as f64 / 3600.0;
        let contribution = event.weight * decay_factor(age_hours, half_life_hours);
        *topic_scores.entry(event.topic_id).or_default() += contribution;
        if let Some(post_id) = event.post_id {
            *post_scores.entry(post_id).or_default() += contribution;
        }
    }
    (topic_scores, post_scores)
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicRank {
    pub topic_id: Uuid,
    pub name: String,
    pub score: f64,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostRank {
    pub post_id: Uuid,
    pub topic_id: Uuid,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub computed_at: DateTime<Utc>,
    pub topics: Vec<TopicRank>,
    pub posts: Vec<PostRank>,
}

fn sort_topic_ranks(mut ranks: Vec<TopicRank>) -> Vec<TopicRank> {
    ranks.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.last_activity_at.cmp(&a.last_activity_at))
            .then_with(|| a.topic_id.cmp(&b.topic_id))
    });
    ranks
}

fn sort_post_ranks(mut ranks: Vec<PostRank>) -> Vec<PostRank> {
    ranks.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.post_id.cmp(&b.post_id))
    });
    ranks
}

/// Rebuild the rankings from the rolling activity window and persist the
/// per-topic score. Deterministic for a fixed event history and fixed `now`.
pub fn recompute(
    conn: &mut PgConnection,
    cfg: &TrendingConfig,
    now: DateTime<Utc>,
) -> Result<Snapshot, ForumError> {
    let cutoff = now - Duration::days(cfg.window_days);
    let events: Vec<DbActivityEvent> = activity_events::table
        .filter(activity_events::created_at.ge(cutoff))
        .load(conn)
        .map_err(|e| ForumError::Database(e.to_string()))?;

    let (topic_scores, post_scores) = accumulate_scores(&events, now, cfg.half_life_hours);

    let all_topics: Vec<DbTopic> = topics::table
        .load(conn)
        .map_err(|e| ForumError::Database(e.to_string()))?;

    let mut topic_ranks = Vec::with_capacity(all_topics.len());
    for topic in &all_topics {
        let score = topic_scores.get(&topic.id).copied().unwrap_or(0.0);
        if (topic.trending_score - score).abs() > f64::EPSILON {
            diesel::update(topics::table.filter(topics::id.eq(topic.id)))
                .set(topics::trending_score.eq(score))
                .execute(conn)
                .map_err(|e| ForumError::Database(e.to_string()))?;
        }
        topic_ranks.push(TopicRank {
            topic_id: topic.id,
            name: topic.name.clone(),
            score,
            last_activity_at: topic.last_activity_at,
        });
    }

    let post_ids: Vec<Uuid> = post_scores.keys().copied().collect();
    let mut post_ranks = Vec::new();
    if !post_ids.is_empty() {
        let rows: Vec<(Uuid, Uuid, DateTime<Utc>)> = posts::table
            .filter(posts::id.eq_any(&post_ids))
            .filter(posts::moderation_state.eq("ACTIVE"))
            .select((posts::id, posts::topic_id, posts::created_at))
            .load(conn)
            .map_err(|e| ForumError::Database(e.to_string()))?;
        for (post_id, topic_id, created_at) in rows {
            post_ranks.push(PostRank {
                post_id,
                topic_id,
                score: post_scores.get(&post_id).copied().unwrap_or(0.0),
                created_at,
            });
        }
    }

    Ok(Snapshot {
        computed_at: now,
        topics: sort_topic_ranks(topic_ranks),
        posts: sort_post_ranks(post_ranks),
    })
}

/// Rankings cache with a fixed TTL and an explicit force-refresh operation.
/// Submissions never wait on it; they only insert activity events.
pub struct TrendingCache {
    ttl: Duration,
    inner: RwLock<Option<Snapshot>>,
}

impl TrendingCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::seconds(ttl_secs as i64),
            inner: RwLock::new(None),
        }
    }

    pub async fn rankings(
        &self,
        pool: &DbPool,
        cfg: &TrendingConfig,
    ) -> Result<Snapshot, ForumError> {
        let now = Utc::now();
        {
            let guard = self.inner.read().await;
            if let Some(snapshot) = guard.as_ref() {
                if now - snapshot.computed_at < self.ttl {
                    return Ok(snapshot.clone());
                }
            }
        }
        self.refresh(pool, cfg, now).await
    }

    pub async fn refresh(
        &self,
        pool: &DbPool,
        cfg: &TrendingConfig,
        now: DateTime<Utc>,
    ) -> Result<Snapshot, ForumError> {
        let pool = pool.clone();
        let cfg = cfg.clone();
        let snapshot = tokio::task::spawn_blocking(move || -> Result<Snapshot, ForumError> {
            let mut conn = pool
                .get()
                .map_err(|e| ForumError::Database(e.to_string()))?;
            recompute(&mut conn, &cfg, now)
        })
        .await
        .map_err(|e| ForumError::Internal(e.to_string()))??;

        let mut guard = self.inner.write().await;
        *guard = Some(snapshot.clone());
        Ok(snapshot)
    }
}

/// Lenient limit parsing: non-numeric or non-positive input falls back to
/// the default, oversized requests are clamped, never an error.
pub fn clamp_trending_limit(raw: Option<&str>) -> usize {
    match raw.and_then(|s| s.parse::<i64>().ok()) {
        Some(n) if n > 0 => (n as usize).min(MAX_TRENDING_LIMIT),
        _ => DEFAULT_TRENDING_LIMIT,
    }
}

#[derive(Debug, Deserialize)]
pub struct TrendingQuery {
    pub limit: Option<String>,
}

pub async fn handle_trending_topics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TrendingQuery>,
) -> Result<Json<Vec<TopicRank>>, ForumError> {
    let limit = clamp_trending_limit(query.limit.as_deref());
    let snapshot = state
        .trending
        .rankings(&state.conn, &state.config.trending)
        .await?;
    Ok(Json(snapshot.topics.into_iter().take(limit).collect()))
}

pub async fn handle_trending_posts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TrendingQuery>,
) -> Result<Json<Vec<PostRank>>, ForumError> {
    let limit = clamp_trending_limit(query.limit.as_deref());
    let snapshot = state
        .trending
        .rankings(&state.conn, &state.config.trending)
        .await?;
    Ok(Json(snapshot.posts.into_iter().take(limit).collect()))
}

pub async fn handle_force_refresh(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
) -> Result<Json<serde_json::Value>, ForumError> {
    access::require_superuser(&user)?;
    let snapshot = state
        .trending
        .refresh(&state.conn, &state.config.trending, Utc::now())
        .await?;
    Ok(Json(serde_json::json!({
        "refreshed_at": snapshot.computed_at,
        "topics": snapshot.topics.len(),
        "posts": snapshot.posts.len(),
    })))
}

pub fn configure_trending_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/trending/topics", get(handle_trending_topics))
        .route("/api/trending/posts", get(handle_trending_posts))
        .route("/api/trending/refresh", post(handle_force_refresh))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(topic_id: Uuid, post_id: Option<Uuid>, kind: ActivityKind, at: DateTime<Utc>) -> DbActivityEvent {
        DbActivityEvent {
            id: Uuid::new_v4(),
            topic_id,
            post_id,
            kind: kind.as_str().to_string(),
            weight: kind.weight(),
            created_at: at,
        }
    }

    fn t(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_decay_is_monotonic_and_positive() {
        let half_life = 24.0;
        let mut last = decay_factor(0.0, half_life);
        assert_eq!(last, 1.0);
        for hours in [1.0, 6.0, 24.0, 72.0, 500.0] {
            let factor = decay_factor(hours, half_life);
            assert!(factor < last, "decay must decrease with age");
            assert!(factor > 0.0, "decay never goes negative");
            last = factor;
        }
    }

    #[test]
    fn test_decay_halves_at_half_life() {
        let factor = decay_factor(24.0, 24.0);
        assert!((factor - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_accumulate_is_deterministic() {
        let topic = Uuid::new_v4();
        let post = Uuid::new_v4();
        let now = t("2026-08-06T12:00:00Z");
        let events = vec![
            event(topic, Some(post), ActivityKind::Post, t("2026-08-06T00:00:00Z")),
            event(topic, None, ActivityKind::Join, t("2026-08-05T12:00:00Z")),
            event(topic, Some(post), ActivityKind::Vote, t("2026-08-06T06:00:00Z")),
        ];
        let (topics_a, posts_a) = accumulate_scores(&events, now, 24.0);
        let (topics_b, posts_b) = accumulate_scores(&events, now, 24.0);
        assert_eq!(topics_a.get(&topic), topics_b.get(&topic));
        assert_eq!(posts_a.get(&post), posts_b.get(&post));
    }

    #[test]
    fn test_recent_activity_dominates() {
        let fresh = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let now = t("2026-08-06T12:00:00Z");
        let events = vec![
            event(fresh, None, ActivityKind::Post, t("2026-08-06T11:00:00Z")),
            event(stale, None, ActivityKind::Post, t("2026-08-01T11:00:00Z")),
        ];
        let (topic_scores, _) = accumulate_scores(&events, now, 24.0);
        assert!(topic_scores[&fresh] > topic_scores[&stale]);
    }

    #[test]
    fn test_topic_ranking_tie_breaks_on_recency() {
        let older = TopicRank {
            topic_id: Uuid::new_v4(),
            name: "older".to_string(),
            score: 2.0,
            last_activity_at: t("2026-08-01T00:00:00Z"),
        };
        let newer = TopicRank {
            topic_id: Uuid::new_v4(),
            name: "newer".to_string(),
            score: 2.0,
            last_activity_at: t("2026-08-05T00:00:00Z"),
        };
        let top = TopicRank {
            topic_id: Uuid::new_v4(),
            name: "top".to_string(),
            score: 9.0,
            last_activity_at: t("2026-01-01T00:00:00Z"),
        };
        let ranked = sort_topic_ranks(vec![older.clone(), newer.clone(), top.clone()]);
        assert_eq!(ranked[0].name, "top");
        assert_eq!(ranked[1].name, "newer");
        assert_eq!(ranked[2].name, "older");
    }

    #[test]
    fn test_limit_clamping() {
        assert_eq!(clamp_trending_limit(Some("10")), 10);
        assert_eq!(clamp_trending_limit(Some("1000")), MAX_TRENDING_LIMIT);
        assert_eq!(clamp_trending_limit(Some("-5")), DEFAULT_TRENDING_LIMIT);
        assert_eq!(clamp_trending_limit(Some("0")), DEFAULT_TRENDING_LIMIT);
        assert_eq!(clamp_trending_limit(Some("invalid")), DEFAULT_TRENDING_LIMIT);
        assert_eq!(clamp_trending_limit(None), DEFAULT_TRENDING_LIMIT);
    }
}
