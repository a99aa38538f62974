//! Content-submission pipeline.
//!
//! One synchronous unit of work per submission: gate → persist → mentions →
//! automod → executor → activity event. Gate failures abort before any side
//! effect; once the content row exists, side-pipeline failures are logged
//! and the submission still succeeds.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use diesel::prelude::*;
use log::error;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::access::{self, AuthedUser};
use crate::automod;
use crate::mentions;
use crate::moderation::{self, ActionSource, ContentRef, TargetKind};
use crate::notifications;
use crate::shared::error::ForumError;
use crate::shared::models::{DbComment, DbPost, DbTopic, DbTopicMember, DbUser};
use crate::shared::schema::{comments, posts, topic_members, topics};
use crate::shared::state::AppState;
use crate::trending::{self, ActivityKind};

#[derive(Debug, Deserialize)]
pub struct SubmitContentRequest {
    pub body: String,
}

/// Post-persistence pipeline steps. Isolated failure domain: nothing in here
/// may fail the enclosing submission.
fn run_side_pipeline(
    conn: &mut PgConnection,
    topic: &DbTopic,
    author: &DbUser,
    content: &ContentRef,
    body: &str,
) {
    let mut notified: HashSet<Uuid> = HashSet::new();
    let (post_id, comment_id) = match content.kind {
        TargetKind::Post => (Some(content.id), None),
        TargetKind::Comment => (None, Some(content.id)),
    };

    if let Err(e) = mentions::process_mentions(conn, author, post_id, comment_id, body, &mut notified)
    {
        error!("Mention processing failed for {}: {}", content.id, e);
    }

    match automod::load_rules(conn, topic.id, true) {
        Ok(rules) => {
            let ctx = automod::AuthorContext::snapshot(author, Utc::now());
            for rule in automod::matching_rules(&rules, &ctx, body) {
                let Some(action) = rule.action else { continue };
                let source = ActionSource::Automated {
                    rule_id: rule.id,
                    rule_name: rule.name.clone(),
                    attributed_to: rule.created_by,
                };
                if let Err(e) =
                    moderation::apply_action(conn, content, action, &source, None, &mut notified)
                {
                    error!(
                        "Automod action {} from rule {} failed on {}: {}",
                        action.as_str(),
                        rule.id,
                        content.id,
                        e
                    );
                }
            }
        }
        Err(e) => error!("Automod rule load failed for topic {}: {}", topic.id, e),
    }

    match content.kind {
        TargetKind::Post => {
            if let Err(e) = trending::record_event(conn, topic.id, Some(content.id), ActivityKind::Post)
            {
                error!("Activity event failed for post {}: {}", content.id, e);
            }
        }
        TargetKind::Comment => {
            // Comments are not a scoring event but still count as topic activity.
            if let Err(e) = diesel::update(topics::table.filter(topics::id.eq(topic.id)))
                .set(topics::last_activity_at.eq(Utc::now()))
                .execute(conn)
            {
                error!("Activity touch failed for topic {}: {}", topic.id, e);
            }
        }
    }
}

pub async fn handle_submit_post(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(topic_id): Path<Uuid>,
    Json(req): Json<SubmitContentRequest>,
) -> Result<(StatusCode, Json<DbPost>), ForumError> {
    if req.body.trim().is_empty() {
        return Err(ForumError::Validation("Post body is required".to_string()));
    }

    let pool = state.conn.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<DbPost, ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let topic: DbTopic = topics::table
            .filter(topics::id.eq(topic_id))
            .first(&mut conn)
            .map_err(|_| ForumError::NotFound("Topic not found".to_string()))?;

        let (_, banned) = access::topic_role(&mut conn, &topic, user.id)
            .map_err(|e| ForumError::Database(e.to_string()))?;
        if banned {
            return Err(ForumError::Forbidden(
                "You are banned from this topic".to_string(),
            ));
        }

        let now = Utc::now();
        let post = DbPost {
            id: Uuid::new_v4(),
            topic_id: topic.id,
            author_id: user.id,
            body: req.body,
            moderation_state: moderation::ModerationState::Active.as_str().to_string(),
            is_locked: false,
            created_at: now,
            updated_at: now,
        };
        diesel::insert_into(posts::table)
            .values(&post)
            .execute(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))?;

        let content = ContentRef {
            kind: TargetKind::Post,
            id: post.id,
            topic_id: topic.id,
            topic_name: topic.name.clone(),
            topic_owner_id: topic.owner_id,
            author_id: user.id,
        };
        run_side_pipeline(&mut conn, &topic, &user, &content, &post.body);

        posts::table
            .filter(posts::id.eq(post.id))
            .first(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok((StatusCode::CREATED, Json(result)))
}

pub async fn handle_submit_comment(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(post_id): Path<Uuid>,
    Json(req): Json<SubmitContentRequest>,
) -> Result<(StatusCode, Json<DbComment>), ForumError> {
    if req.body.trim().is_empty() {
        return Err(ForumError::Validation(
            "Comment body is required".to_string(),
        ));
    }

    let pool = state.conn.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<DbComment, ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let post: DbPost = posts::table
            .filter(posts::id.eq(post_id))
            .first(&mut conn)
            .map_err(|_| ForumError::NotFound("Post not found".to_string()))?;

        match moderation::ModerationState::parse(&post.moderation_state) {
            Some(moderation::ModerationState::Active) => {}
            Some(moderation::ModerationState::Removed) | None => {
                return Err(ForumError::NotFound("Post not found".to_string()));
            }
            Some(moderation::ModerationState::Filtered) => {
                return Err(ForumError::Conflict(
                    "Post is awaiting moderator review".to_string(),
                ));
            }
        }
        if post.is_locked {
            return Err(ForumError::Conflict("Post is locked".to_string()));
        }

        let topic: DbTopic = topics::table
            .filter(topics::id.eq(post.topic_id))
            .first(&mut conn)
            .map_err(|_| ForumError::NotFound("Topic not found".to_string()))?;
        let (_, banned) = access::topic_role(&mut conn, &topic, user.id)
            .map_err(|e| ForumError::Database(e.to_string()))?;
        if banned {
            return Err(ForumError::Forbidden(
                "You are banned from this topic".to_string(),
            ));
        }

        let comment = DbComment {
            id: Uuid::new_v4(),
            post_id: post.id,
            author_id: user.id,
            body: req.body,
            moderation_state: moderation::ModerationState::Active.as_str().to_string(),
            created_at: Utc::now(),
        };
        diesel::insert_into(comments::table)
            .values(&comment)
            .execute(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))?;

        let content = ContentRef {
            kind: TargetKind::Comment,
            id: comment.id,
            topic_id: topic.id,
            topic_name: topic.name.clone(),
            topic_owner_id: topic.owner_id,
            author_id: user.id,
        };
        run_side_pipeline(&mut conn, &topic, &user, &content, &comment.body);

        comments::table
            .filter(comments::id.eq(comment.id))
            .first(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok((StatusCode::CREATED, Json(result)))
}

pub async fn handle_join_topic(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(topic_id): Path<Uuid>,
) -> Result<(StatusCode, Json<DbTopicMember>), ForumError> {
    let pool = state.conn.clone();

    let result = tokio::task::spawn_blocking(move || -> Result<DbTopicMember, ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let topic: DbTopic = topics::table
            .filter(topics::id.eq(topic_id))
            .first(&mut conn)
            .map_err(|_| ForumError::NotFound("Topic not found".to_string()))?;

        if topic.owner_id == user.id {
            return Err(ForumError::Conflict(
                "The topic owner is already a member".to_string(),
            ));
        }
        let existing: i64 = topic_members::table
            .filter(topic_members::topic_id.eq(topic_id))
            .filter(topic_members::user_id.eq(user.id))
            .count()
            .get_result(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))?;
        if existing > 0 {
            return Err(ForumError::Conflict(
                "Already a member of this topic".to_string(),
            ));
        }

        let membership = DbTopicMember {
            id: Uuid::new_v4(),
            topic_id: topic.id,
            user_id: user.id,
            role: access::ROLE_MEMBER.to_string(),
            is_banned: false,
            joined_at: Utc::now(),
        };
        diesel::insert_into(topic_members::table)
            .values(&membership)
            .execute(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))?;

        if let Err(e) = trending::record_event(&mut conn, topic.id, None, ActivityKind::Join) {
            error!("Activity event failed for join on {}: {}", topic.id, e);
        }
        let message = format!("@{} joined {}", user.username, topic.name);
        if let Err(e) = notifications::notify(
            &mut conn,
            topic.owner_id,
            notifications::KIND_MEMBER_JOINED,
            Some(topic.id),
            message,
        ) {
            log::warn!("Failed to create join notification: {}", e);
        }

        Ok(membership)
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok((StatusCode::CREATED, Json(result)))
}

pub fn configure_submission_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/topics/{topicId}/posts", post(handle_submit_post))
        .route("/api/posts/{postId}/comments", post(handle_submit_comment))
        .route("/api/topics/{topicId}/join", post(handle_join_topic))
}
