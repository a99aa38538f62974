pub mod modlog;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::access::{self, AuthedUser};
use crate::automod::RuleAction;
use crate::notifications;
use crate::shared::error::ForumError;
use crate::shared::models::{DbComment, DbPost, DbTopic, DbUser};
use crate::shared::schema::{comments, posts, reports, topic_members, topics};
use crate::shared::state::AppState;
use crate::shared::utils::page_to_offset;

pub const TARGET_POST: &str = "POST";
pub const TARGET_COMMENT: &str = "COMMENT";
pub const TARGET_USER: &str = "USER";

pub const ACTION_BAN: &str = "BAN";
pub const ACTION_UNBAN: &str = "UNBAN";

/// Visibility state of a content unit. REMOVED is terminal; FILTERED awaits
/// moderator review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationState {
    Active,
    Filtered,
    Removed,
}

impl ModerationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Filtered => "FILTERED",
            Self::Removed => "REMOVED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(Self::Active),
            "FILTERED" => Some(Self::Filtered),
            "REMOVED" => Some(Self::Removed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Post,
    Comment,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => TARGET_POST,
            Self::Comment => TARGET_COMMENT,
        }
    }

    fn unit_noun(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Comment => "comment",
        }
    }
}

/// Everything the executor needs to know about the content unit it acts on.
#[derive(Debug, Clone)]
pub struct ContentRef {
    pub kind: TargetKind,
    pub id: Uuid,
    pub topic_id: Uuid,
    pub topic_name: String,
    pub topic_owner_id: Uuid,
    pub author_id: Uuid,
}

/// Who requested the action. Automated actions are attributed to the rule's
/// creator in the audit log (the schema wants a real user reference); the
/// details payload keeps the distinction readable.
#[derive(Debug, Clone)]
pub enum ActionSource {
    Automated {
        rule_id: Uuid,
        rule_name: String,
        attributed_to: Uuid,
    },
    Manual {
        actor_id: Uuid,
    },
}

impl ActionSource {
    fn attributed_user(&self) -> Uuid {
        match self {
            Self::Automated { attributed_to, .. } => *attributed_to,
            Self::Manual { actor_id } => *actor_id,
        }
    }

    fn is_automated(&self) -> bool {
        matches!(self, Self::Automated { .. })
    }
}

/// Strategy table entry: one row per action, consumed by a single generic
/// executor instead of per-action branches.
#[derive(Debug, Clone, Copy)]
pub struct ActionSpec {
    pub to_state: Option<ModerationState>,
    pub from_states: &'static [ModerationState],
    pub sets_lock: bool,
    pub notifies_author: bool,
    pub files_report: bool,
}

pub fn action_spec(action: RuleAction) -> ActionSpec {
    use ModerationState::{Active, Filtered};
    match action {
        RuleAction::Remove => ActionSpec {
            to_state: Some(ModerationState::Removed),
            from_states: &[Active, Filtered],
            sets_lock: false,
            notifies_author: true,
            files_report: false,
        },
        RuleAction::Filter => ActionSpec {
            to_state: Some(ModerationState::Filtered),
            from_states: &[Active],
            sets_lock: false,
            notifies_author: false,
            files_report: false,
        },
        RuleAction::Approve => ActionSpec {
            to_state: Some(ModerationState::Active),
            from_states: &[Filtered],
            sets_lock: false,
            notifies_author: false,
            files_report: false,
        },
        RuleAction::Lock => ActionSpec {
            to_state: None,
            from_states: &[],
            sets_lock: true,
            notifies_author: false,
            files_report: false,
        },
        RuleAction::Report => ActionSpec {
            to_state: None,
            from_states: &[],
            sets_lock: false,
            notifies_author: false,
            files_report: true,
        },
        RuleAction::Message => ActionSpec {
            to_state: None,
            from_states: &[],
            sets_lock: false,
            notifies_author: true,
            files_report: false,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionOutcome {
    pub state_changed: bool,
    pub logged: bool,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = reports)]
pub struct DbReport {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub target_type: String,
    pub target_id: Uuid,
    pub reporter_id: Uuid,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn transition_state(
    conn: &mut PgConnection,
    content: &ContentRef,
    from_states: &[ModerationState],
    to_state: ModerationState,
) -> Result<usize, diesel::result::Error> {
    let from: Vec<&str> = from_states.iter().map(|s| s.as_str()).collect();
    match content.kind {
        TargetKind::Post => diesel::update(
            posts::table
                .filter(posts::id.eq(content.id))
                .filter(posts::moderation_state.eq_any(&from)),
        )
        .set((
            posts::moderation_state.eq(to_state.as_str()),
            posts::updated_at.eq(Utc::now()),
        ))
        .execute(conn),
        TargetKind::Comment => diesel::update(
            comments::table
                .filter(comments::id.eq(content.id))
                .filter(comments::moderation_state.eq_any(&from)),
        )
        .set(comments::moderation_state.eq(to_state.as_str()))
        .execute(conn),
    }
}

fn current_state(
    conn: &mut PgConnection,
    content: &ContentRef,
) -> Result<Option<ModerationState>, diesel::result::Error> {
    let raw: String = match content.kind {
        TargetKind::Post => posts::table
            .filter(posts::id.eq(content.id))
            .select(posts::moderation_state)
            .first(conn)?,
        TargetKind::Comment => comments::table
            .filter(comments::id.eq(content.id))
            .select(comments::moderation_state)
            .first(conn)?,
    };
    Ok(ModerationState::parse(&raw))
}

/// Apply one moderation action to one content unit.
///
/// State transitions go through an optimistic guard (`UPDATE … WHERE
/// moderation_state IN from_states`), so two concurrent actors cannot both
/// observe the pre-transition state. Automated no-ops skip silently; manual
/// re-runs of an already-applied action are logged anyway. `notified` holds
/// users already notified for this content event, so fanout never doubles up
/// within one submission.
pub fn apply_action(
    conn: &mut PgConnection,
    content: &ContentRef,
    action: RuleAction,
    source: &ActionSource,
    reason: Option<String>,
    notified: &mut HashSet<Uuid>,
) -> Result<ActionOutcome, ForumError> {
    let spec = action_spec(action);
    let mut state_changed = false;

    if let Some(to_state) = spec.to_state {
        let rows = transition_state(conn, content, spec.from_states, to_state)
            .map_err(|e| ForumError::Database(e.to_string()))?;
        if rows == 1 {
            state_changed = true;
        } else if source.is_automated() {
            return Ok(ActionOutcome {
                state_changed: false,
                logged: false,
            });
        } else {
            let current = current_state(conn, content)
                .map_err(|e| ForumError::Database(e.to_string()))?;
            if current != Some(to_state) {
                return Err(ForumError::Conflict(format!(
                    "Cannot {} a {} in state {}",
                    action.as_str(),
                    content.kind.unit_noun(),
                    current.map(|s| s.as_str()).unwrap_or("UNKNOWN"),
                )));
            }
        }
    }

    if spec.sets_lock {
        match content.kind {
            TargetKind::Post => {
                let rows = diesel::update(
                    posts::table
                        .filter(posts::id.eq(content.id))
                        .filter(posts::is_locked.eq(false)),
                )
                .set((posts::is_locked.eq(true), posts::updated_at.eq(Utc::now())))
                .execute(conn)
                .map_err(|e| ForumError::Database(e.to_string()))?;
                if rows == 1 {
                    state_changed = true;
                } else if source.is_automated() {
                    return Ok(ActionOutcome {
                        state_changed: false,
                        logged: false,
                    });
                }
            }
            TargetKind::Comment => {
                if source.is_automated() {
                    return Ok(ActionOutcome {
                        state_changed: false,
                        logged: false,
                    });
                }
                return Err(ForumError::Validation(
                    "Only posts can be locked".to_string(),
                ));
            }
        }
    }

    if spec.files_report {
        let report = DbReport {
            id: Uuid::new_v4(),
            topic_id: content.topic_id,
            target_type: content.kind.as_str().to_string(),
            target_id: content.id,
            reporter_id: source.attributed_user(),
            reason: reason.clone(),
            created_at: Utc::now(),
        };
        diesel::insert_into(reports::table)
            .values(&report)
            .execute(conn)
            .map_err(|e| ForumError::Database(e.to_string()))?;

        if notified.insert(content.topic_owner_id) {
            let message = format!(
                "A {} in {} was reported for review",
                content.kind.unit_noun(),
                content.topic_name
            );
            if let Err(e) = notifications::notify(
                conn,
                content.topic_owner_id,
                notifications::KIND_REPORT,
                Some(content.id),
                message,
            ) {
                log::warn!("Failed to create report notification: {}", e);
            }
        }
    }

    if spec.notifies_author && notified.insert(content.author_id) {
        let message = match action {
            RuleAction::Remove => match &reason {
                Some(r) => format!(
                    "Your {} in {} was removed: {}",
                    content.kind.unit_noun(),
                    content.topic_name,
                    r
                ),
                None => format!(
                    "Your {} in {} was removed",
                    content.kind.unit_noun(),
                    content.topic_name
                ),
            },
            _ => match (&reason, source) {
                (Some(r), _) => format!(
                    "Message from the moderators of {}: {}",
                    content.topic_name, r
                ),
                (None, ActionSource::Automated { rule_name, .. }) => format!(
                    "Message from the moderators of {}: {}",
                    content.topic_name, rule_name
                ),
                (None, ActionSource::Manual { .. }) => format!(
                    "Message from the moderators of {}",
                    content.topic_name
                ),
            },
        };
        if let Err(e) = notifications::notify(
            conn,
            content.author_id,
            notifications::KIND_MOD_ACTION,
            Some(content.id),
            message,
        ) {
            log::warn!("Failed to create moderation notification: {}", e);
        }
    }

    // Audit trail: every state-changing action and every manual action gets
    // exactly one entry. Automated REPORT/MESSAGE stay out of the log.
    let should_log = match source {
        ActionSource::Manual { .. } => true,
        ActionSource::Automated { .. } => state_changed,
    };
    if should_log {
        let details = match source {
            ActionSource::Automated {
                rule_id, rule_name, ..
            } => Some(serde_json::json!({
                "automated": true,
                "rule_id": rule_id,
                "rule_name": rule_name,
            })),
            ActionSource::Manual { .. } => None,
        };
        let entry = modlog::DbModLogEntry {
            id: Uuid::new_v4(),
            topic_id: content.topic_id,
            moderator_id: source.attributed_user(),
            action: action.as_str().to_string(),
            target_type: content.kind.as_str().to_string(),
            target_id: content.id,
            reason,
            details,
            created_at: Utc::now(),
        };
        if let Err(e) = modlog::record(conn, &entry) {
            log::error!(
                "MOD LOG APPEND FAILED for {} {} in topic {}: {}",
                entry.action,
                entry.target_id,
                entry.topic_id,
                e
            );
        }
    }

    Ok(ActionOutcome {
        state_changed,
        logged: should_log,
    })
}

pub fn post_content_ref(conn: &mut PgConnection, post: &DbPost) -> Result<ContentRef, ForumError> {
    let topic: DbTopic = topics::table
        .filter(topics::id.eq(post.topic_id))
        .first(conn)
        .map_err(|_| ForumError::NotFound("Topic not found".to_string()))?;
    Ok(ContentRef {
        kind: TargetKind::Post,
        id: post.id,
        topic_id: topic.id,
        topic_name: topic.name,
        topic_owner_id: topic.owner_id,
        author_id: post.author_id,
    })
}

pub fn comment_content_ref(
    conn: &mut PgConnection,
    comment: &DbComment,
) -> Result<ContentRef, ForumError> {
    let post: DbPost = posts::table
        .filter(posts::id.eq(comment.post_id))
        .first(conn)
        .map_err(|_| ForumError::NotFound("Post not found".to_string()))?;
    let topic: DbTopic = topics::table
        .filter(topics::id.eq(post.topic_id))
        .first(conn)
        .map_err(|_| ForumError::NotFound("Topic not found".to_string()))?;
    Ok(ContentRef {
        kind: TargetKind::Comment,
        id: comment.id,
        topic_id: topic.id,
        topic_name: topic.name,
        topic_owner_id: topic.owner_id,
        author_id: comment.author_id,
    })
}

#[derive(Debug, Deserialize)]
pub struct ModerateRequest {
    pub action: String,
    pub reason: Option<String>,
}

pub async fn handle_moderate_post(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(post_id): Path<Uuid>,
    Json(req): Json<ModerateRequest>,
) -> Result<Json<DbPost>, ForumError> {
    let action = RuleAction::parse(&req.action)
        .ok_or_else(|| ForumError::Validation(format!("Unknown action: {}", req.action)))?;

    let pool = state.conn.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<DbPost, ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let post: DbPost = posts::table
            .filter(posts::id.eq(post_id))
            .first(&mut conn)
            .map_err(|_| ForumError::NotFound("Post not found".to_string()))?;
        let content = post_content_ref(&mut conn, &post)?;
        let topic: DbTopic = topics::table
            .filter(topics::id.eq(content.topic_id))
            .first(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))?;
        access::require_topic_moderator(&mut conn, &topic, &user)?;

        let mut notified = HashSet::new();
        apply_action(
            &mut conn,
            &content,
            action,
            &ActionSource::Manual { actor_id: user.id },
            req.reason,
            &mut notified,
        )?;

        posts::table
            .filter(posts::id.eq(post_id))
            .first(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok(Json(result))
}

pub async fn handle_moderate_comment(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(comment_id): Path<Uuid>,
    Json(req): Json<ModerateRequest>,
) -> Result<Json<DbComment>, ForumError> {
    let action = RuleAction::parse(&req.action)
        .ok_or_else(|| ForumError::Validation(format!("Unknown action: {}", req.action)))?;

    let pool = state.conn.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<DbComment, ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let comment: DbComment = comments::table
            .filter(comments::id.eq(comment_id))
            .first(&mut conn)
            .map_err(|_| ForumError::NotFound("Comment not found".to_string()))?;
        let content = comment_content_ref(&mut conn, &comment)?;
        let topic: DbTopic = topics::table
            .filter(topics::id.eq(content.topic_id))
            .first(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))?;
        access::require_topic_moderator(&mut conn, &topic, &user)?;

        let mut notified = HashSet::new();
        apply_action(
            &mut conn,
            &content,
            action,
            &ActionSource::Manual { actor_id: user.id },
            req.reason,
            &mut notified,
        )?;

        comments::table
            .filter(comments::id.eq(comment_id))
            .first(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok(Json(result))
}

#[derive(Debug, Deserialize, Default)]
pub struct BanRequest {
    pub reason: Option<String>,
}

async fn set_ban(
    state: Arc<AppState>,
    actor: DbUser,
    topic_id: Uuid,
    target_user_id: Uuid,
    banned: bool,
    reason: Option<String>,
) -> Result<(), ForumError> {
    let pool = state.conn.clone();

    tokio::task::spawn_blocking(move || -> Result<(), ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let topic: DbTopic = topics::table
            .filter(topics::id.eq(topic_id))
            .first(&mut conn)
            .map_err(|_| ForumError::NotFound("Topic not found".to_string()))?;
        access::require_topic_moderator(&mut conn, &topic, &actor)?;

        if target_user_id == topic.owner_id {
            return Err(ForumError::Validation(
                "The topic owner cannot be banned".to_string(),
            ));
        }

        let updated = diesel::update(
            topic_members::table
                .filter(topic_members::topic_id.eq(topic_id))
                .filter(topic_members::user_id.eq(target_user_id)),
        )
        .set(topic_members::is_banned.eq(banned))
        .execute(&mut conn)
        .map_err(|e| ForumError::Database(e.to_string()))?;
        if updated == 0 {
            return Err(ForumError::NotFound(
                "User is not a member of this topic".to_string(),
            ));
        }

        let action = if banned { ACTION_BAN } else { ACTION_UNBAN };
        let entry = modlog::DbModLogEntry {
            id: Uuid::new_v4(),
            topic_id,
            moderator_id: actor.id,
            action: action.to_string(),
            target_type: TARGET_USER.to_string(),
            target_id: target_user_id,
            reason: reason.clone(),
            details: None,
            created_at: Utc::now(),
        };
        if let Err(e) = modlog::record(&mut conn, &entry) {
            log::error!(
                "MOD LOG APPEND FAILED for {} {} in topic {}: {}",
                action,
                target_user_id,
                topic_id,
                e
            );
        }

        let kind = if banned {
            notifications::KIND_BAN
        } else {
            notifications::KIND_UNBAN
        };
        let message = if banned {
            match &reason {
                Some(r) => format!("You were banned from {}: {}", topic.name, r),
                None => format!("You were banned from {}", topic.name),
            }
        } else {
            format!("Your ban from {} was lifted", topic.name)
        };
        if let Err(e) = notifications::notify(&mut conn, target_user_id, kind, Some(topic_id), message)
        {
            log::warn!("Failed to create ban notification: {}", e);
        }
        Ok(())
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok(())
}

pub async fn handle_ban_member(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path((topic_id, user_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<BanRequest>,
) -> Result<Json<serde_json::Value>, ForumError> {
    set_ban(state, user, topic_id, user_id, true, req.reason).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn handle_unban_member(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path((topic_id, user_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<BanRequest>,
) -> Result<Json<serde_json::Value>, ForumError> {
    set_ban(state, user, topic_id, user_id, false, req.reason).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn handle_list_topic_reports(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(topic_id): Path<Uuid>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<Vec<DbReport>>, ForumError> {
    let pool = state.conn.clone();

    let result = tokio::task::spawn_blocking(move || -> Result<Vec<DbReport>, ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let topic: DbTopic = topics::table
            .filter(topics::id.eq(topic_id))
            .first(&mut conn)
            .map_err(|_| ForumError::NotFound("Topic not found".to_string()))?;
        access::require_topic_moderator(&mut conn, &topic, &user)?;

        let (offset, limit) = page_to_offset(query.page, query.limit);
        reports::table
            .filter(reports::topic_id.eq(topic_id))
            .order(reports::created_at.desc())
            .offset(offset)
            .limit(limit)
            .load(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok(Json(result))
}

pub fn configure_moderation_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/moderation/posts/{id}", post(handle_moderate_post))
        .route(
            "/api/moderation/comments/{id}",
            post(handle_moderate_comment),
        )
        .route("/api/topics/{topicId}/ban/{userId}", post(handle_ban_member))
        .route(
            "/api/topics/{topicId}/unban/{userId}",
            post(handle_unban_member),
        )
        .route(
            "/api/reports/topic/{topicId}",
            get(handle_list_topic_reports),
        )
        .merge(modlog::configure_modlog_routes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_is_reachable_from_active_and_filtered() {
        let spec = action_spec(RuleAction::Remove);
        assert_eq!(spec.to_state, Some(ModerationState::Removed));
        assert!(spec.from_states.contains(&ModerationState::Active));
        assert!(spec.from_states.contains(&ModerationState::Filtered));
    }

    #[test]
    fn test_removed_is_terminal() {
        for action in [
            RuleAction::Remove,
            RuleAction::Filter,
            RuleAction::Approve,
        ] {
            let spec = action_spec(action);
            assert!(
                !spec.from_states.contains(&ModerationState::Removed),
                "{} must not leave REMOVED",
                action.as_str()
            );
        }
    }

    #[test]
    fn test_approve_only_from_filtered() {
        let spec = action_spec(RuleAction::Approve);
        assert_eq!(spec.from_states, &[ModerationState::Filtered][..]);
        assert_eq!(spec.to_state, Some(ModerationState::Active));
    }

    #[test]
    fn test_report_and_message_change_no_state() {
        for action in [RuleAction::Report, RuleAction::Message] {
            let spec = action_spec(action);
            assert!(spec.to_state.is_none());
            assert!(!spec.sets_lock);
        }
        assert!(action_spec(RuleAction::Report).files_report);
        assert!(action_spec(RuleAction::Message).notifies_author);
    }

    #[test]
    fn test_lock_is_a_flag_not_a_state() {
        let spec = action_spec(RuleAction::Lock);
        assert!(spec.sets_lock);
        assert!(spec.to_state.is_none());
    }

    #[test]
    fn test_moderation_state_round_trip() {
        for state in [
            ModerationState::Active,
            ModerationState::Filtered,
            ModerationState::Removed,
        ] {
            assert_eq!(ModerationState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ModerationState::parse("SHADOWBANNED"), None);
    }
}
