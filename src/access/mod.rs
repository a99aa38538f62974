use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use diesel::prelude::*;
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::error::ForumError;
use crate::shared::models::{DbTopic, DbUser};
use crate::shared::schema::{topic_members, users};
use crate::shared::state::AppState;

pub const ROLE_MEMBER: &str = "MEMBER";
pub const ROLE_MODERATOR: &str = "MODERATOR";

/// Per-topic authority, ordered weakest to strongest. The topic owner holds
/// implicit moderator authority without a membership row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    None,
    Member,
    Moderator,
    Owner,
}

impl Role {
    fn from_membership(role: &str) -> Self {
        match role {
            ROLE_MODERATOR => Self::Moderator,
            _ => Self::Member,
        }
    }
}

/// Resolve (role, banned) for a user in a topic. Ownership beats any
/// membership row; a missing row is (None, not banned).
pub fn topic_role(
    conn: &mut PgConnection,
    topic: &DbTopic,
    user_id: Uuid,
) -> Result<(Role, bool), diesel::result::Error> {
    if topic.owner_id == user_id {
        return Ok((Role::Owner, false));
    }
    let membership: Option<(String, bool)> = topic_members::table
        .filter(topic_members::topic_id.eq(topic.id))
        .filter(topic_members::user_id.eq(user_id))
        .select((topic_members::role, topic_members::is_banned))
        .first(conn)
        .optional()?;
    Ok(match membership {
        Some((role, banned)) => (Role::from_membership(&role), banned),
        None => (Role::None, false),
    })
}

/// Moderator-or-better check used by rule CRUD and manual moderation.
/// Superusers bypass topic membership entirely.
pub fn require_topic_moderator(
    conn: &mut PgConnection,
    topic: &DbTopic,
    user: &DbUser,
) -> Result<Role, ForumError> {
    if user.is_superuser {
        return Ok(Role::Owner);
    }
    let (role, _) = topic_role(conn, topic, user.id)
        .map_err(|e| ForumError::Database(e.to_string()))?;
    if role >= Role::Moderator {
        Ok(role)
    } else {
        Err(ForumError::Forbidden(
            "Moderator privileges required".to_string(),
        ))
    }
}

pub fn require_superuser(user: &DbUser) -> Result<(), ForumError> {
    if user.is_superuser {
        Ok(())
    } else {
        Err(ForumError::Forbidden(
            "Superuser privileges required".to_string(),
        ))
    }
}

/// The authenticated caller. Token issuance and verification live outside
/// this service; the upstream proxy forwards the resolved user id in the
/// `x-user-id` header and this extractor loads the user row behind it.
#[derive(Debug, Clone)]
pub struct AuthedUser(pub DbUser);

impl FromRequestParts<Arc<AppState>> for AuthedUser {
    type Rejection = ForumError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ForumError::Unauthenticated("Missing x-user-id header".to_string()))?;
        let user_id = Uuid::parse_str(header)
            .map_err(|_| ForumError::Unauthenticated("Invalid user id".to_string()))?;

        let pool = state.conn.clone();
        let user = tokio::task::spawn_blocking(move || -> Result<DbUser, ForumError> {
            let mut conn = pool
                .get()
                .map_err(|e| ForumError::Database(e.to_string()))?;
            users::table
                .filter(users::id.eq(user_id))
                .first::<DbUser>(&mut conn)
                .map_err(|_| ForumError::Unauthenticated("Unknown user".to_string()))
        })
        .await
        .map_err(|e| ForumError::Internal(e.to_string()))??;

        Ok(AuthedUser(user))
    }
}
