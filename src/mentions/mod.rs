use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::access::AuthedUser;
use crate::notifications;
use crate::shared::error::ForumError;
use crate::shared::models::DbUser;
use crate::shared::schema::{mentions, users};
use crate::shared::state::AppState;
use crate::shared::utils::page_to_offset;

/// Mentions beyond this are silently dropped, never rejected.
pub const MAX_MENTIONS_PER_CONTENT: usize = 5;

const MAX_HANDLE_LEN: usize = 32;

/// `@` only opens a mention when it starts a token: preceded by nothing, or
/// by a character that is neither username-legal nor another `@`. This keeps
/// `user@example.com` from producing a mention of `example`.
static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^A-Za-z0-9_@])@([A-Za-z0-9_]+)").unwrap());

diesel::define_sql_function! {
    fn lower(x: diesel::sql_types::Text) -> diesel::sql_types::Text;
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = mentions)]
pub struct DbMention {
    pub id: Uuid,
    pub mentioner_id: Uuid,
    pub mentioned_id: Uuid,
    pub post_id: Option<Uuid>,
    pub comment_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Scan a body for candidate `@handle` tokens, in first-occurrence order.
/// Overlong runs are not valid handles and produce nothing.
pub fn extract_handles(body: &str) -> Vec<String> {
    MENTION_RE
        .captures_iter(body)
        .filter_map(|cap| {
            let handle = cap.get(1)?.as_str();
            if handle.len() > MAX_HANDLE_LEN {
                None
            } else {
                Some(handle.to_string())
            }
        })
        .collect()
}

/// Resolve extracted handles against a lowercase username index. Unknown
/// handles and the author are dropped, duplicates keep their first
/// occurrence, and the result is capped at [`MAX_MENTIONS_PER_CONTENT`].
pub fn resolve_mentions(
    handles: &[String],
    username_index: &HashMap<String, Uuid>,
    author_id: Uuid,
) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    let mut resolved = Vec::new();
    for handle in handles {
        let Some(&user_id) = username_index.get(&handle.to_lowercase()) else {
            continue;
        };
        if user_id == author_id || !seen.insert(user_id) {
            continue;
        }
        resolved.push(user_id);
        if resolved.len() == MAX_MENTIONS_PER_CONTENT {
            break;
        }
    }
    resolved
}

/// Pipeline step: persist mention rows for a freshly created content unit and
/// fan out MENTION notifications. `notified` carries every user already
/// notified for this content event so one logical event never produces two
/// notifications for the same recipient.
pub fn process_mentions(
    conn: &mut PgConnection,
    author: &DbUser,
    post_id: Option<Uuid>,
    comment_id: Option<Uuid>,
    body: &str,
    notified: &mut HashSet<Uuid>,
) -> Result<Vec<Uuid>, ForumError> {
    let handles = extract_handles(body);
    if handles.is_empty() {
        return Ok(Vec::new());
    }

    let lowered: Vec<String> = handles.iter().map(|h| h.to_lowercase()).collect();
    let rows: Vec<(Uuid, String)> = users::table
        .filter(lower(users::username).eq_any(&lowered))
        .select((users::id, users::username))
        .load(conn)
        .map_err(|e| ForumError::Database(e.to_string()))?;
    let username_index: HashMap<String, Uuid> = rows
        .into_iter()
        .map(|(id, name)| (name.to_lowercase(), id))
        .collect();

    let resolved = resolve_mentions(&handles, &username_index, author.id);
    let now = Utc::now();
    let related_id = post_id.or(comment_id);
    let unit = if post_id.is_some() { "post" } else { "comment" };

    for &mentioned_id in &resolved {
        let row = DbMention {
            id: Uuid::new_v4(),
            mentioner_id: author.id,
            mentioned_id,
            post_id,
            comment_id,
            created_at: now,
        };
        diesel::insert_into(mentions::table)
            .values(&row)
            .execute(conn)
            .map_err(|e| ForumError::Database(e.to_string()))?;

        if notified.insert(mentioned_id) {
            let message = format!("@{} mentioned you in a {}", author.username, unit);
            if let Err(e) = notifications::notify(
                conn,
                mentioned_id,
                notifications::KIND_MENTION,
                related_id,
                message,
            ) {
                log::warn!("Failed to create mention notification: {}", e);
            }
        }
    }

    Ok(resolved)
}

#[derive(Debug, Deserialize)]
pub struct MentionQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn handle_list_mentions(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Query(query): Query<MentionQuery>,
) -> Result<Json<Vec<DbMention>>, ForumError> {
    let pool = state.conn.clone();

    let result = tokio::task::spawn_blocking(move || -> Result<Vec<DbMention>, ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let (offset, limit) = page_to_offset(query.page, query.limit);

        mentions::table
            .filter(mentions::mentioned_id.eq(user.id))
            .order(mentions::created_at.desc())
            .offset(offset)
            .limit(limit)
            .load(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok(Json(result))
}

pub fn configure_mention_routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/mentions", get(handle_list_mentions))
}
