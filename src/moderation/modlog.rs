//! Append-only moderation audit trail.
//!
//! `record` is the only write path; nothing in the public contract updates
//! or deletes an entry. Per-topic listings are public, the cross-topic view
//! is superuser-only.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::access::{self, AuthedUser};
use crate::shared::error::ForumError;
use crate::shared::schema::{mod_log, topics};
use crate::shared::state::AppState;
use crate::shared::utils::page_to_offset;

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = mod_log)]
pub struct DbModLogEntry {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub moderator_id: Uuid,
    pub action: String,
    pub target_type: String,
    pub target_id: Uuid,
    pub reason: Option<String>,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

pub fn record(
    conn: &mut PgConnection,
    entry: &DbModLogEntry,
) -> Result<(), diesel::result::Error> {
    diesel::insert_into(mod_log::table)
        .values(entry)
        .execute(conn)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModLogQuery {
    pub action: Option<String>,
    pub moderator_id: Option<Uuid>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn handle_topic_modlog(
    State(state): State<Arc<AppState>>,
    Path(topic_id): Path<Uuid>,
    Query(query): Query<ModLogQuery>,
) -> Result<Json<Vec<DbModLogEntry>>, ForumError> {
    let pool = state.conn.clone();

    let result = tokio::task::spawn_blocking(move || -> Result<Vec<DbModLogEntry>, ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;

        let topic_exists: i64 = topics::table
            .filter(topics::id.eq(topic_id))
            .count()
            .get_result(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))?;
        if topic_exists == 0 {
            return Err(ForumError::NotFound("Topic not found".to_string()));
        }

        let (offset, limit) = page_to_offset(query.page, query.limit);
        let mut db_query = mod_log::table
            .filter(mod_log::topic_id.eq(topic_id))
            .into_boxed();
        if let Some(ref action) = query.action {
            db_query = db_query.filter(mod_log::action.eq(action.to_uppercase()));
        }
        if let Some(moderator_id) = query.moderator_id {
            db_query = db_query.filter(mod_log::moderator_id.eq(moderator_id));
        }

        db_query
            .order(mod_log::created_at.desc())
            .offset(offset)
            .limit(limit)
            .load(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok(Json(result))
}

pub async fn handle_moderator_modlog(
    State(state): State<Arc<AppState>>,
    Path(moderator_id): Path<Uuid>,
    Query(query): Query<ModLogQuery>,
) -> Result<Json<Vec<DbModLogEntry>>, ForumError> {
    let pool = state.conn.clone();

    let result = tokio::task::spawn_blocking(move || -> Result<Vec<DbModLogEntry>, ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let (offset, limit) = page_to_offset(query.page, query.limit);

        let mut db_query = mod_log::table
            .filter(mod_log::moderator_id.eq(moderator_id))
            .into_boxed();
        if let Some(ref action) = query.action {
            db_query = db_query.filter(mod_log::action.eq(action.to_uppercase()));
        }

        db_query
            .order(mod_log::created_at.desc())
            .offset(offset)
            .limit(limit)
            .load(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok(Json(result))
}

pub async fn handle_global_modlog(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Query(query): Query<ModLogQuery>,
) -> Result<Json<Vec<DbModLogEntry>>, ForumError> {
    access::require_superuser(&user)?;
    let pool = state.conn.clone();

    let result = tokio::task::spawn_blocking(move || -> Result<Vec<DbModLogEntry>, ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let (offset, limit) = page_to_offset(query.page, query.limit);

        let mut db_query = mod_log::table.into_boxed();
        if let Some(ref action) = query.action {
            db_query = db_query.filter(mod_log::action.eq(action.to_uppercase()));
        }
        if let Some(moderator_id) = query.moderator_id {
            db_query = db_query.filter(mod_log::moderator_id.eq(moderator_id));
        }

        db_query
            .order(mod_log::created_at.desc())
            .offset(offset)
            .limit(limit)
            .load(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok(Json(result))
}

pub fn configure_modlog_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/modlog", get(handle_global_modlog))
        .route("/api/modlog/topic/{topicId}", get(handle_topic_modlog))
        .route(
            "/api/modlog/moderator/{userId}",
            get(handle_moderator_modlog),
        )
}
