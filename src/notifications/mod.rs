use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::access::AuthedUser;
use crate::shared::error::ForumError;
use crate::shared::schema::notifications;
use crate::shared::state::AppState;
use crate::shared::utils::page_to_offset;

pub const KIND_MENTION: &str = "MENTION";
pub const KIND_MOD_ACTION: &str = "MOD_ACTION";
pub const KIND_REPORT: &str = "REPORT";
pub const KIND_BAN: &str = "BAN";
pub const KIND_UNBAN: &str = "UNBAN";
pub const KIND_MEMBER_JOINED: &str = "MEMBER_JOINED";

pub const STATUS_UNREAD: &str = "UNREAD";
pub const STATUS_READ: &str = "READ";
pub const STATUS_DELETED: &str = "DELETED";

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = notifications)]
pub struct DbNotification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub related_id: Option<Uuid>,
    pub message: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Write one notification record. Recipients poll these; there is no push
/// channel.
pub fn notify(
    conn: &mut PgConnection,
    user_id: Uuid,
    kind: &str,
    related_id: Option<Uuid>,
    message: String,
) -> Result<Uuid, diesel::result::Error> {
    let row = DbNotification {
        id: Uuid::new_v4(),
        user_id,
        kind: kind.to_string(),
        related_id,
        message,
        status: STATUS_UNREAD.to_string(),
        created_at: Utc::now(),
    };
    diesel::insert_into(notifications::table)
        .values(&row)
        .execute(conn)?;
    Ok(row.id)
}

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub status: Option<String>,
}

pub async fn handle_list_notifications(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Query(query): Query<NotificationQuery>,
) -> Result<Json<Vec<DbNotification>>, ForumError> {
    let pool = state.conn.clone();

    let result = tokio::task::spawn_blocking(move || -> Result<Vec<DbNotification>, ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let (offset, limit) = page_to_offset(query.page, query.limit);

        let mut db_query = notifications::table
            .filter(notifications::user_id.eq(user.id))
            .into_boxed();

        match query.status {
            Some(ref status) => {
                db_query = db_query.filter(notifications::status.eq(status.to_uppercase()));
            }
            None => {
                db_query = db_query.filter(notifications::status.ne(STATUS_DELETED));
            }
        }

        db_query
            .order(notifications::created_at.desc())
            .offset(offset)
            .limit(limit)
            .load(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok(Json(result))
}

pub async fn handle_mark_read(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(notification_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ForumError> {
    set_status(state, user.id, notification_id, STATUS_READ).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn handle_delete_notification(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(notification_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ForumError> {
    set_status(state, user.id, notification_id, STATUS_DELETED).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn set_status(
    state: Arc<AppState>,
    user_id: Uuid,
    notification_id: Uuid,
    status: &'static str,
) -> Result<(), ForumError> {
    let pool = state.conn.clone();

    tokio::task::spawn_blocking(move || -> Result<(), ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;

        let updated = diesel::update(
            notifications::table
                .filter(notifications::id.eq(notification_id))
                .filter(notifications::user_id.eq(user_id)),
        )
        .set(notifications::status.eq(status))
        .execute(&mut conn)
        .map_err(|e| ForumError::Database(e.to_string()))?;

        if updated == 0 {
            return Err(ForumError::NotFound("Notification not found".to_string()));
        }
        Ok(())
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok(())
}

pub fn configure_notification_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/notifications", get(handle_list_notifications))
        .route("/api/notifications/{id}/read", post(handle_mark_read))
        .route("/api/notifications/{id}", delete(handle_delete_notification))
}
