use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::schema::{comments, posts, topic_members, topics, users};

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = users)]
pub struct DbUser {
    pub id: Uuid,
    pub username: String,
    pub post_cred: i32,
    pub comment_cred: i32,
    pub is_superuser: bool,
    pub created_at: DateTime<Utc>,
}

impl DbUser {
    pub fn karma(&self) -> i64 {
        i64::from(self.post_cred) + i64::from(self.comment_cred)
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = topics)]
pub struct DbTopic {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub trending_score: f64,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = topic_members)]
pub struct DbTopicMember {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub is_banned: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = posts)]
pub struct DbPost {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub moderation_state: String,
    pub is_locked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = comments)]
pub struct DbComment {
    pub id: Uuid,
    pub post_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub moderation_state: String,
    pub created_at: DateTime<Utc>,
}
