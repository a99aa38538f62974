use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::access::{self, AuthedUser};
use crate::shared::error::ForumError;
use crate::shared::models::{DbTopic, DbUser};
use crate::shared::schema::{automod_rules, topics};
use crate::shared::state::AppState;

/// Enforcement carried out when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleAction {
    Remove,
    Filter,
    Report,
    Lock,
    Message,
    Approve,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remove => "REMOVE",
            Self::Filter => "FILTER",
            Self::Report => "REPORT",
            Self::Lock => "LOCK",
            Self::Message => "MESSAGE",
            Self::Approve => "APPROVE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "REMOVE" => Some(Self::Remove),
            "FILTER" => Some(Self::Filter),
            "REPORT" => Some(Self::Report),
            "LOCK" => Some(Self::Lock),
            "MESSAGE" => Some(Self::Message),
            "APPROVE" => Some(Self::Approve),
            _ => None,
        }
    }
}

/// One typed predicate. A rule matches only when every one of its conditions
/// holds. The tagged JSON form is what crosses the HTTP boundary and what is
/// stored; it is parsed into this enum exactly once per load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    ContentContains { keywords: Vec<String> },
    UserKarmaBelow { threshold: i64 },
    AccountAgeBelow { days: i64 },
}

impl RuleCondition {
    pub fn holds(&self, ctx: &AuthorContext, body_lower: &str) -> bool {
        match self {
            Self::ContentContains { keywords } => keywords
                .iter()
                .any(|kw| body_lower.contains(&kw.to_lowercase())),
            Self::UserKarmaBelow { threshold } => ctx.karma < *threshold,
            Self::AccountAgeBelow { days } => ctx.account_age_days < *days,
        }
    }
}

/// Validate the boundary payload into the typed condition set. Malformed
/// payloads are rejected at rule creation/update time rather than stored.
pub fn parse_conditions(raw: &serde_json::Value) -> Result<Vec<RuleCondition>, String> {
    let conditions: Vec<RuleCondition> = serde_json::from_value(raw.clone())
        .map_err(|e| format!("Invalid conditions payload: {}", e))?;
    if conditions.is_empty() {
        return Err("A rule needs at least one condition".to_string());
    }
    for condition in &conditions {
        if let RuleCondition::ContentContains { keywords } = condition {
            if keywords.is_empty() || keywords.iter().any(|kw| kw.trim().is_empty()) {
                return Err("contentContains needs non-empty keywords".to_string());
            }
        }
    }
    Ok(conditions)
}

/// Author snapshot taken once per submission, before rule evaluation.
#[derive(Debug, Clone)]
pub struct AuthorContext {
    pub karma: i64,
    pub account_age_days: i64,
}

impl AuthorContext {
    pub fn snapshot(author: &DbUser, now: DateTime<Utc>) -> Self {
        Self {
            karma: author.karma(),
            account_age_days: (now - author.created_at).num_days(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = automod_rules)]
pub struct DbAutomodRule {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    pub conditions: serde_json::Value,
    pub action: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A rule as the matcher sees it. Rows whose stored conditions or action no
/// longer parse are carried with `None` payloads: inert, never matching.
#[derive(Debug, Clone)]
pub struct AutomodRule {
    pub id: Uuid,
    pub topic_id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    pub action: Option<RuleAction>,
    pub conditions: Option<Vec<RuleCondition>>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

impl From<DbAutomodRule> for AutomodRule {
    fn from(db: DbAutomodRule) -> Self {
        let action = RuleAction::parse(&db.action);
        let conditions = parse_conditions(&db.conditions).ok();
        Self {
            id: db.id,
            topic_id: db.topic_id,
            name: db.name,
            enabled: db.enabled,
            priority: db.priority,
            action,
            conditions,
            created_by: db.created_by,
            created_at: db.created_at,
        }
    }
}

/// Load a consistent snapshot of a topic's rules, sorted for evaluation:
/// priority descending, ties broken by creation time ascending.
pub fn load_rules(
    conn: &mut PgConnection,
    topic_id: Uuid,
    enabled_only: bool,
) -> Result<Vec<AutomodRule>, diesel::result::Error> {
    let mut query = automod_rules::table
        .filter(automod_rules::topic_id.eq(topic_id))
        .into_boxed();
    if enabled_only {
        query = query.filter(automod_rules::enabled.eq(true));
    }
    let rows: Vec<DbAutomodRule> = query
        .order((
            automod_rules::priority.desc(),
            automod_rules::created_at.asc(),
        ))
        .load(conn)?;
    Ok(rows.into_iter().map(AutomodRule::from).collect())
}

/// Pure evaluation: every matching rule is returned, in evaluation order.
/// Enforcement is not first-match-wins; a REPORT rule and a REMOVE rule can
/// both fire on the same content.
pub fn matching_rules<'a>(
    rules: &'a [AutomodRule],
    ctx: &AuthorContext,
    body: &str,
) -> Vec<&'a AutomodRule> {
    let body_lower = body.to_lowercase();
    rules
        .iter()
        .filter(|rule| rule.enabled && rule.action.is_some())
        .filter(|rule| match &rule.conditions {
            Some(conditions) => conditions.iter().all(|c| c.holds(ctx, &body_lower)),
            None => false,
        })
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub topic_id: Uuid,
    pub name: String,
    pub priority: Option<i32>,
    pub conditions: serde_json::Value,
    pub action: String,
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRuleRequest {
    pub name: Option<String>,
    pub priority: Option<i32>,
    pub conditions: Option<serde_json::Value>,
    pub action: Option<String>,
    pub enabled: Option<bool>,
}

fn load_topic(conn: &mut PgConnection, topic_id: Uuid) -> Result<DbTopic, ForumError> {
    topics::table
        .filter(topics::id.eq(topic_id))
        .first(conn)
        .map_err(|_| ForumError::NotFound("Topic not found".to_string()))
}

pub async fn handle_create_rule(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Json(req): Json<CreateRuleRequest>,
) -> Result<(StatusCode, Json<DbAutomodRule>), ForumError> {
    if req.name.trim().is_empty() {
        return Err(ForumError::Validation("Rule name is required".to_string()));
    }
    let action = RuleAction::parse(&req.action)
        .ok_or_else(|| ForumError::Validation(format!("Unknown action: {}", req.action)))?;
    let conditions = parse_conditions(&req.conditions).map_err(ForumError::Validation)?;

    let pool = state.conn.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<DbAutomodRule, ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let topic = load_topic(&mut conn, req.topic_id)?;
        access::require_topic_moderator(&mut conn, &topic, &user)?;

        let now = Utc::now();
        let row = DbAutomodRule {
            id: Uuid::new_v4(),
            topic_id: topic.id,
            name: req.name.trim().to_string(),
            enabled: req.enabled.unwrap_or(true),
            priority: req.priority.unwrap_or(0),
            conditions: serde_json::to_value(&conditions)
                .map_err(|e| ForumError::Internal(e.to_string()))?,
            action: action.as_str().to_string(),
            created_by: user.id,
            created_at: now,
            updated_at: now,
        };
        diesel::insert_into(automod_rules::table)
            .values(&row)
            .execute(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))?;
        Ok(row)
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok((StatusCode::CREATED, Json(result)))
}

pub async fn handle_list_topic_rules(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(topic_id): Path<Uuid>,
) -> Result<Json<Vec<DbAutomodRule>>, ForumError> {
    let pool = state.conn.clone();

    let result = tokio::task::spawn_blocking(move || -> Result<Vec<DbAutomodRule>, ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let topic = load_topic(&mut conn, topic_id)?;
        access::require_topic_moderator(&mut conn, &topic, &user)?;

        automod_rules::table
            .filter(automod_rules::topic_id.eq(topic_id))
            .order((
                automod_rules::priority.desc(),
                automod_rules::created_at.asc(),
            ))
            .load(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok(Json(result))
}

pub async fn handle_get_rule(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(rule_id): Path<Uuid>,
) -> Result<Json<DbAutomodRule>, ForumError> {
    let pool = state.conn.clone();

    let result = tokio::task::spawn_blocking(move || -> Result<DbAutomodRule, ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let rule: DbAutomodRule = automod_rules::table
            .filter(automod_rules::id.eq(rule_id))
            .first(&mut conn)
            .map_err(|_| ForumError::NotFound("Rule not found".to_string()))?;
        let topic = load_topic(&mut conn, rule.topic_id)?;
        access::require_topic_moderator(&mut conn, &topic, &user)?;
        Ok(rule)
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok(Json(result))
}

pub async fn handle_update_rule(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(rule_id): Path<Uuid>,
    Json(req): Json<UpdateRuleRequest>,
) -> Result<Json<DbAutomodRule>, ForumError> {
    let action = match &req.action {
        Some(raw) => Some(
            RuleAction::parse(raw)
                .ok_or_else(|| ForumError::Validation(format!("Unknown action: {}", raw)))?,
        ),
        None => None,
    };
    let conditions = match &req.conditions {
        Some(raw) => Some(parse_conditions(raw).map_err(ForumError::Validation)?),
        None => None,
    };

    let pool = state.conn.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<DbAutomodRule, ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let mut rule: DbAutomodRule = automod_rules::table
            .filter(automod_rules::id.eq(rule_id))
            .first(&mut conn)
            .map_err(|_| ForumError::NotFound("Rule not found".to_string()))?;
        let topic = load_topic(&mut conn, rule.topic_id)?;
        access::require_topic_moderator(&mut conn, &topic, &user)?;

        if let Some(name) = req.name {
            if name.trim().is_empty() {
                return Err(ForumError::Validation("Rule name is required".to_string()));
            }
            rule.name = name.trim().to_string();
        }
        if let Some(priority) = req.priority {
            rule.priority = priority;
        }
        if let Some(parsed) = conditions {
            rule.conditions = serde_json::to_value(&parsed)
                .map_err(|e| ForumError::Internal(e.to_string()))?;
        }
        if let Some(action) = action {
            rule.action = action.as_str().to_string();
        }
        if let Some(enabled) = req.enabled {
            rule.enabled = enabled;
        }
        rule.updated_at = Utc::now();

        diesel::update(automod_rules::table.filter(automod_rules::id.eq(rule_id)))
            .set(&rule)
            .execute(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))?;
        Ok(rule)
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok(Json(result))
}

pub async fn handle_delete_rule(
    State(state): State<Arc<AppState>>,
    AuthedUser(user): AuthedUser,
    Path(rule_id): Path<Uuid>,
) -> Result<StatusCode, ForumError> {
    let pool = state.conn.clone();

    tokio::task::spawn_blocking(move || -> Result<(), ForumError> {
        let mut conn = pool
            .get()
            .map_err(|e| ForumError::Database(e.to_string()))?;
        let rule: DbAutomodRule = automod_rules::table
            .filter(automod_rules::id.eq(rule_id))
            .first(&mut conn)
            .map_err(|_| ForumError::NotFound("Rule not found".to_string()))?;
        let topic = load_topic(&mut conn, rule.topic_id)?;
        access::require_topic_moderator(&mut conn, &topic, &user)?;

        diesel::delete(automod_rules::table.filter(automod_rules::id.eq(rule_id)))
            .execute(&mut conn)
            .map_err(|e| ForumError::Database(e.to_string()))?;
        Ok(())
    })
    .await
    .map_err(|e| ForumError::Internal(e.to_string()))??;

    Ok(StatusCode::NO_CONTENT)
}

pub fn configure_automod_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/automod", post(handle_create_rule))
        .route("/api/automod/topic/{topicId}", get(handle_list_topic_rules))
        .route(
            "/api/automod/{id}",
            get(handle_get_rule)
                .put(handle_update_rule)
                .delete(handle_delete_rule),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(priority: i32, created_offset_secs: i64, action: RuleAction, conditions: Vec<RuleCondition>) -> AutomodRule {
        let base = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        AutomodRule {
            id: Uuid::new_v4(),
            topic_id: Uuid::new_v4(),
            name: format!("rule-p{}", priority),
            enabled: true,
            priority,
            action: Some(action),
            conditions: Some(conditions),
            created_by: Uuid::new_v4(),
            created_at: base + chrono::Duration::seconds(created_offset_secs),
        }
    }

    fn ctx(karma: i64, age_days: i64) -> AuthorContext {
        AuthorContext {
            karma,
            account_age_days: age_days,
        }
    }

    #[test]
    fn test_parse_conditions_round_trip() {
        crate::tests::test_util::setup();
        let raw = serde_json::json!([
            { "kind": "content_contains", "keywords": ["spam", "scam"] },
            { "kind": "user_karma_below", "threshold": 10 },
            { "kind": "account_age_below", "days": 7 }
        ]);
        let parsed = crate::assert_ok!(parse_conditions(&raw));
        assert_eq!(parsed.len(), 3);
        assert_eq!(
            parsed[0],
            RuleCondition::ContentContains {
                keywords: vec!["spam".to_string(), "scam".to_string()]
            }
        );
    }

    #[test]
    fn test_parse_conditions_rejects_garbage() {
        crate::tests::test_util::setup();
        crate::assert_err!(parse_conditions(&serde_json::json!("not an array")));
        assert!(parse_conditions(&serde_json::json!([])).is_err());
        assert!(parse_conditions(&serde_json::json!([{ "kind": "llm_vibes" }])).is_err());
        assert!(
            parse_conditions(&serde_json::json!([{ "kind": "content_contains", "keywords": [] }]))
                .is_err()
        );
    }

    #[test]
    fn test_all_matching_rules_fire_in_priority_order() {
        let report = rule(
            1,
            0,
            RuleAction::Report,
            vec![RuleCondition::ContentContains {
                keywords: vec!["spam".to_string()],
            }],
        );
        let remove = rule(
            10,
            5,
            RuleAction::Remove,
            vec![RuleCondition::ContentContains {
                keywords: vec!["spam".to_string()],
            }],
        );
        // Matcher input is pre-sorted: priority desc, created_at asc.
        let rules = vec![remove.clone(), report.clone()];
        let matched = matching_rules(&rules, &ctx(100, 365), "pure SPAM here");
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].id, remove.id);
        assert_eq!(matched[1].id, report.id);
    }

    #[test]
    fn test_conditions_are_conjunctive() {
        let r = rule(
            0,
            0,
            RuleAction::Filter,
            vec![
                RuleCondition::ContentContains {
                    keywords: vec!["deal".to_string()],
                },
                RuleCondition::UserKarmaBelow { threshold: 10 },
            ],
        );
        let rules = vec![r];
        assert_eq!(matching_rules(&rules, &ctx(5, 30), "hot deal").len(), 1);
        assert!(matching_rules(&rules, &ctx(50, 30), "hot deal").is_empty());
        assert!(matching_rules(&rules, &ctx(5, 30), "no keyword").is_empty());
    }

    #[test]
    fn test_account_age_and_karma_thresholds_are_strict() {
        let r = rule(
            0,
            0,
            RuleAction::Report,
            vec![
                RuleCondition::UserKarmaBelow { threshold: 10 },
                RuleCondition::AccountAgeBelow { days: 7 },
            ],
        );
        let rules = vec![r];
        assert!(matching_rules(&rules, &ctx(10, 6), "x").is_empty());
        assert!(matching_rules(&rules, &ctx(9, 7), "x").is_empty());
        assert_eq!(matching_rules(&rules, &ctx(9, 6), "x").len(), 1);
    }

    #[test]
    fn test_malformed_rule_is_inert() {
        let db = DbAutomodRule {
            id: Uuid::new_v4(),
            topic_id: Uuid::new_v4(),
            name: "legacy".to_string(),
            enabled: true,
            priority: 100,
            conditions: serde_json::json!({ "keyword": "spam" }),
            action: "REMOVE".to_string(),
            created_by: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let parsed = AutomodRule::from(db);
        assert!(parsed.conditions.is_none());
        let rules = vec![parsed];
        assert!(matching_rules(&rules, &ctx(0, 0), "spam").is_empty());
    }

    #[test]
    fn test_matching_is_deterministic() {
        let rules = vec![
            rule(
                5,
                0,
                RuleAction::Remove,
                vec![RuleCondition::ContentContains {
                    keywords: vec!["spam".to_string()],
                }],
            ),
            rule(
                5,
                10,
                RuleAction::Report,
                vec![RuleCondition::UserKarmaBelow { threshold: 50 }],
            ),
        ];
        let context = ctx(10, 100);
        let first: Vec<Uuid> = matching_rules(&rules, &context, "spam spam")
            .iter()
            .map(|r| r.id)
            .collect();
        let second: Vec<Uuid> = matching_rules(&rules, &context, "spam spam")
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }
}
