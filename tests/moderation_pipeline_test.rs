#[cfg(test)]
mod moderation_pipeline_integration_tests {
    use axum::extract::{Path, Query, State};
    use chrono::Utc;
    use diesel::prelude::*;
    use std::sync::Arc;
    use uuid::Uuid;

    use forumserver::access::AuthedUser;
    use forumserver::automod::{handle_create_rule, handle_delete_rule, CreateRuleRequest};
    use forumserver::config::AppConfig;
    use forumserver::mentions;
    use forumserver::pipeline::{handle_submit_post, SubmitContentRequest};
    use forumserver::shared::error::ForumError;
    use forumserver::shared::models::{DbTopic, DbUser};
    use forumserver::shared::schema::{mentions as mentions_table, mod_log, notifications, posts, topics, users};
    use forumserver::shared::state::AppState;
    use forumserver::shared::utils::{create_conn, run_migrations, DbPool};
    use forumserver::trending::{handle_trending_topics, TrendingQuery, MAX_TRENDING_LIMIT};

    fn test_state() -> Option<Arc<AppState>> {
        // Skip test if Postgres is not available
        let url = match std::env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                println!("Skipping test - DATABASE_URL not set");
                return None;
            }
        };
        let pool = match create_conn(&url) {
            Ok(pool) => pool,
            Err(_) => {
                println!("Skipping test - cannot build pool");
                return None;
            }
        };
        if pool.get().is_err() {
            println!("Skipping test - cannot connect to Postgres");
            return None;
        }
        if let Err(e) = run_migrations(&pool) {
            println!("Skipping test - migrations failed: {}", e);
            return None;
        }
        Some(Arc::new(AppState::new(pool, AppConfig::from_env())))
    }

    fn seed_user(pool: &DbPool, prefix: &str, superuser: bool) -> DbUser {
        let mut conn = pool.get().unwrap();
        let user = DbUser {
            id: Uuid::new_v4(),
            username: format!("{}_{}", prefix, &Uuid::new_v4().simple().to_string()[..8]),
            post_cred: 10,
            comment_cred: 10,
            is_superuser: superuser,
            created_at: Utc::now(),
        };
        diesel::insert_into(users::table)
            .values(&user)
            .execute(&mut conn)
            .unwrap();
        user
    }

    fn seed_topic(pool: &DbPool, owner: &DbUser) -> DbTopic {
        let mut conn = pool.get().unwrap();
        let topic = DbTopic {
            id: Uuid::new_v4(),
            name: format!("topic_{}", &Uuid::new_v4().simple().to_string()[..8]),
            owner_id: owner.id,
            trending_score: 0.0,
            last_activity_at: Utc::now(),
            created_at: Utc::now(),
        };
        diesel::insert_into(topics::table)
            .values(&topic)
            .execute(&mut conn)
            .unwrap();
        topic
    }

    fn seed_member(pool: &DbPool, topic: &DbTopic, user: &DbUser, banned: bool) {
        use forumserver::shared::models::DbTopicMember;
        use forumserver::shared::schema::topic_members;
        let mut conn = pool.get().unwrap();
        let member = DbTopicMember {
            id: Uuid::new_v4(),
            topic_id: topic.id,
            user_id: user.id,
            role: "MEMBER".to_string(),
            is_banned: banned,
            joined_at: Utc::now(),
        };
        diesel::insert_into(topic_members::table)
            .values(&member)
            .execute(&mut conn)
            .unwrap();
    }

    #[tokio::test]
    async fn test_remove_rule_fires_and_is_audited() {
        let Some(state) = test_state() else { return };
        let owner = seed_user(&state.conn, "owner", false);
        let author = seed_user(&state.conn, "author", false);
        let topic = seed_topic(&state.conn, &owner);

        let (status, _) = handle_create_rule(
            State(Arc::clone(&state)),
            AuthedUser(owner.clone()),
            axum::Json(CreateRuleRequest {
                topic_id: topic.id,
                name: "no spam".to_string(),
                priority: Some(10),
                conditions: serde_json::json!([
                    { "kind": "content_contains", "keywords": ["spam"] }
                ]),
                action: "REMOVE".to_string(),
                enabled: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, axum::http::StatusCode::CREATED);

        let (status, axum::Json(post)) = handle_submit_post(
            State(Arc::clone(&state)),
            AuthedUser(author.clone()),
            Path(topic.id),
            axum::Json(SubmitContentRequest {
                body: "buy my SPAM today".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, axum::http::StatusCode::CREATED);
        assert_eq!(post.moderation_state, "REMOVED");

        let mut conn = state.conn.get().unwrap();
        let entries: Vec<(Uuid, String)> = mod_log::table
            .filter(mod_log::topic_id.eq(topic.id))
            .filter(mod_log::target_id.eq(post.id))
            .select((mod_log::moderator_id, mod_log::action))
            .load(&mut conn)
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, owner.id, "automated action attributed to rule creator");
        assert_eq!(entries[0].1, "REMOVE");
    }

    #[tokio::test]
    async fn test_banned_member_is_rejected_without_side_effects() {
        let Some(state) = test_state() else { return };
        let owner = seed_user(&state.conn, "owner", false);
        let banned = seed_user(&state.conn, "banned", false);
        let topic = seed_topic(&state.conn, &owner);
        seed_member(&state.conn, &topic, &banned, true);

        let err = handle_submit_post(
            State(Arc::clone(&state)),
            AuthedUser(banned.clone()),
            Path(topic.id),
            axum::Json(SubmitContentRequest {
                body: format!("hello @{}", owner.username),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ForumError::Forbidden(_)));

        let mut conn = state.conn.get().unwrap();
        let post_count: i64 = posts::table
            .filter(posts::topic_id.eq(topic.id))
            .count()
            .get_result(&mut conn)
            .unwrap();
        assert_eq!(post_count, 0);
        let mention_count: i64 = mentions_table::table
            .filter(mentions_table::mentioner_id.eq(banned.id))
            .count()
            .get_result(&mut conn)
            .unwrap();
        assert_eq!(mention_count, 0);
        let log_count: i64 = mod_log::table
            .filter(mod_log::topic_id.eq(topic.id))
            .count()
            .get_result(&mut conn)
            .unwrap();
        assert_eq!(log_count, 0);
    }

    #[tokio::test]
    async fn test_mentions_create_one_row_and_one_notification() {
        let Some(state) = test_state() else { return };
        let owner = seed_user(&state.conn, "owner", false);
        let alice = seed_user(&state.conn, "alice", false);
        let bob = seed_user(&state.conn, "bob", false);
        let topic = seed_topic(&state.conn, &owner);
        seed_member(&state.conn, &topic, &alice, false);
        seed_member(&state.conn, &topic, &bob, false);

        let (_, axum::Json(post)) = handle_submit_post(
            State(Arc::clone(&state)),
            AuthedUser(alice.clone()),
            Path(topic.id),
            axum::Json(SubmitContentRequest {
                // A self-mention and an e-mail must produce nothing.
                body: format!(
                    "ping @{} and @{} but not me@example.com",
                    bob.username, alice.username
                ),
            }),
        )
        .await
        .unwrap();

        let mut conn = state.conn.get().unwrap();
        let rows: Vec<mentions::DbMention> = mentions_table::table
            .filter(mentions_table::post_id.eq(post.id))
            .load(&mut conn)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].mentioner_id, alice.id);
        assert_eq!(rows[0].mentioned_id, bob.id);

        let notif_count: i64 = notifications::table
            .filter(notifications::user_id.eq(bob.id))
            .filter(notifications::kind.eq("MENTION"))
            .count()
            .get_result(&mut conn)
            .unwrap();
        assert_eq!(notif_count, 1);
    }

    #[tokio::test]
    async fn test_deleted_rule_no_longer_fires() {
        let Some(state) = test_state() else { return };
        let owner = seed_user(&state.conn, "owner", false);
        let author = seed_user(&state.conn, "author", false);
        let topic = seed_topic(&state.conn, &owner);

        let (_, axum::Json(rule)) = handle_create_rule(
            State(Arc::clone(&state)),
            AuthedUser(owner.clone()),
            axum::Json(CreateRuleRequest {
                topic_id: topic.id,
                name: "no scams".to_string(),
                priority: None,
                conditions: serde_json::json!([
                    { "kind": "content_contains", "keywords": ["scam"] }
                ]),
                action: "FILTER".to_string(),
                enabled: None,
            }),
        )
        .await
        .unwrap();

        let status = handle_delete_rule(
            State(Arc::clone(&state)),
            AuthedUser(owner.clone()),
            Path(rule.id),
        )
        .await
        .unwrap();
        assert_eq!(status, axum::http::StatusCode::NO_CONTENT);

        let (_, axum::Json(post)) = handle_submit_post(
            State(Arc::clone(&state)),
            AuthedUser(author.clone()),
            Path(topic.id),
            axum::Json(SubmitContentRequest {
                body: "a scam that no rule watches anymore".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(post.moderation_state, "ACTIVE");

        let mut conn = state.conn.get().unwrap();
        let log_count: i64 = mod_log::table
            .filter(mod_log::target_id.eq(post.id))
            .count()
            .get_result(&mut conn)
            .unwrap();
        assert_eq!(log_count, 0);
    }

    #[tokio::test]
    async fn test_trending_is_idempotent_and_clamps_limits() {
        let Some(state) = test_state() else { return };
        let owner = seed_user(&state.conn, "owner", false);
        let author = seed_user(&state.conn, "author", false);
        let topic = seed_topic(&state.conn, &owner);

        handle_submit_post(
            State(Arc::clone(&state)),
            AuthedUser(author.clone()),
            Path(topic.id),
            axum::Json(SubmitContentRequest {
                body: "fresh activity".to_string(),
            }),
        )
        .await
        .unwrap();

        let axum::Json(first) = handle_trending_topics(
            State(Arc::clone(&state)),
            Query(TrendingQuery {
                limit: Some("1000".to_string()),
            }),
        )
        .await
        .unwrap();
        let axum::Json(second) = handle_trending_topics(
            State(Arc::clone(&state)),
            Query(TrendingQuery {
                limit: Some("1000".to_string()),
            }),
        )
        .await
        .unwrap();

        assert!(first.len() <= MAX_TRENDING_LIMIT);
        let first_ids: Vec<Uuid> = first.iter().map(|r| r.topic_id).collect();
        let second_ids: Vec<Uuid> = second.iter().map(|r| r.topic_id).collect();
        assert_eq!(first_ids, second_ids, "no new activity, same ranking");
        assert!(first_ids.contains(&topic.id));

        // Garbage limits fall back to the default instead of erroring.
        let axum::Json(lenient) = handle_trending_topics(
            State(Arc::clone(&state)),
            Query(TrendingQuery {
                limit: Some("invalid".to_string()),
            }),
        )
        .await
        .unwrap();
        assert!(!lenient.is_empty());
    }
}
