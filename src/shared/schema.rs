diesel::table! {
    users (id) {
        id -> Uuid,
        username -> Varchar,
        post_cred -> Int4,
        comment_cred -> Int4,
        is_superuser -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    topics (id) {
        id -> Uuid,
        name -> Varchar,
        owner_id -> Uuid,
        trending_score -> Float8,
        last_activity_at -> Timestamptz,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    topic_members (id) {
        id -> Uuid,
        topic_id -> Uuid,
        user_id -> Uuid,
        role -> Varchar,
        is_banned -> Bool,
        joined_at -> Timestamptz,
    }
}

diesel::table! {
    posts (id) {
        id -> Uuid,
        topic_id -> Uuid,
        author_id -> Uuid,
        body -> Text,
        moderation_state -> Varchar,
        is_locked -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    comments (id) {
        id -> Uuid,
        post_id -> Uuid,
        author_id -> Uuid,
        body -> Text,
        moderation_state -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    automod_rules (id) {
        id -> Uuid,
        topic_id -> Uuid,
        name -> Varchar,
        enabled -> Bool,
        priority -> Int4,
        conditions -> Jsonb,
        action -> Varchar,
        created_by -> Uuid,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    mod_log (id) {
        id -> Uuid,
        topic_id -> Uuid,
        moderator_id -> Uuid,
        action -> Varchar,
        target_type -> Varchar,
        target_id -> Uuid,
        reason -> Nullable<Text>,
        details -> Nullable<Jsonb>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    mentions (id) {
        id -> Uuid,
        mentioner_id -> Uuid,
        mentioned_id -> Uuid,
        post_id -> Nullable<Uuid>,
        comment_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    notifications (id) {
        id -> Uuid,
        user_id -> Uuid,
        kind -> Varchar,
        related_id -> Nullable<Uuid>,
        message -> Text,
        status -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    reports (id) {
        id -> Uuid,
        topic_id -> Uuid,
        target_type -> Varchar,
        target_id -> Uuid,
        reporter_id -> Uuid,
        reason -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    activity_events (id) {
        id -> Uuid,
        topic_id -> Uuid,
        post_id -> Nullable<Uuid>,
        kind -> Varchar,
        weight -> Float8,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    users,
    topics,
    topic_members,
    posts,
    comments,
    automod_rules,
    mod_log,
    mentions,
    notifications,
    reports,
    activity_events,
);
