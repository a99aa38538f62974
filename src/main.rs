use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use dotenvy::dotenv;
use log::info;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use forumserver::automod::configure_automod_routes;
use forumserver::config::AppConfig;
use forumserver::mentions::configure_mention_routes;
use forumserver::moderation::configure_moderation_routes;
use forumserver::notifications::configure_notification_routes;
use forumserver::pipeline::configure_submission_routes;
use forumserver::shared::state::AppState;
use forumserver::shared::utils::{create_conn, run_migrations};
use forumserver::trending::configure_trending_routes;

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let db_ok = state.conn.get().is_ok();

    let status = if db_ok { "healthy" } else { "degraded" };
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(serde_json::json!({
            "status": status,
            "service": "forumserver",
            "version": env!("CARGO_PKG_VERSION"),
            "database": db_ok
        })),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = AppConfig::from_env();
    let database_url = config.database_url();
    let pool = create_conn(&database_url)?;
    run_migrations(&pool).map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let state = Arc::new(AppState::new(pool, config));

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(configure_automod_routes())
        .merge(configure_moderation_routes())
        .merge(configure_mention_routes())
        .merge(configure_notification_routes())
        .merge(configure_trending_routes())
        .merge(configure_submission_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("forumserver listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
