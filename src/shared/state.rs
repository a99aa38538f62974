use std::sync::Arc;

use crate::config::AppConfig;
use crate::shared::utils::DbPool;
use crate::trending::TrendingCache;

pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub trending: Arc<TrendingCache>,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            config: self.config.clone(),
            trending: Arc::clone(&self.trending),
        }
    }
}

impl AppState {
    pub fn new(conn: DbPool, config: AppConfig) -> Self {
        let trending = Arc::new(TrendingCache::new(config.trending.cache_ttl_secs));
        Self {
            conn,
            config,
            trending,
        }
    }
}
