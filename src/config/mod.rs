#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub trending: TrendingConfig,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub username: String,
    pub password: String,
    pub server: String,
    pub port: u32,
    pub database: String,
}

#[derive(Clone)]
pub struct TrendingConfig {
    pub half_life_hours: f64,
    pub window_days: i64,
    pub cache_ttl_secs: u64,
}

impl AppConfig {
    pub fn database_url(&self) -> String {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            return url;
        }
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.database.username,
            self.database.password,
            self.database.server,
            self.database.port,
            self.database.database
        )
    }

    pub fn from_env() -> Self {
        let get_str = |key: &str, default: &str| -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };
        let get_u16 = |key: &str, default: u16| -> u16 {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        let get_u32 = |key: &str, default: u32| -> u32 {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        let get_u64 = |key: &str, default: u64| -> u64 {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        let get_f64 = |key: &str, default: f64| -> f64 {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        let get_i64 = |key: &str, default: i64| -> i64 {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };

        Self {
            server: ServerConfig {
                host: get_str("SERVER_HOST", "0.0.0.0"),
                port: get_u16("SERVER_PORT", 8080),
            },
            database: DatabaseConfig {
                username: get_str("DB_USER", "forum"),
                password: get_str("DB_PASSWORD", ""),
                server: get_str("DB_HOST", "localhost"),
                port: get_u32("DB_PORT", 5432),
                database: get_str("DB_NAME", "forumserver"),
            },
            trending: TrendingConfig {
                half_life_hours: get_f64("TRENDING_HALF_LIFE_HOURS", 24.0),
                window_days: get_i64("TRENDING_WINDOW_DAYS", 7),
                cache_ttl_secs: get_u64("TRENDING_CACHE_TTL_SECS", 60),
            },
        }
    }
}
