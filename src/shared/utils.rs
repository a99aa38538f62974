use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub const DEFAULT_PAGE_SIZE: i64 = 25;
pub const MAX_PAGE_SIZE: i64 = 100;

pub fn create_conn(database_url: &str) -> Result<DbPool, diesel::r2d2::PoolError> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder().build(manager)
}

/// Run database migrations
pub fn run_migrations(pool: &DbPool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

    const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

    let mut conn = pool.get()?;
    conn.run_pending_migrations(MIGRATIONS).map_err(
        |e| -> Box<dyn std::error::Error + Send + Sync> {
            Box::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Migration error: {}", e),
            ))
        },
    )?;
    Ok(())
}

/// Translate 1-based page/limit query params into an (offset, limit) pair.
/// Out-of-range values are clamped rather than rejected.
pub fn page_to_offset(page: Option<i64>, limit: Option<i64>) -> (i64, i64) {
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let page = page.unwrap_or(1).max(1);
    ((page - 1) * limit, limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_to_offset_defaults() {
        assert_eq!(page_to_offset(None, None), (0, DEFAULT_PAGE_SIZE));
    }

    #[test]
    fn test_page_to_offset_clamps() {
        assert_eq!(page_to_offset(Some(0), Some(-3)), (0, 1));
        assert_eq!(page_to_offset(Some(3), Some(10)), (20, 10));
        assert_eq!(page_to_offset(Some(2), Some(5000)), (MAX_PAGE_SIZE, MAX_PAGE_SIZE));
    }
}
