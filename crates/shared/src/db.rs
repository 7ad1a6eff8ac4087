//! Database utilities and connection management

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::{str::FromStr, time::Duration};

/// SQLSTATE for `unique_violation`
pub const PG_UNIQUE_VIOLATION: &str = "23505";

/// SQLSTATE for `undefined_column`
pub const PG_UNDEFINED_COLUMN: &str = "42703";

/// Create a database connection pool
/// Note: Disables statement cache for PgBouncer compatibility
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    // PgBouncer in transaction mode doesn't support prepared statements
    let options = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(60))
        .max_lifetime(Duration::from_secs(300))
        .connect_with(options)
        .await
}

/// Create a database connection pool for migrations with longer timeout
/// Uses single connection since migrations run sequentially
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let options = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

    PgPoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(120))
        .idle_timeout(Duration::from_secs(30))
        .max_lifetime(Duration::from_secs(180))
        .connect_with(options)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

/// Classification of a PostgreSQL failure that callers react to differently
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgFailure {
    /// Unique constraint violated; carries the constraint name when the server reports it
    UniqueViolation(Option<String>),
    /// A column referenced by the statement does not exist in this deployment
    UndefinedColumn(String),
    /// Anything else
    Other,
}

/// Classify a sqlx error by its SQLSTATE
pub fn classify(err: &sqlx::Error) -> PgFailure {
    let sqlx::Error::Database(db_err) = err else {
        return PgFailure::Other;
    };

    match db_err.code().as_deref() {
        Some(PG_UNIQUE_VIOLATION) => {
            PgFailure::UniqueViolation(db_err.constraint().map(str::to_string))
        }
        Some(PG_UNDEFINED_COLUMN) => {
            PgFailure::UndefinedColumn(undefined_column_name(db_err.message()))
        }
        _ => PgFailure::Other,
    }
}

/// Pull the column name out of `column "foo" of relation "bar" does not exist`
/// or `column "foo" does not exist`.
fn undefined_column_name(message: &str) -> String {
    message
        .split('"')
        .nth(1)
        .map(|name| name.rsplit('.').next().unwrap_or(name).to_string())
        .unwrap_or_default()
}
