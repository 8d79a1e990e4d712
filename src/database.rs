//! PostgreSQL pool construction and startup migrations.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::Postgres as PostgresConfig;

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "matricula";
pub const DEFAULT_POOL_SIZE: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to PostgreSQL and apply pending migrations.
///
/// Registration inserts race on uniqueness constraints, so the schema must
/// be in place before the first request is accepted.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool, sqlx::Error> {
    let username = config.username.as_deref().unwrap_or(DEFAULT_CREDENTIALS);
    let password = config.password.as_deref().unwrap_or(DEFAULT_CREDENTIALS);
    let database = config.database.as_deref().unwrap_or(DEFAULT_DATABASE_NAME);
    let addr = format!(
        "postgres://{username}:{password}@{}/{database}",
        config.address
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size.unwrap_or(DEFAULT_POOL_SIZE))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&addr)
        .await?;

    sqlx::migrate!().run(&pool).await?;

    tracing::info!(address = %config.address, %database, "postgres connected");

    Ok(pool)
}
