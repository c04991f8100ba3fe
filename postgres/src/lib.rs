//! `PostgreSQL` storage for the funnel recovery engine.
//!
//! This crate implements every store trait from `funnel-recovery-core` on top
//! of sqlx:
//!
//! - [`PostgresEventStore`]: append-only `funnel_events` with idempotency keys
//!   and lazily paginated streams
//! - [`PostgresSessionStore`]: `session_states` with compare-and-swap saves
//! - [`PostgresCampaignStore`]: `recovery_campaigns` with a unique
//!   `(subject, attempt_number)` constraint and compare-and-swap updates
//! - [`PostgresAggregateStore`]: `daily_aggregates` as whole-row JSONB upserts
//!
//! All stores share one [`PgPool`]. Run [`migrate`] once at startup.
//!
//! # Example
//!
//! ```ignore
//! use funnel_recovery_postgres::{PostgresEventStore, connect, migrate};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect("postgres://localhost/funnel", 10).await?;
//!     migrate(&pool).await?;
//!     let events = PostgresEventStore::new(pool.clone());
//!     Ok(())
//! }
//! ```

mod aggregate_store;
mod campaign_store;
mod event_store;
mod session_store;

pub use aggregate_store::PostgresAggregateStore;
pub use campaign_store::PostgresCampaignStore;
pub use event_store::PostgresEventStore;
pub use session_store::PostgresSessionStore;

use funnel_recovery_core::error::StoreError;
pub use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Database(format!("Failed to connect: {e}")))
}

/// Create or upgrade the engine's tables.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))
}

pub(crate) fn db_error(context: &str, e: &sqlx::Error) -> StoreError {
    StoreError::Database(format!("{context}: {e}"))
}

pub(crate) fn decode_error(column: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization(format!("invalid {column}: {e}"))
}

/// `BIGINT` column value for an unsigned counter.
pub(crate) fn to_db(value: u64, column: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|e| decode_error(column, e))
}

/// Unsigned counter from a `BIGINT` column value.
pub(crate) fn from_db<T: TryFrom<i64>>(value: i64, column: &str) -> Result<T, StoreError>
where
    T::Error: std::fmt::Display,
{
    T::try_from(value).map_err(|e| decode_error(column, e))
}

/// Read a column, mapping decode failures to [`StoreError::Serialization`].
pub(crate) fn column<'r, T>(row: &'r sqlx::postgres::PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    use sqlx::Row;
    row.try_get(name).map_err(|e| decode_error(name, e))
}
