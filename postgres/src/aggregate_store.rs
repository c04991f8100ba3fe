//! `daily_aggregates`: one JSONB document per local calendar day.

use crate::db_error;
use chrono::NaiveDate;
use funnel_recovery_core::aggregate::{AggregateStore, DailyAggregate};
use funnel_recovery_core::error::StoreError;
use sqlx::PgPool;
use sqlx::types::Json;
use std::future::Future;
use std::pin::Pin;

/// PostgreSQL-backed aggregate store.
///
/// Each row is written with a single `INSERT .. ON CONFLICT DO UPDATE`, so a
/// reader sees either the previous document or the new one, never a mix.
#[derive(Clone)]
pub struct PostgresAggregateStore {
    pool: PgPool,
}

impl PostgresAggregateStore {
    /// Create an aggregate store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl AggregateStore for PostgresAggregateStore {
    fn upsert<'a>(
        &'a self,
        aggregate: &'a DailyAggregate,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO daily_aggregates (date, timezone, data)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (date) DO UPDATE
                 SET timezone = EXCLUDED.timezone, data = EXCLUDED.data",
            )
            .bind(aggregate.date)
            .bind(&aggregate.timezone)
            .bind(Json(aggregate))
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to upsert daily aggregate", &e))?;
            Ok(())
        })
    }

    fn get(
        &self,
        date: NaiveDate,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DailyAggregate>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let row: Option<(Json<DailyAggregate>,)> =
                sqlx::query_as("SELECT data FROM daily_aggregates WHERE date = $1")
                    .bind(date)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| db_error("Failed to load daily aggregate", &e))?;
            Ok(row.map(|(Json(aggregate),)| aggregate))
        })
    }

    fn list(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DailyAggregate>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows: Vec<(Json<DailyAggregate>,)> = sqlx::query_as(
                "SELECT data FROM daily_aggregates WHERE date >= $1 AND date <= $2 ORDER BY date",
            )
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list daily aggregates", &e))?;
            Ok(rows.into_iter().map(|(Json(aggregate),)| aggregate).collect())
        })
    }
}
