//! `funnel_events`: the append-only log.

use crate::{column, db_error, decode_error, from_db, to_db};
use async_stream::try_stream;
use chrono::{DateTime, Utc};
use funnel_recovery_core::error::StoreError;
use funnel_recovery_core::event::{Event, EventId, EventType, NewEvent};
use funnel_recovery_core::event_store::{Appended, EventStore};
use funnel_recovery_core::subject::{CustomerId, SubjectId, SubjectKey, SubjectType};
use futures::stream::BoxStream;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgRow;
use std::future::Future;
use std::pin::Pin;

/// Rows fetched per round trip while streaming.
const PAGE_SIZE: i64 = 500;

const EVENT_COLUMNS: &str =
    "id, subject_type, subject_id, customer_id, event_type, occurred_at, metadata, idempotency_key";

/// PostgreSQL-backed event log.
///
/// Streams are keyset-paginated on `(occurred_at, id)`: rows are fetched
/// [`PAGE_SIZE`] at a time as the consumer pulls, so replaying a long-lived
/// subject or a busy day never holds the whole result in memory.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Create an event store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn position_of(
        &self,
        subject: &SubjectKey,
        id: EventId,
    ) -> Result<Option<(DateTime<Utc>, i64)>, StoreError> {
        let id = to_db(id.value(), "id")?;
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT occurred_at FROM funnel_events
             WHERE id = $1 AND subject_type = $2 AND subject_id = $3",
        )
        .bind(id)
        .bind(subject.subject_type.as_str())
        .bind(subject.subject_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to resolve stream position", &e))?;
        Ok(row.map(|(occurred_at,)| (occurred_at, id)))
    }

    async fn subject_page(
        &self,
        subject: &SubjectKey,
        after: Option<(DateTime<Utc>, i64)>,
    ) -> Result<Vec<Event>, StoreError> {
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM funnel_events
             WHERE subject_type = $1 AND subject_id = $2
               AND ($3::timestamptz IS NULL OR (occurred_at, id) > ($3, $4))
             ORDER BY occurred_at, id
             LIMIT $5"
        );
        let rows = sqlx::query(&query)
            .bind(subject.subject_type.as_str())
            .bind(subject.subject_id.as_str())
            .bind(after.map(|(at, _)| at))
            .bind(after.map(|(_, id)| id))
            .bind(PAGE_SIZE)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load subject events", &e))?;
        rows.iter().map(event_from_row).collect()
    }

    async fn window_page(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        after: Option<(DateTime<Utc>, i64)>,
    ) -> Result<Vec<Event>, StoreError> {
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM funnel_events
             WHERE occurred_at >= $1 AND occurred_at < $2
               AND ($3::timestamptz IS NULL OR (occurred_at, id) > ($3, $4))
             ORDER BY occurred_at, id
             LIMIT $5"
        );
        let rows = sqlx::query(&query)
            .bind(from)
            .bind(to)
            .bind(after.map(|(at, _)| at))
            .bind(after.map(|(_, id)| id))
            .bind(PAGE_SIZE)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load events", &e))?;
        rows.iter().map(event_from_row).collect()
    }
}

fn cursor(event: &Event) -> Result<(DateTime<Utc>, i64), StoreError> {
    Ok((event.occurred_at, to_db(event.id.value(), "id")?))
}

fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    let id: i64 = column(row, "id")?;
    let subject_type: String = column(row, "subject_type")?;
    let subject_id: String = column(row, "subject_id")?;
    let customer_id: Option<String> = column(row, "customer_id")?;
    let event_type: String = column(row, "event_type")?;

    Ok(Event {
        id: EventId::new(from_db(id, "id")?),
        subject_type: subject_type
            .parse::<SubjectType>()
            .map_err(|e| decode_error("subject_type", e))?,
        subject_id: SubjectId::new(subject_id),
        customer_id: customer_id.map(CustomerId::new),
        event_type: event_type
            .parse::<EventType>()
            .map_err(|e| decode_error("event_type", e))?,
        occurred_at: column(row, "occurred_at")?,
        metadata: column::<Value>(row, "metadata")?,
        idempotency_key: column(row, "idempotency_key")?,
    })
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        event: NewEvent,
    ) -> Pin<Box<dyn Future<Output = Result<Appended, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let inserted: Option<(i64,)> = sqlx::query_as(
                "INSERT INTO funnel_events
                     (subject_type, subject_id, customer_id, event_type, occurred_at, metadata, idempotency_key)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (idempotency_key) DO NOTHING
                 RETURNING id",
            )
            .bind(event.subject_type.as_str())
            .bind(event.subject_id.as_str())
            .bind(event.customer_id.as_ref().map(CustomerId::as_str))
            .bind(event.event_type.as_str())
            .bind(event.occurred_at)
            .bind(&event.metadata)
            .bind(event.idempotency_key.as_deref())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to append event", &e))?;

            if let Some((id,)) = inserted {
                return Ok(Appended {
                    id: EventId::new(from_db(id, "id")?),
                    duplicate: false,
                });
            }

            // Only an idempotency key can conflict.
            let (id,): (i64,) =
                sqlx::query_as("SELECT id FROM funnel_events WHERE idempotency_key = $1")
                    .bind(event.idempotency_key.as_deref())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| db_error("Failed to load deduplicated event", &e))?;
            tracing::debug!(
                event_id = id,
                idempotency_key = ?event.idempotency_key,
                "Duplicate event ignored"
            );
            Ok(Appended {
                id: EventId::new(from_db(id, "id")?),
                duplicate: true,
            })
        })
    }

    fn query<'a>(
        &'a self,
        subject: &'a SubjectKey,
        since: Option<EventId>,
    ) -> BoxStream<'a, Result<Event, StoreError>> {
        Box::pin(try_stream! {
            // An unknown `since` replays from the start.
            let mut after = match since {
                Some(id) => self.position_of(subject, id).await?,
                None => None,
            };
            loop {
                let page = self.subject_page(subject, after).await?;
                let last_page = page.len() < usize::try_from(PAGE_SIZE).unwrap_or(usize::MAX);
                for event in page {
                    after = Some(cursor(&event)?);
                    yield event;
                }
                if last_page {
                    break;
                }
            }
        })
    }

    fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BoxStream<'_, Result<Event, StoreError>> {
        Box::pin(try_stream! {
            let mut after = None;
            loop {
                let page = self.window_page(from, to, after).await?;
                let last_page = page.len() < usize::try_from(PAGE_SIZE).unwrap_or(usize::MAX);
                for event in page {
                    after = Some(cursor(&event)?);
                    yield event;
                }
                if last_page {
                    break;
                }
            }
        })
    }
}
