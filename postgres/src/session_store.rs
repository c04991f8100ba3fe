//! `session_states`: one row per subject, compare-and-swap on `version`.

use crate::{column, db_error, decode_error, from_db, to_db};
use chrono::{DateTime, Utc};
use funnel_recovery_core::error::StoreError;
use funnel_recovery_core::event::EventId;
use funnel_recovery_core::query::{Page, SessionQuery};
use funnel_recovery_core::session::{SessionState, SessionStateStore, SessionStatus};
use funnel_recovery_core::subject::{CustomerId, SubjectId, SubjectKey, SubjectType, Version};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::future::Future;
use std::pin::Pin;

const STATE_COLUMNS: &str = "subject_type, subject_id, customer_id, status, theme, photo_count, \
     item_present, in_checkout, eligible_for_abandonment, created_at, last_activity_at, \
     abandoned_at, converted_at, closed_at, updated_at, last_event_id, last_event_at, version";

/// PostgreSQL-backed session state store.
#[derive(Clone)]
pub struct PostgresSessionStore {
    pool: PgPool,
}

impl PostgresSessionStore {
    /// Create a session store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn stored_version(&self, key: &SubjectKey) -> Result<Version, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT version FROM session_states WHERE subject_type = $1 AND subject_id = $2",
        )
        .bind(key.subject_type.as_str())
        .bind(key.subject_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to read session version", &e))?;
        match row {
            Some((version,)) => Ok(Version::new(from_db(version, "version")?)),
            None => Ok(Version::INITIAL),
        }
    }
}

/// Bind `$1..=$18`: every column in [`STATE_COLUMNS`] order, with `next` as the version.
fn bind_state<'q>(
    query: Query<'q, Postgres, PgArguments>,
    state: &'q SessionState,
    next: Version,
) -> Result<Query<'q, Postgres, PgArguments>, StoreError> {
    let last_event_id = state
        .last_event_id
        .map(|id| to_db(id.value(), "last_event_id"))
        .transpose()?;
    Ok(query
        .bind(state.subject_type.as_str())
        .bind(state.subject_id.as_str())
        .bind(state.customer_id.as_ref().map(CustomerId::as_str))
        .bind(state.status.as_str())
        .bind(state.theme.as_deref())
        .bind(i64::from(state.photo_count))
        .bind(state.item_present)
        .bind(state.in_checkout)
        .bind(state.eligible_for_abandonment)
        .bind(state.created_at)
        .bind(state.last_activity_at)
        .bind(state.abandoned_at)
        .bind(state.converted_at)
        .bind(state.closed_at)
        .bind(state.updated_at)
        .bind(last_event_id)
        .bind(state.last_event_at)
        .bind(to_db(next.value(), "version")?))
}

fn state_from_row(row: &PgRow) -> Result<SessionState, StoreError> {
    let subject_type: String = column(row, "subject_type")?;
    let subject_id: String = column(row, "subject_id")?;
    let customer_id: Option<String> = column(row, "customer_id")?;
    let status: String = column(row, "status")?;
    let photo_count: i64 = column(row, "photo_count")?;
    let last_event_id: Option<i64> = column(row, "last_event_id")?;
    let version: i64 = column(row, "version")?;

    Ok(SessionState {
        subject_type: subject_type
            .parse::<SubjectType>()
            .map_err(|e| decode_error("subject_type", e))?,
        subject_id: SubjectId::new(subject_id),
        customer_id: customer_id.map(CustomerId::new),
        status: status.parse::<SessionStatus>()?,
        theme: column(row, "theme")?,
        photo_count: from_db(photo_count, "photo_count")?,
        item_present: column(row, "item_present")?,
        in_checkout: column(row, "in_checkout")?,
        eligible_for_abandonment: column(row, "eligible_for_abandonment")?,
        created_at: column(row, "created_at")?,
        last_activity_at: column(row, "last_activity_at")?,
        abandoned_at: column(row, "abandoned_at")?,
        converted_at: column(row, "converted_at")?,
        closed_at: column(row, "closed_at")?,
        updated_at: column(row, "updated_at")?,
        last_event_id: last_event_id
            .map(|id| from_db(id, "last_event_id").map(EventId::new))
            .transpose()?,
        last_event_at: column(row, "last_event_at")?,
        version: Version::new(from_db(version, "version")?),
    })
}

fn push_filters<'a>(builder: &mut QueryBuilder<'a, Postgres>, query: &SessionQuery) {
    builder.push(" WHERE TRUE");
    if let Some(subject_type) = query.subject_type {
        builder.push(" AND subject_type = ").push_bind(subject_type.as_str());
    }
    if let Some(status) = query.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(from) = query.updated_from {
        builder.push(" AND updated_at >= ").push_bind(from);
    }
    if let Some(to) = query.updated_to {
        builder.push(" AND updated_at < ").push_bind(to);
    }
}

impl SessionStateStore for PostgresSessionStore {
    fn load<'a>(
        &'a self,
        key: &'a SubjectKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SessionState>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {STATE_COLUMNS} FROM session_states WHERE subject_type = $1 AND subject_id = $2"
            );
            let row = sqlx::query(&query)
                .bind(key.subject_type.as_str())
                .bind(key.subject_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_error("Failed to load session state", &e))?;
            row.as_ref().map(state_from_row).transpose()
        })
    }

    fn save<'a>(
        &'a self,
        state: &'a SessionState,
    ) -> Pin<Box<dyn Future<Output = Result<Version, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let expected = state.version;
            let next = expected.next();

            let result = if expected == Version::INITIAL {
                let insert = format!(
                    "INSERT INTO session_states ({STATE_COLUMNS})
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                     ON CONFLICT (subject_type, subject_id) DO NOTHING"
                );
                bind_state(sqlx::query(&insert), state, next)?
                    .execute(&self.pool)
                    .await
            } else {
                bind_state(
                    sqlx::query(
                        "UPDATE session_states SET
                             customer_id = $3, status = $4, theme = $5, photo_count = $6,
                             item_present = $7, in_checkout = $8, eligible_for_abandonment = $9,
                             created_at = $10, last_activity_at = $11, abandoned_at = $12,
                             converted_at = $13, closed_at = $14, updated_at = $15,
                             last_event_id = $16, last_event_at = $17, version = $18
                         WHERE subject_type = $1 AND subject_id = $2 AND version = $19",
                    ),
                    state,
                    next,
                )?
                .bind(to_db(expected.value(), "version")?)
                .execute(&self.pool)
                .await
            };
            let result = result.map_err(|e| db_error("Failed to save session state", &e))?;

            if result.rows_affected() == 1 {
                return Ok(next);
            }

            let key = state.key();
            let actual = self.stored_version(&key).await?;
            tracing::debug!(subject = %key, %expected, %actual, "Session state save lost a race");
            Err(StoreError::ConcurrencyConflict {
                entity: "session_state",
                id: key.to_string(),
                expected,
                actual,
            })
        })
    }

    fn abandonment_candidates(
        &self,
        subject_type: SubjectType,
        inactive_since: DateTime<Utc>,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SessionState>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {STATE_COLUMNS} FROM session_states
                 WHERE subject_type = $1
                   AND status = 'in_progress'
                   AND eligible_for_abandonment
                   AND last_activity_at < $2
                 ORDER BY last_activity_at, subject_id
                 LIMIT $3"
            );
            let rows = sqlx::query(&query)
                .bind(subject_type.as_str())
                .bind(inactive_since)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_error("Failed to list abandonment candidates", &e))?;
            rows.iter().map(state_from_row).collect()
        })
    }

    fn unscheduled_abandonments(
        &self,
        subject_type: SubjectType,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SessionState>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {STATE_COLUMNS} FROM session_states s
                 WHERE s.subject_type = $1
                   AND s.status = 'abandoned'
                   AND NOT EXISTS (
                       SELECT 1 FROM recovery_campaigns c
                       WHERE c.subject_type = s.subject_type
                         AND c.subject_id = s.subject_id
                         AND c.attempt_number = 1
                   )
                 ORDER BY s.abandoned_at, s.subject_id
                 LIMIT $2"
            );
            let rows = sqlx::query(&query)
                .bind(subject_type.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_error("Failed to list unscheduled abandonments", &e))?;
            rows.iter().map(state_from_row).collect()
        })
    }

    fn list<'a>(
        &'a self,
        query: &'a SessionQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Page<SessionState>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM session_states");
            push_filters(&mut count, query);
            let (total,): (i64,) = count
                .build_query_as()
                .fetch_one(&self.pool)
                .await
                .map_err(|e| db_error("Failed to count session states", &e))?;

            let limit = query.page.effective_limit();
            let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {STATE_COLUMNS} FROM session_states"));
            push_filters(&mut select, query);
            select
                .push(" ORDER BY updated_at DESC, subject_type, subject_id LIMIT ")
                .push_bind(i64::from(limit))
                .push(" OFFSET ")
                .push_bind(i64::from(query.page.offset));
            let rows = select
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_error("Failed to list session states", &e))?;

            Ok(Page {
                items: rows.iter().map(state_from_row).collect::<Result<_, _>>()?,
                total: from_db(total, "count")?,
                offset: query.page.offset,
                limit,
            })
        })
    }
}
