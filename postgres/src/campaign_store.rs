//! `recovery_campaigns`: one row per recovery email attempt.

use crate::{column, db_error, decode_error, from_db, to_db};
use chrono::{DateTime, Utc};
use funnel_recovery_core::campaign::{
    CampaignId, CampaignStatus, CampaignStore, CampaignType, RecoveryCampaign,
};
use funnel_recovery_core::error::StoreError;
use funnel_recovery_core::query::{CampaignQuery, Page};
use funnel_recovery_core::subject::{CustomerId, SubjectId, SubjectKey, SubjectType, Version};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

const CAMPAIGN_COLUMNS: &str = "id, subject_type, subject_id, customer_id, campaign_type, \
     attempt_number, status, scheduled_at, sent_at, opened_at, clicked_at, converted_at, \
     cancelled_at, discount_code, delivery_id, failure_count, last_error, created_at, version";

/// PostgreSQL-backed campaign store.
///
/// The unique `(subject_type, subject_id, attempt_number)` constraint makes
/// [`CampaignStore::insert`] idempotent: two detectors or two send ticks
/// racing to schedule the same attempt produce one row.
#[derive(Clone)]
pub struct PostgresCampaignStore {
    pool: PgPool,
}

impl PostgresCampaignStore {
    /// Create a campaign store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(
        &self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Vec<RecoveryCampaign>, StoreError> {
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load campaigns", &e))?;
        rows.iter().map(campaign_from_row).collect()
    }
}

fn select_sql(tail: &str) -> String {
    format!("SELECT {CAMPAIGN_COLUMNS} FROM recovery_campaigns {tail}")
}

/// Bind `$1..=$19` in [`CAMPAIGN_COLUMNS`] order, with `version` last.
fn bind_campaign<'q>(
    query: Query<'q, Postgres, PgArguments>,
    campaign: &'q RecoveryCampaign,
    version: Version,
) -> Result<Query<'q, Postgres, PgArguments>, StoreError> {
    Ok(query
        .bind(*campaign.id.as_uuid())
        .bind(campaign.subject_type.as_str())
        .bind(campaign.subject_id.as_str())
        .bind(campaign.customer_id.as_ref().map(CustomerId::as_str))
        .bind(campaign.campaign_type.as_str())
        .bind(i64::from(campaign.attempt_number))
        .bind(campaign.status.as_str())
        .bind(campaign.scheduled_at)
        .bind(campaign.sent_at)
        .bind(campaign.opened_at)
        .bind(campaign.clicked_at)
        .bind(campaign.converted_at)
        .bind(campaign.cancelled_at)
        .bind(campaign.discount_code.as_deref())
        .bind(campaign.delivery_id.as_deref())
        .bind(i64::from(campaign.failure_count))
        .bind(campaign.last_error.as_deref())
        .bind(campaign.created_at)
        .bind(to_db(version.value(), "version")?))
}

fn campaign_from_row(row: &PgRow) -> Result<RecoveryCampaign, StoreError> {
    let id: Uuid = column(row, "id")?;
    let subject_type: String = column(row, "subject_type")?;
    let subject_id: String = column(row, "subject_id")?;
    let customer_id: Option<String> = column(row, "customer_id")?;
    let campaign_type: String = column(row, "campaign_type")?;
    let attempt_number: i64 = column(row, "attempt_number")?;
    let status: String = column(row, "status")?;
    let failure_count: i64 = column(row, "failure_count")?;
    let version: i64 = column(row, "version")?;

    Ok(RecoveryCampaign {
        id: CampaignId::from_uuid(id),
        subject_type: subject_type
            .parse::<SubjectType>()
            .map_err(|e| decode_error("subject_type", e))?,
        subject_id: SubjectId::new(subject_id),
        customer_id: customer_id.map(CustomerId::new),
        campaign_type: campaign_type.parse::<CampaignType>()?,
        attempt_number: from_db(attempt_number, "attempt_number")?,
        status: status.parse::<CampaignStatus>()?,
        scheduled_at: column(row, "scheduled_at")?,
        sent_at: column(row, "sent_at")?,
        opened_at: column(row, "opened_at")?,
        clicked_at: column(row, "clicked_at")?,
        converted_at: column(row, "converted_at")?,
        cancelled_at: column(row, "cancelled_at")?,
        discount_code: column(row, "discount_code")?,
        delivery_id: column(row, "delivery_id")?,
        failure_count: from_db(failure_count, "failure_count")?,
        last_error: column(row, "last_error")?,
        created_at: column(row, "created_at")?,
        version: Version::new(from_db(version, "version")?),
    })
}

fn push_filters<'a>(builder: &mut QueryBuilder<'a, Postgres>, query: &'a CampaignQuery) {
    builder.push(" WHERE TRUE");
    if let Some(campaign_type) = query.campaign_type {
        builder.push(" AND campaign_type = ").push_bind(campaign_type.as_str());
    }
    if let Some(status) = query.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(subject) = &query.subject {
        builder
            .push(" AND subject_type = ")
            .push_bind(subject.subject_type.as_str())
            .push(" AND subject_id = ")
            .push_bind(subject.subject_id.as_str());
    }
    if let Some(from) = query.sent_from {
        builder.push(" AND sent_at >= ").push_bind(from);
    }
    if let Some(to) = query.sent_to {
        builder.push(" AND sent_at < ").push_bind(to);
    }
}

impl CampaignStore for PostgresCampaignStore {
    fn insert<'a>(
        &'a self,
        campaign: &'a RecoveryCampaign,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let insert = format!(
                "INSERT INTO recovery_campaigns ({CAMPAIGN_COLUMNS})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
                 ON CONFLICT (subject_type, subject_id, attempt_number) DO NOTHING"
            );
            let result = bind_campaign(sqlx::query(&insert), campaign, campaign.version)?
                .execute(&self.pool)
                .await
                .map_err(|e| db_error("Failed to insert campaign", &e))?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn get(
        &self,
        id: CampaignId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RecoveryCampaign>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let sql = select_sql("WHERE id = $1");
            let rows = self.fetch(sqlx::query(&sql).bind(*id.as_uuid())).await?;
            Ok(rows.into_iter().next())
        })
    }

    fn update<'a>(
        &'a self,
        campaign: &'a RecoveryCampaign,
    ) -> Pin<Box<dyn Future<Output = Result<Version, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let expected = campaign.version;
            let next = expected.next();
            let result = bind_campaign(
                sqlx::query(
                    "UPDATE recovery_campaigns SET
                         customer_id = $4, status = $7, scheduled_at = $8, sent_at = $9,
                         opened_at = $10, clicked_at = $11, converted_at = $12, cancelled_at = $13,
                         discount_code = $14, delivery_id = $15, failure_count = $16,
                         last_error = $17, created_at = $18, version = $19
                     WHERE id = $1 AND version = $20
                       AND subject_type = $2 AND subject_id = $3 AND campaign_type = $5
                       AND attempt_number = $6",
                ),
                campaign,
                next,
            )?
            .bind(to_db(expected.value(), "version")?)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to update campaign", &e))?;

            if result.rows_affected() == 1 {
                return Ok(next);
            }

            let stored: Option<(i64,)> =
                sqlx::query_as("SELECT version FROM recovery_campaigns WHERE id = $1")
                    .bind(*campaign.id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| db_error("Failed to read campaign version", &e))?;
            match stored {
                None => Err(StoreError::NotFound {
                    entity: "recovery_campaign",
                    id: campaign.id.to_string(),
                }),
                Some((actual,)) => Err(StoreError::ConcurrencyConflict {
                    entity: "recovery_campaign",
                    id: campaign.id.to_string(),
                    expected,
                    actual: Version::new(from_db(actual, "version")?),
                }),
            }
        })
    }

    fn due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecoveryCampaign>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let sql = select_sql(
                "WHERE status = 'scheduled' AND scheduled_at <= $1
                 ORDER BY scheduled_at, attempt_number, id
                 LIMIT $2",
            );
            self.fetch(sqlx::query(&sql).bind(now).bind(i64::from(limit)))
                .await
        })
    }

    fn for_subject<'a>(
        &'a self,
        key: &'a SubjectKey,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecoveryCampaign>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let sql = select_sql("WHERE subject_type = $1 AND subject_id = $2 ORDER BY attempt_number");
            self.fetch(
                sqlx::query(&sql)
                    .bind(key.subject_type.as_str())
                    .bind(key.subject_id.as_str()),
            )
            .await
        })
    }

    fn sent_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecoveryCampaign>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let sql = select_sql("WHERE sent_at >= $1 AND sent_at < $2 ORDER BY sent_at, id");
            self.fetch(sqlx::query(&sql).bind(from).bind(to)).await
        })
    }

    fn count_sent_to_customer<'a>(
        &'a self,
        customer_id: &'a CustomerId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u32, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM recovery_campaigns
                 WHERE customer_id = $1 AND sent_at >= $2 AND sent_at < $3",
            )
            .bind(customer_id.as_str())
            .bind(from)
            .bind(to)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("Failed to count sent campaigns", &e))?;
            from_db(count, "count")
        })
    }

    fn list<'a>(
        &'a self,
        query: &'a CampaignQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Page<RecoveryCampaign>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM recovery_campaigns");
            push_filters(&mut count, query);
            let (total,): (i64,) = count
                .build_query_as()
                .fetch_one(&self.pool)
                .await
                .map_err(|e| db_error("Failed to count campaigns", &e))?;

            let limit = query.page.effective_limit();
            let mut select =
                QueryBuilder::<Postgres>::new(format!("SELECT {CAMPAIGN_COLUMNS} FROM recovery_campaigns"));
            push_filters(&mut select, query);
            select
                .push(" ORDER BY scheduled_at DESC, id LIMIT ")
                .push_bind(i64::from(limit))
                .push(" OFFSET ")
                .push_bind(i64::from(query.page.offset));
            let rows = select
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_error("Failed to list campaigns", &e))?;

            Ok(Page {
                items: rows.iter().map(campaign_from_row).collect::<Result<_, _>>()?,
                total: from_db(total, "count")?,
                offset: query.page.offset,
                limit,
            })
        })
    }
}
