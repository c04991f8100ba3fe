//! Read-only query surface over session states, campaigns and aggregates.

use chrono::NaiveDate;
use funnel_recovery_core::aggregate::{AggregateStore, DailyAggregate, RecoveryStats, percentage};
use funnel_recovery_core::campaign::{CampaignId, CampaignStore, CampaignType, RecoveryCampaign};
use funnel_recovery_core::error::{EngineError, Result};
use funnel_recovery_core::query::{CampaignQuery, Page, PageRequest, SessionQuery};
use funnel_recovery_core::session::{SessionState, SessionStateStore};
use funnel_recovery_core::subject::SubjectKey;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Recovery counters with derived rates (percentages, one decimal).
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryRates {
    /// Emails sent.
    pub sent: u64,
    /// Emails opened.
    pub opened: u64,
    /// Links clicked.
    pub clicked: u64,
    /// Conversions credited to an email.
    pub converted: u64,
    /// `opened / sent`.
    pub open_rate: f64,
    /// `clicked / opened`.
    pub click_rate: f64,
    /// `converted / sent`.
    pub conversion_rate: f64,
}

impl From<RecoveryStats> for RecoveryRates {
    fn from(stats: RecoveryStats) -> Self {
        Self {
            sent: stats.sent,
            opened: stats.opened,
            clicked: stats.clicked,
            converted: stats.converted,
            open_rate: percentage(stats.opened, stats.sent),
            click_rate: percentage(stats.clicked, stats.opened),
            conversion_rate: percentage(stats.converted, stats.sent),
        }
    }
}

/// Recovery performance overall and per campaign type.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// All matching campaigns.
    pub overall: RecoveryRates,
    /// Split by campaign type.
    pub by_type: BTreeMap<CampaignType, RecoveryRates>,
}

/// Dashboard reads.
#[derive(Clone)]
pub struct QueryService {
    sessions: Arc<dyn SessionStateStore>,
    campaigns: Arc<dyn CampaignStore>,
    aggregates: Arc<dyn AggregateStore>,
}

impl QueryService {
    /// Build a query service over the given stores.
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionStateStore>,
        campaigns: Arc<dyn CampaignStore>,
        aggregates: Arc<dyn AggregateStore>,
    ) -> Self {
        Self {
            sessions,
            campaigns,
            aggregates,
        }
    }

    /// Filtered session states, most recently updated first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn sessions(&self, query: &SessionQuery) -> Result<Page<SessionState>> {
        Ok(self.sessions.list(query).await?)
    }

    /// One subject's state.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown subject.
    pub async fn session(&self, key: &SubjectKey) -> Result<SessionState> {
        self.sessions
            .load(key)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "session_state",
                id: key.to_string(),
            })
    }

    /// Filtered campaigns, latest schedule first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn campaigns(&self, query: &CampaignQuery) -> Result<Page<RecoveryCampaign>> {
        Ok(self.campaigns.list(query).await?)
    }

    /// One campaign.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    pub async fn campaign(&self, id: CampaignId) -> Result<RecoveryCampaign> {
        self.campaigns
            .get(id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "recovery_campaign",
                id: id.to_string(),
            })
    }

    /// A subject's campaign history, by attempt number.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn campaigns_for_subject(&self, key: &SubjectKey) -> Result<Vec<RecoveryCampaign>> {
        Ok(self.campaigns.for_subject(key).await?)
    }

    /// Daily aggregates with `from <= date <= to`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn aggregates(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailyAggregate>> {
        Ok(self.aggregates.list(from, to).await?)
    }

    /// The aggregate for one date.
    ///
    /// # Errors
    ///
    /// `NotFound` when the date was never aggregated.
    pub async fn aggregate(&self, date: NaiveDate) -> Result<DailyAggregate> {
        self.aggregates
            .get(date)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "daily_aggregate",
                id: date.to_string(),
            })
    }

    /// Recovery performance over every campaign matching `query` (its page
    /// window is ignored).
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn recovery_stats(&self, query: &CampaignQuery) -> Result<RecoveryReport> {
        let mut query = query.clone();
        query.page = PageRequest::new(0, PageRequest::MAX_LIMIT);
        let mut matching = Vec::new();
        loop {
            let page = self.campaigns.list(&query).await?;
            let more = page.has_more() && !page.items.is_empty();
            query.page.offset += u32::try_from(page.items.len()).unwrap_or(u32::MAX);
            matching.extend(page.items);
            if !more {
                break;
            }
        }

        let (overall, by_type) = RecoveryStats::tally(&matching);
        Ok(RecoveryReport {
            overall: overall.into(),
            by_type: by_type
                .into_iter()
                .map(|(ty, stats)| (ty, stats.into()))
                .collect(),
        })
    }
}
