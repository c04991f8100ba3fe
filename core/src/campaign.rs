//! Recovery campaigns: one row per scheduled recovery email attempt.
//!
//! A campaign row is created when a subject is abandoned (attempt 1) or when
//! the previous attempt was sent without the subject converting (attempt N+1).
//! Rows are never deleted. Attempts that must not fire are cancelled.
//!
//! Outcome timestamps only ever move forward and always respect
//! `sent_at <= opened_at <= clicked_at`, with `converted_at` after whichever
//! of those is latest.

use crate::error::{StoreError, ValidationError};
use crate::query::{CampaignQuery, Page};
use crate::subject::{CustomerId, SubjectId, SubjectKey, SubjectType, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a campaign row.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CampaignId(Uuid);

impl CampaignId {
    /// Generate a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CampaignId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CampaignId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CampaignId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Which abandonment a campaign is recovering.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignType {
    /// An abandoned design session.
    DesignAbandoned,
    /// An abandoned cart item.
    CartAbandoned,
}

impl CampaignType {
    /// Both campaign types.
    pub const ALL: [Self; 2] = [Self::DesignAbandoned, Self::CartAbandoned];

    /// Campaign type for an abandoned subject.
    #[must_use]
    pub const fn for_subject(subject_type: SubjectType) -> Self {
        match subject_type {
            SubjectType::DesignSession => Self::DesignAbandoned,
            SubjectType::CartItem => Self::CartAbandoned,
        }
    }

    /// Wire/database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DesignAbandoned => "design_abandoned",
            Self::CartAbandoned => "cart_abandoned",
        }
    }

    /// Template id for an attempt, e.g. `design_abandoned_attempt_2`.
    #[must_use]
    pub fn template_id(self, attempt_number: u32) -> String {
        format!("{}_attempt_{attempt_number}", self.as_str())
    }
}

impl fmt::Display for CampaignType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "design_abandoned" => Ok(Self::DesignAbandoned),
            "cart_abandoned" => Ok(Self::CartAbandoned),
            other => Err(StoreError::Serialization(format!(
                "unknown campaign type '{other}'"
            ))),
        }
    }
}

/// Delivery status of a campaign row.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Waiting for `scheduled_at`.
    Scheduled,
    /// Handed to the email sender.
    Sent,
    /// Will never be sent (subject converted first).
    Cancelled,
    /// Delivery failed permanently or exhausted its retries.
    Failed,
}

impl CampaignStatus {
    /// Wire/database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Sent => "sent",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "sent" => Ok(Self::Sent),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Serialization(format!(
                "unknown campaign status '{other}'"
            ))),
        }
    }
}

/// One recovery email attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryCampaign {
    /// Row id.
    pub id: CampaignId,
    /// Kind of the abandoned subject.
    pub subject_type: SubjectType,
    /// Abandoned subject.
    pub subject_id: SubjectId,
    /// Recipient.
    pub customer_id: Option<CustomerId>,
    /// Campaign kind, derived from the subject type.
    pub campaign_type: CampaignType,
    /// 1-based, gap-free per subject.
    pub attempt_number: u32,
    /// Delivery status.
    pub status: CampaignStatus,
    /// When the attempt becomes due. Pushed forward by quiet hours and the daily cap.
    pub scheduled_at: DateTime<Utc>,
    /// When the email was handed to the sender.
    pub sent_at: Option<DateTime<Utc>>,
    /// When the email was opened.
    pub opened_at: Option<DateTime<Utc>>,
    /// When the recovery link was clicked.
    pub clicked_at: Option<DateTime<Utc>>,
    /// When the customer converted from this email.
    pub converted_at: Option<DateTime<Utc>>,
    /// When the attempt was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Discount code offered on this attempt, if any.
    pub discount_code: Option<String>,
    /// Provider delivery id once sent.
    pub delivery_id: Option<String>,
    /// Failed delivery attempts so far.
    pub failure_count: u32,
    /// Last delivery error message.
    pub last_error: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Row version for compare-and-swap updates.
    pub version: Version,
}

impl RecoveryCampaign {
    /// A new scheduled attempt for `key`.
    #[must_use]
    pub fn scheduled(
        key: &SubjectKey,
        customer_id: Option<CustomerId>,
        attempt_number: u32,
        scheduled_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CampaignId::new(),
            subject_type: key.subject_type,
            subject_id: key.subject_id.clone(),
            customer_id,
            campaign_type: CampaignType::for_subject(key.subject_type),
            attempt_number,
            status: CampaignStatus::Scheduled,
            scheduled_at,
            sent_at: None,
            opened_at: None,
            clicked_at: None,
            converted_at: None,
            cancelled_at: None,
            discount_code: None,
            delivery_id: None,
            failure_count: 0,
            last_error: None,
            created_at,
            version: Version::INITIAL,
        }
    }

    /// Key of the subject this campaign recovers.
    #[must_use]
    pub fn subject_key(&self) -> SubjectKey {
        SubjectKey::new(self.subject_type, self.subject_id.clone())
    }

    /// Deterministic discount code derived from the campaign id.
    #[must_use]
    pub fn derive_discount_code(&self) -> String {
        let hex = self.id.as_uuid().simple().to_string().to_uppercase();
        format!("RECOVER-{}", &hex[..8])
    }

    /// Template id for this attempt.
    #[must_use]
    pub fn template_id(&self) -> String {
        self.campaign_type.template_id(self.attempt_number)
    }

    /// Sender deduplication key: campaign id plus attempt number.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.id, self.attempt_number)
    }

    fn require_sent(&self) -> Result<DateTime<Utc>, ValidationError> {
        match (self.status, self.sent_at) {
            (CampaignStatus::Sent, Some(sent_at)) => Ok(sent_at),
            _ => Err(ValidationError::OutcomeOrder(format!(
                "campaign {} has not been sent (status {})",
                self.id, self.status
            ))),
        }
    }

    /// Record an open. Returns `false` when it was already recorded.
    ///
    /// # Errors
    ///
    /// [`ValidationError::OutcomeOrder`] if the campaign was never sent.
    pub fn record_opened(&mut self, at: DateTime<Utc>) -> Result<bool, ValidationError> {
        let sent_at = self.require_sent()?;
        if self.opened_at.is_some() {
            return Ok(false);
        }
        self.opened_at = Some(at.max(sent_at));
        Ok(true)
    }

    /// Record a click, backfilling `opened_at` when the open was never tracked.
    /// Returns `false` when the click was already recorded.
    ///
    /// # Errors
    ///
    /// [`ValidationError::OutcomeOrder`] if the campaign was never sent.
    pub fn record_clicked(&mut self, at: DateTime<Utc>) -> Result<bool, ValidationError> {
        let sent_at = self.require_sent()?;
        if self.clicked_at.is_some() {
            return Ok(false);
        }
        let clicked_at = at.max(self.opened_at.unwrap_or(sent_at));
        if self.opened_at.is_none() {
            self.opened_at = Some(clicked_at);
        }
        self.clicked_at = Some(clicked_at);
        Ok(true)
    }

    /// Record a conversion. Returns `false` when it was already recorded.
    ///
    /// # Errors
    ///
    /// [`ValidationError::OutcomeOrder`] if the campaign was never sent.
    pub fn record_converted(&mut self, at: DateTime<Utc>) -> Result<bool, ValidationError> {
        let sent_at = self.require_sent()?;
        if self.converted_at.is_some() {
            return Ok(false);
        }
        let floor = self.clicked_at.or(self.opened_at).unwrap_or(sent_at);
        self.converted_at = Some(at.max(floor));
        Ok(true)
    }
}

/// Storage for [`RecoveryCampaign`] rows.
pub trait CampaignStore: Send + Sync {
    /// Insert a new campaign. Returns `false` without writing when a row for
    /// the same subject and attempt number already exists.
    ///
    /// # Errors
    ///
    /// `Database` / `Serialization` on backend failure.
    fn insert<'a>(
        &'a self,
        campaign: &'a RecoveryCampaign,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>>;

    /// Load a campaign by id.
    ///
    /// # Errors
    ///
    /// `Database` / `Serialization` on backend failure.
    fn get(
        &self,
        id: CampaignId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RecoveryCampaign>, StoreError>> + Send + '_>>;

    /// Compare-and-swap update on `campaign.version`. Returns the new version.
    ///
    /// # Errors
    ///
    /// `ConcurrencyConflict` when the row moved on, `NotFound` when it does not exist.
    fn update<'a>(
        &'a self,
        campaign: &'a RecoveryCampaign,
    ) -> Pin<Box<dyn Future<Output = Result<Version, StoreError>> + Send + 'a>>;

    /// Scheduled campaigns with `scheduled_at <= now`, earliest first.
    ///
    /// # Errors
    ///
    /// `Database` / `Serialization` on backend failure.
    fn due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecoveryCampaign>, StoreError>> + Send + '_>>;

    /// Every campaign for a subject, by attempt number.
    ///
    /// # Errors
    ///
    /// `Database` / `Serialization` on backend failure.
    fn for_subject<'a>(
        &'a self,
        key: &'a SubjectKey,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecoveryCampaign>, StoreError>> + Send + 'a>>;

    /// Campaigns with `from <= sent_at < to`.
    ///
    /// # Errors
    ///
    /// `Database` / `Serialization` on backend failure.
    fn sent_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecoveryCampaign>, StoreError>> + Send + '_>>;

    /// Number of emails sent to a customer with `from <= sent_at < to`.
    ///
    /// # Errors
    ///
    /// `Database` on backend failure.
    fn count_sent_to_customer<'a>(
        &'a self,
        customer_id: &'a CustomerId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u32, StoreError>> + Send + 'a>>;

    /// Filtered, paginated listing ordered by `scheduled_at` descending.
    ///
    /// # Errors
    ///
    /// `Database` / `Serialization` on backend failure.
    fn list<'a>(
        &'a self,
        query: &'a CampaignQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Page<RecoveryCampaign>, StoreError>> + Send + 'a>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T01:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn sent_campaign() -> RecoveryCampaign {
        let key = SubjectKey::new(SubjectType::CartItem, SubjectId::new("ci-1"));
        let mut campaign =
            RecoveryCampaign::scheduled(&key, Some(CustomerId::new("cust-1")), 1, t0(), t0());
        campaign.status = CampaignStatus::Sent;
        campaign.sent_at = Some(t0());
        campaign
    }

    #[test]
    fn outcomes_require_a_sent_campaign() {
        let key = SubjectKey::new(SubjectType::CartItem, SubjectId::new("ci-1"));
        let mut scheduled = RecoveryCampaign::scheduled(&key, None, 1, t0(), t0());
        assert!(matches!(
            scheduled.record_opened(t0()),
            Err(ValidationError::OutcomeOrder(_))
        ));
        assert!(scheduled.opened_at.is_none());
    }

    #[test]
    fn click_backfills_open() {
        let mut campaign = sent_campaign();
        let click = t0() + Duration::minutes(10);

        assert_eq!(campaign.record_clicked(click), Ok(true));
        assert_eq!(campaign.opened_at, Some(click));
        assert_eq!(campaign.clicked_at, Some(click));

        // A late open pixel does not move the backfilled value.
        assert_eq!(campaign.record_opened(t0() + Duration::minutes(20)), Ok(false));
        assert_eq!(campaign.opened_at, Some(click));
    }

    #[test]
    fn outcomes_are_idempotent_and_ordered() {
        let mut campaign = sent_campaign();
        assert_eq!(campaign.record_opened(t0() + Duration::minutes(5)), Ok(true));
        assert_eq!(campaign.record_opened(t0() + Duration::minutes(6)), Ok(false));
        assert_eq!(campaign.opened_at, Some(t0() + Duration::minutes(5)));

        // Timestamps earlier than the previous step are clamped forward.
        assert_eq!(campaign.record_clicked(t0() + Duration::minutes(1)), Ok(true));
        assert_eq!(campaign.clicked_at, Some(t0() + Duration::minutes(5)));

        assert_eq!(campaign.record_converted(t0() + Duration::hours(1)), Ok(true));
        assert_eq!(campaign.record_converted(t0() + Duration::hours(2)), Ok(false));
        assert_eq!(campaign.converted_at, Some(t0() + Duration::hours(1)));
    }

    #[test]
    fn discount_code_is_derived_from_id() {
        let campaign = sent_campaign();
        let code = campaign.derive_discount_code();
        assert!(code.starts_with("RECOVER-"));
        assert_eq!(code.len(), "RECOVER-".len() + 8);
        assert_eq!(code, campaign.derive_discount_code());
    }

    #[test]
    fn template_and_dedup_key() {
        let campaign = sent_campaign();
        assert_eq!(campaign.template_id(), "cart_abandoned_attempt_1");
        assert_eq!(campaign.dedup_key(), format!("{}:1", campaign.id));
    }
}
