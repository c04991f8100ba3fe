//! Live per-subject state and its store.
//!
//! A [`SessionState`] row exists for every design session and cart item that
//! has received at least one event. It is derived from the subject's event
//! stream by the tracker and advanced to `abandoned` by the detector. Rows are
//! never deleted; they end in a terminal status instead.

use crate::error::StoreError;
use crate::event::EventId;
use crate::query::{Page, SessionQuery};
use crate::subject::{CustomerId, SubjectId, SubjectKey, SubjectType, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Lifecycle status of a subject.
///
/// ```text
/// started ─► in_progress ─┬─► completed
///                         ├─► converted
///                         ├─► removed      (cart items)
///                         └─► abandoned ─► converted
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created by a non-activity event; nothing has happened on the subject yet.
    Started,
    /// Customer activity observed.
    InProgress,
    /// Inactivity threshold elapsed while eligible.
    Abandoned,
    /// Came back after abandonment and finished.
    Converted,
    /// Finished without ever being abandoned.
    Completed,
    /// Cart item removed by the customer.
    Removed,
}

impl SessionStatus {
    /// Wire/database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::InProgress => "in_progress",
            Self::Abandoned => "abandoned",
            Self::Converted => "converted",
            Self::Completed => "completed",
            Self::Removed => "removed",
        }
    }

    /// Statuses no event can leave.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Converted | Self::Completed | Self::Removed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "in_progress" => Ok(Self::InProgress),
            "abandoned" => Ok(Self::Abandoned),
            "converted" => Ok(Self::Converted),
            "completed" => Ok(Self::Completed),
            "removed" => Ok(Self::Removed),
            other => Err(StoreError::Serialization(format!(
                "unknown session status '{other}'"
            ))),
        }
    }
}

/// Current state of one design session or cart item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Kind of subject.
    pub subject_type: SubjectType,
    /// Subject identifier.
    pub subject_id: SubjectId,
    /// Owning customer, once known.
    pub customer_id: Option<CustomerId>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Theme chosen for the design (or the designed product in the cart).
    pub theme: Option<String>,
    /// Photos currently in the design.
    pub photo_count: u32,
    /// Cart item sits in the cart.
    pub item_present: bool,
    /// Cart item has entered checkout.
    pub in_checkout: bool,
    /// Derived eligibility for the abandonment sweep.
    pub eligible_for_abandonment: bool,
    /// Timestamp of the first event.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent activity event.
    pub last_activity_at: DateTime<Utc>,
    /// Set exactly once, when the subject is abandoned.
    pub abandoned_at: Option<DateTime<Utc>>,
    /// Set when an abandoned subject comes back and finishes.
    pub converted_at: Option<DateTime<Utc>>,
    /// Set when the subject finishes (or is removed) without abandonment.
    pub closed_at: Option<DateTime<Utc>>,
    /// Last state change (event time or detector tick time).
    pub updated_at: DateTime<Utc>,
    /// Id of the last event folded into this state.
    pub last_event_id: Option<EventId>,
    /// `occurred_at` of the last event folded into this state.
    pub last_event_at: Option<DateTime<Utc>>,
    /// Row version for compare-and-swap saves. [`Version::INITIAL`] until first saved.
    pub version: Version,
}

impl SessionState {
    /// Fresh state for a subject first seen at `at`.
    #[must_use]
    pub fn new(key: &SubjectKey, customer_id: Option<CustomerId>, at: DateTime<Utc>) -> Self {
        Self {
            subject_type: key.subject_type,
            subject_id: key.subject_id.clone(),
            customer_id,
            status: SessionStatus::Started,
            theme: None,
            photo_count: 0,
            item_present: false,
            in_checkout: false,
            eligible_for_abandonment: false,
            created_at: at,
            last_activity_at: at,
            abandoned_at: None,
            converted_at: None,
            closed_at: None,
            updated_at: at,
            last_event_id: None,
            last_event_at: None,
            version: Version::INITIAL,
        }
    }

    /// Key addressing this subject.
    #[must_use]
    pub fn key(&self) -> SubjectKey {
        SubjectKey::new(self.subject_type, self.subject_id.clone())
    }

    /// Position of the last folded event in stream order.
    #[must_use]
    pub fn last_position(&self) -> Option<(DateTime<Utc>, EventId)> {
        self.last_event_at.zip(self.last_event_id)
    }

    /// Whether the subject has converted (terminal success after abandonment).
    #[must_use]
    pub fn is_converted(&self) -> bool {
        self.status == SessionStatus::Converted
    }
}

/// Storage for [`SessionState`] rows.
///
/// All writes are compare-and-swap on [`SessionState::version`]; this is the
/// per-subject linearization point shared by ingestion and the detector.
pub trait SessionStateStore: Send + Sync {
    /// Load a subject's state, `None` if it was never saved.
    ///
    /// # Errors
    ///
    /// `Database` / `Serialization` on backend failure.
    fn load<'a>(
        &'a self,
        key: &'a SubjectKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SessionState>, StoreError>> + Send + 'a>>;

    /// Save `state`, which must carry the version it was loaded at
    /// ([`Version::INITIAL`] for a brand-new row). Returns the new version.
    ///
    /// # Errors
    ///
    /// `ConcurrencyConflict` when the stored version differs from `state.version`
    /// (including an insert racing another insert).
    fn save<'a>(
        &'a self,
        state: &'a SessionState,
    ) -> Pin<Box<dyn Future<Output = Result<Version, StoreError>> + Send + 'a>>;

    /// Subjects in `in_progress`, flagged eligible, whose `last_activity_at`
    /// is strictly before `inactive_since`, oldest activity first.
    ///
    /// # Errors
    ///
    /// `Database` / `Serialization` on backend failure.
    fn abandonment_candidates(
        &self,
        subject_type: SubjectType,
        inactive_since: DateTime<Utc>,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SessionState>, StoreError>> + Send + '_>>;

    /// Subjects in `abandoned` that have no attempt-1 recovery campaign,
    /// oldest abandonment first. These are abandonments whose hand-off to
    /// the scheduler did not complete.
    ///
    /// # Errors
    ///
    /// `Database` / `Serialization` on backend failure.
    fn unscheduled_abandonments(
        &self,
        subject_type: SubjectType,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SessionState>, StoreError>> + Send + '_>>;

    /// Filtered, paginated listing ordered by `updated_at` descending.
    ///
    /// # Errors
    ///
    /// `Database` / `Serialization` on backend failure.
    fn list<'a>(
        &'a self,
        query: &'a SessionQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Page<SessionState>, StoreError>> + Send + 'a>>;
}
