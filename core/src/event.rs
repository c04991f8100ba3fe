//! Funnel events: the append-only source of truth for every timing decision.
//!
//! Events arrive from the customer-facing frontend as loosely typed JSON
//! ([`EventInput`]), are validated at the boundary into a [`NewEvent`], and
//! become an immutable [`Event`] once the store assigns an [`EventId`].
//!
//! # Ordering
//!
//! Within a subject, events are ordered by `(occurred_at, id)`. The id is the
//! store's insertion sequence, so ties on `occurred_at` fall back to arrival
//! order.
//!
//! # Example
//!
//! ```
//! use chrono::{Duration, Utc};
//! use funnel_recovery_core::event::{EventInput, EventType};
//!
//! let now = Utc::now();
//! let input: EventInput = serde_json::from_value(serde_json::json!({
//!     "eventType": "photo_uploaded",
//!     "subjectType": "design_session",
//!     "sessionId": "ds-1001",
//!     "customerId": "cust-1",
//!     "occurredAt": now,
//! }))
//! .unwrap();
//!
//! let event = input.validate(now, Duration::minutes(5)).unwrap();
//! assert_eq!(event.event_type, EventType::PhotoUploaded);
//! ```

use crate::error::ValidationError;
use crate::subject::{CustomerId, SubjectId, SubjectKey, SubjectType};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Store-assigned event identifier (monotonic insertion sequence).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(u64);

impl EventId {
    /// Wrap a raw sequence number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw sequence number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tracked event vocabulary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum EventType {
    ThemeSelected,
    CustomizerEntered,
    PhotoUploaded,
    PhotoRemoved,
    TextEdited,
    LayoutChanged,
    PreviewViewed,
    DesignCompleted,
    AddedToCart,
    RemovedFromCart,
    CheckoutStarted,
    PaymentAttempted,
    PaymentCompleted,
    PaymentFailed,
    RecoveryEmailSent,
    RecoveryEmailOpened,
    RecoveryLinkClicked,
    DesignResumed,
    CartRecovered,
    /// Written by the detector when a design session is abandoned.
    DesignAbandoned,
    /// Written by the detector when a cart item is abandoned.
    CartAbandoned,
}

impl EventType {
    /// Every event type, in funnel order.
    pub const ALL: [Self; 21] = [
        Self::ThemeSelected,
        Self::CustomizerEntered,
        Self::PhotoUploaded,
        Self::PhotoRemoved,
        Self::TextEdited,
        Self::LayoutChanged,
        Self::PreviewViewed,
        Self::DesignCompleted,
        Self::AddedToCart,
        Self::RemovedFromCart,
        Self::CheckoutStarted,
        Self::PaymentAttempted,
        Self::PaymentCompleted,
        Self::PaymentFailed,
        Self::RecoveryEmailSent,
        Self::RecoveryEmailOpened,
        Self::RecoveryLinkClicked,
        Self::DesignResumed,
        Self::CartRecovered,
        Self::DesignAbandoned,
        Self::CartAbandoned,
    ];

    /// Wire/database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ThemeSelected => "theme_selected",
            Self::CustomizerEntered => "customizer_entered",
            Self::PhotoUploaded => "photo_uploaded",
            Self::PhotoRemoved => "photo_removed",
            Self::TextEdited => "text_edited",
            Self::LayoutChanged => "layout_changed",
            Self::PreviewViewed => "preview_viewed",
            Self::DesignCompleted => "design_completed",
            Self::AddedToCart => "added_to_cart",
            Self::RemovedFromCart => "removed_from_cart",
            Self::CheckoutStarted => "checkout_started",
            Self::PaymentAttempted => "payment_attempted",
            Self::PaymentCompleted => "payment_completed",
            Self::PaymentFailed => "payment_failed",
            Self::RecoveryEmailSent => "recovery_email_sent",
            Self::RecoveryEmailOpened => "recovery_email_opened",
            Self::RecoveryLinkClicked => "recovery_link_clicked",
            Self::DesignResumed => "design_resumed",
            Self::CartRecovered => "cart_recovered",
            Self::DesignAbandoned => "design_abandoned",
            Self::CartAbandoned => "cart_abandoned",
        }
    }

    /// Markers the detector writes; rejected from external ingestion.
    #[must_use]
    pub const fn is_system_marker(self) -> bool {
        matches!(self, Self::DesignAbandoned | Self::CartAbandoned)
    }

    /// Events describing the recovery email lifecycle rather than customer
    /// activity on the subject itself. They never refresh `last_activity_at`.
    #[must_use]
    pub const fn is_recovery_tracking(self) -> bool {
        matches!(
            self,
            Self::RecoveryEmailSent | Self::RecoveryEmailOpened | Self::RecoveryLinkClicked
        )
    }

    /// Explicit "customer came back" events.
    #[must_use]
    pub const fn is_recovery(self) -> bool {
        matches!(self, Self::DesignResumed | Self::CartRecovered)
    }

    /// The abandonment marker for a subject type.
    #[must_use]
    pub const fn abandonment_marker(subject_type: SubjectType) -> Self {
        match subject_type {
            SubjectType::DesignSession => Self::DesignAbandoned,
            SubjectType::CartItem => Self::CartAbandoned,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownEventType(s.to_string()))
    }
}

/// A validated event that has not been assigned an id yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Kind of subject the event is about.
    pub subject_type: SubjectType,
    /// Subject the event is about.
    pub subject_id: SubjectId,
    /// Owning customer, when logged in.
    pub customer_id: Option<CustomerId>,
    /// What happened.
    pub event_type: EventType,
    /// When it happened (client clock, bounded by the skew tolerance).
    pub occurred_at: DateTime<Utc>,
    /// Free-form attributes (`themeId`, `designSessionId`, ...).
    pub metadata: Value,
    /// Optional deduplication key; a second append with the same key is a no-op.
    pub idempotency_key: Option<String>,
}

impl NewEvent {
    /// Key of the subject this event belongs to.
    #[must_use]
    pub fn subject_key(&self) -> SubjectKey {
        SubjectKey::new(self.subject_type, self.subject_id.clone())
    }

    /// Build the marker the detector appends when it abandons a subject.
    ///
    /// The idempotency key makes concurrent or repeated markers collapse
    /// into a single stored event.
    #[must_use]
    pub fn abandonment_marker(
        key: &SubjectKey,
        customer_id: Option<CustomerId>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            subject_type: key.subject_type,
            subject_id: key.subject_id.clone(),
            customer_id,
            event_type: EventType::abandonment_marker(key.subject_type),
            occurred_at: at,
            metadata: Value::Object(serde_json::Map::new()),
            idempotency_key: Some(format!("abandoned:{key}")),
        }
    }

    /// Attach the store-assigned id.
    #[must_use]
    pub fn into_event(self, id: EventId) -> Event {
        Event {
            id,
            subject_type: self.subject_type,
            subject_id: self.subject_id,
            customer_id: self.customer_id,
            event_type: self.event_type,
            occurred_at: self.occurred_at,
            metadata: self.metadata,
            idempotency_key: self.idempotency_key,
        }
    }
}

/// An immutable stored event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Store-assigned id (insertion sequence).
    pub id: EventId,
    /// Kind of subject the event is about.
    pub subject_type: SubjectType,
    /// Subject the event is about.
    pub subject_id: SubjectId,
    /// Owning customer, when logged in.
    pub customer_id: Option<CustomerId>,
    /// What happened.
    pub event_type: EventType,
    /// When it happened.
    pub occurred_at: DateTime<Utc>,
    /// Free-form attributes.
    pub metadata: Value,
    /// Deduplication key supplied at append time.
    pub idempotency_key: Option<String>,
}

impl Event {
    /// Sort position within a subject stream.
    #[must_use]
    pub const fn position(&self) -> (DateTime<Utc>, EventId) {
        (self.occurred_at, self.id)
    }

    /// Key of the subject this event belongs to.
    #[must_use]
    pub fn subject_key(&self) -> SubjectKey {
        SubjectKey::new(self.subject_type, self.subject_id.clone())
    }

    /// Theme carried in metadata, if any.
    #[must_use]
    pub fn theme(&self) -> Option<&str> {
        theme_from_metadata(&self.metadata)
    }

    /// Order amount from `amount` metadata, if it is a non-negative number.
    #[must_use]
    pub fn amount(&self) -> Option<f64> {
        self.metadata
            .get("amount")
            .and_then(Value::as_f64)
            .filter(|amount| amount.is_finite() && *amount >= 0.0)
    }
}

/// Read the theme id from event metadata (`themeId` or `theme_id`).
#[must_use]
pub fn theme_from_metadata(metadata: &Value) -> Option<&str> {
    metadata
        .get("themeId")
        .or_else(|| metadata.get("theme_id"))
        .and_then(Value::as_str)
        .filter(|theme| !theme.is_empty())
}

/// Raw event as posted by the frontend.
///
/// Every field is optional so that missing values surface as a
/// [`ValidationError`] naming the field rather than a generic decode error.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInput {
    /// Event type string (`photo_uploaded`, ...).
    pub event_type: Option<String>,
    /// Subject type string (`design_session` or `cart_item`).
    pub subject_type: Option<String>,
    /// Subject id. Accepts the frontend's `sessionId` spelling.
    #[serde(alias = "sessionId")]
    pub subject_id: Option<String>,
    /// Owning customer.
    pub customer_id: Option<String>,
    /// Free-form attributes; `null`/absent becomes `{}`.
    pub metadata: Option<Value>,
    /// Client timestamp.
    pub occurred_at: Option<DateTime<Utc>>,
    /// Optional deduplication key.
    pub idempotency_key: Option<String>,
}

impl EventInput {
    /// Validate into a [`NewEvent`].
    ///
    /// # Errors
    ///
    /// - [`ValidationError::MissingField`] when `eventType`, `subjectType`,
    ///   `sessionId` or `occurredAt` is absent or blank
    /// - [`ValidationError::UnknownEventType`] / [`ValidationError::UnknownSubjectType`]
    /// - [`ValidationError::ReservedEventType`] for engine-only markers
    /// - [`ValidationError::FutureTimestamp`] when `occurredAt > now + tolerance`
    pub fn validate(self, now: DateTime<Utc>, tolerance: Duration) -> Result<NewEvent, ValidationError> {
        let event_type = non_blank(self.event_type, "eventType")?;
        let subject_type = non_blank(self.subject_type, "subjectType")?;
        let subject_id = non_blank(self.subject_id, "sessionId")?;
        let occurred_at = self.occurred_at.ok_or(ValidationError::MissingField("occurredAt"))?;

        let event_type: EventType = event_type.parse()?;
        if event_type.is_system_marker() {
            return Err(ValidationError::ReservedEventType(event_type.to_string()));
        }
        let subject_type: SubjectType = subject_type
            .parse()
            .map_err(|_| ValidationError::UnknownSubjectType(subject_type.clone()))?;

        if occurred_at > now + tolerance {
            return Err(ValidationError::FutureTimestamp {
                occurred_at: occurred_at.to_rfc3339(),
                now: now.to_rfc3339(),
                tolerance_seconds: tolerance.num_seconds(),
            });
        }

        let customer_id = self
            .customer_id
            .filter(|id| !id.trim().is_empty())
            .map(CustomerId::new);
        let metadata = match self.metadata {
            None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
            Some(value) => value,
        };
        let idempotency_key = self.idempotency_key.filter(|key| !key.trim().is_empty());

        Ok(NewEvent {
            subject_type,
            subject_id: SubjectId::new(subject_id),
            customer_id,
            event_type,
            occurred_at,
            metadata,
            idempotency_key,
        })
    }
}

fn non_blank(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ValidationError::MissingField(field))
}
