//! Error types shared by every engine component.
//!
//! The engine distinguishes four kinds of failure:
//!
//! - [`ValidationError`]: malformed input rejected at the boundary, never partially applied
//! - [`EngineError::NotFound`]: an operation referenced an unknown subject or campaign
//! - [`DeliveryError`]: the email sender failed
//! - [`EngineError::ConcurrencyConflict`]: the losing side of a per-row race
//!
//! Storage backends report through [`StoreError`], which converts into
//! [`EngineError`] at the component boundary.

use crate::subject::Version;
use thiserror::Error;

/// Input rejected before anything was written.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field was absent or blank.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The event type is not part of the tracked vocabulary.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The subject type is not tracked.
    #[error("unknown subject type: {0}")]
    UnknownSubjectType(String),

    /// System marker events are written by the engine, never ingested.
    #[error("event type {0} is reserved for the engine")]
    ReservedEventType(String),

    /// The event claims to have happened further in the future than the
    /// configured clock-skew tolerance allows.
    #[error("occurredAt {occurred_at} is more than {tolerance_seconds}s ahead of now ({now})")]
    FutureTimestamp {
        /// Timestamp carried by the event.
        occurred_at: String,
        /// Engine clock at validation time.
        now: String,
        /// Allowed skew.
        tolerance_seconds: i64,
    },

    /// A configuration value is out of range or unparsable.
    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig {
        /// Dotted path of the offending field.
        field: String,
        /// Human readable reason.
        reason: String,
    },

    /// An outcome timestamp would break the sent → opened → clicked ordering.
    #[error("invalid outcome transition: {0}")]
    OutcomeOrder(String),
}

impl ValidationError {
    /// Shorthand for [`ValidationError::InvalidConfig`].
    #[must_use]
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Failure reported by the external email sender.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("delivery failed: {message}")]
pub struct DeliveryError {
    /// Provider message.
    pub message: String,
    /// Whether another attempt on a later tick may succeed.
    pub retryable: bool,
}

impl DeliveryError {
    /// A transient failure (timeouts, throttling, 5xx).
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not go away on retry (invalid address, suppressed recipient).
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Errors produced by store implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic concurrency conflict: the row moved past the expected version.
    #[error("Concurrency conflict on {entity} {id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Table/entity name.
        entity: &'static str,
        /// Row identifier.
        id: String,
        /// Version the writer read.
        expected: Version,
        /// Version currently stored.
        actual: Version,
    },

    /// The row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Table/entity name.
        entity: &'static str,
        /// Row identifier.
        id: String,
    },

    /// Database connection or query failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Row could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Top-level error for engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed event or configuration.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Unknown subject or campaign.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity name.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Email sender failure.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Lost a per-row race. Callers retry or drop; never fatal.
    #[error("Concurrency conflict on {entity} {id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Entity name.
        entity: &'static str,
        /// Row identifier.
        id: String,
        /// Version the writer read.
        expected: Version,
        /// Version currently stored.
        actual: Version,
    },

    /// Backend failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Whether this error is the losing side of a race.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrencyConflict {
                entity,
                id,
                expected,
                actual,
            } => Self::ConcurrencyConflict {
                entity,
                id,
                expected,
                actual,
            },
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Storage(msg),
        }
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
