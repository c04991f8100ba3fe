//! Subject identification and row versioning types.
//!
//! A *subject* is anything tracked for abandonment: a design session or a
//! cart item. Subjects are addressed by a [`SubjectKey`] (type + id) so that a
//! design session and a cart item can never collide even if the upstream
//! system reuses identifiers across tables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for identifier parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid identifier: {0}")]
pub struct ParseIdError(String);

/// The kind of entity being tracked.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    /// A photobook design session in the customizer.
    DesignSession,
    /// A single item sitting in a customer's cart.
    CartItem,
}

impl SubjectType {
    /// All subject types, in a stable order.
    pub const ALL: [Self; 2] = [Self::DesignSession, Self::CartItem];

    /// Wire/database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DesignSession => "design_session",
            Self::CartItem => "cart_item",
        }
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectType {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "design_session" => Ok(Self::DesignSession),
            "cart_item" => Ok(Self::CartItem),
            other => Err(ParseIdError(format!("unknown subject type '{other}'"))),
        }
    }
}

/// Identifier of a design session or cart item.
///
/// # Validation
///
/// - `FromStr::from_str()`: rejects empty or whitespace-only input
/// - `new()` / `From`: no validation, for identifiers the engine already trusts
///
/// # Examples
///
/// ```
/// use funnel_recovery_core::subject::SubjectId;
///
/// let id = SubjectId::new("ds-1001");
/// assert_eq!(id.as_str(), "ds-1001");
///
/// assert!("  ".parse::<SubjectId>().is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubjectId(String);

impl SubjectId {
    /// Create a new `SubjectId` without validation.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SubjectId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseIdError("subject id cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for SubjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a customer (the recipient of recovery emails).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CustomerId(String);

impl CustomerId {
    /// Create a new `CustomerId` without validation.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CustomerId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseIdError("customer id cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for CustomerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Fully-qualified subject address.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubjectKey {
    /// Kind of subject.
    pub subject_type: SubjectType,
    /// Identifier within that kind.
    pub subject_id: SubjectId,
}

impl SubjectKey {
    /// Build a key from its parts.
    #[must_use]
    pub const fn new(subject_type: SubjectType, subject_id: SubjectId) -> Self {
        Self {
            subject_type,
            subject_id,
        }
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.subject_id)
    }
}

/// Row version for optimistic concurrency control.
///
/// Every mutable row (session state, recovery campaign) carries a version.
/// Writers submit the version they read; the store rejects the write with a
/// conflict when the stored version moved on in between. A row that has never
/// been written is at [`Version::INITIAL`].
///
/// ```
/// use funnel_recovery_core::subject::Version;
///
/// let v0 = Version::INITIAL;
/// assert_eq!(v0.next(), Version::new(1));
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// Version of a row that does not exist yet.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
