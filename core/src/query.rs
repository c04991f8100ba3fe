//! Read-side filters and pagination for the dashboard query surface.

use crate::campaign::{CampaignStatus, CampaignType, RecoveryCampaign};
use crate::session::{SessionState, SessionStatus};
use crate::subject::{SubjectKey, SubjectType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Offset/limit window over a filtered result set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageRequest {
    /// Rows to skip.
    pub offset: u32,
    /// Rows to return; clamped to [`PageRequest::MAX_LIMIT`].
    pub limit: u32,
}

impl PageRequest {
    /// Default page size.
    pub const DEFAULT_LIMIT: u32 = 20;
    /// Largest page a caller may request.
    pub const MAX_LIMIT: u32 = 100;

    /// Build a page request, clamping `limit` into `1..=MAX_LIMIT`.
    #[must_use]
    pub fn new(offset: u32, limit: u32) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }

    /// Effective limit after clamping (guards against hand-built values).
    #[must_use]
    pub fn effective_limit(self) -> u32 {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }

    /// Slice an already filtered and ordered collection.
    #[must_use]
    pub fn apply<T>(self, items: Vec<T>) -> Page<T> {
        let total = items.len() as u64;
        let limit = self.effective_limit();
        let items = items
            .into_iter()
            .skip(self.offset as usize)
            .take(limit as usize)
            .collect();
        Page {
            items,
            total,
            offset: self.offset,
            limit,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: Self::DEFAULT_LIMIT,
        }
    }
}

/// One page of results.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Rows in this page.
    pub items: Vec<T>,
    /// Rows matching the filter across all pages.
    pub total: u64,
    /// Offset this page starts at.
    pub offset: u32,
    /// Page size used.
    pub limit: u32,
}

impl<T> Page<T> {
    /// Whether further rows exist after this page.
    #[must_use]
    pub fn has_more(&self) -> bool {
        u64::from(self.offset) + (self.items.len() as u64) < self.total
    }
}

/// Filter over session states.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionQuery {
    /// Only this subject type.
    pub subject_type: Option<SubjectType>,
    /// Only this status.
    pub status: Option<SessionStatus>,
    /// `updated_at >= updated_from`.
    pub updated_from: Option<DateTime<Utc>>,
    /// `updated_at < updated_to`.
    pub updated_to: Option<DateTime<Utc>>,
    /// Pagination.
    pub page: PageRequest,
}

impl SessionQuery {
    /// Whether `state` passes every filter (pagination aside).
    #[must_use]
    pub fn matches(&self, state: &SessionState) -> bool {
        self.subject_type.is_none_or(|ty| state.subject_type == ty)
            && self.status.is_none_or(|status| state.status == status)
            && self.updated_from.is_none_or(|from| state.updated_at >= from)
            && self.updated_to.is_none_or(|to| state.updated_at < to)
    }
}

/// Filter over recovery campaigns.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CampaignQuery {
    /// Only this campaign type.
    pub campaign_type: Option<CampaignType>,
    /// Only this status.
    pub status: Option<CampaignStatus>,
    /// Only campaigns for this subject.
    pub subject: Option<SubjectKey>,
    /// `sent_at >= sent_from`.
    pub sent_from: Option<DateTime<Utc>>,
    /// `sent_at < sent_to`.
    pub sent_to: Option<DateTime<Utc>>,
    /// Pagination.
    pub page: PageRequest,
}

impl CampaignQuery {
    /// Whether `campaign` passes every filter (pagination aside).
    ///
    /// A sent-range filter excludes campaigns that were never sent.
    #[must_use]
    pub fn matches(&self, campaign: &RecoveryCampaign) -> bool {
        let in_sent_range = match (self.sent_from, self.sent_to) {
            (None, None) => true,
            (from, to) => campaign.sent_at.is_some_and(|sent| {
                from.is_none_or(|from| sent >= from) && to.is_none_or(|to| sent < to)
            }),
        };
        self.campaign_type.is_none_or(|ty| campaign.campaign_type == ty)
            && self.status.is_none_or(|status| campaign.status == status)
            && self
                .subject
                .as_ref()
                .is_none_or(|key| campaign.subject_type == key.subject_type && campaign.subject_id == key.subject_id)
            && in_sent_range
    }
}
