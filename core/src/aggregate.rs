//! Per-day rollups for downstream reporting.
//!
//! A [`DailyAggregate`] is computed in one pass over a closed day and written
//! with a whole-row upsert keyed by date. It carries no computation timestamp,
//! so recomputing an unchanged day yields an identical row.

use crate::campaign::{CampaignType, RecoveryCampaign};
use crate::error::StoreError;
use crate::event::EventType;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// Ordered steps of the purchase funnel.
pub const FUNNEL_STEPS: [EventType; 7] = [
    EventType::ThemeSelected,
    EventType::CustomizerEntered,
    EventType::PhotoUploaded,
    EventType::DesignCompleted,
    EventType::AddedToCart,
    EventType::CheckoutStarted,
    EventType::PaymentCompleted,
];

/// Percentage `part / whole`, rounded to one decimal. Zero when `whole` is zero.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 1000.0).round() / 10.0
}

/// One funnel step for a day.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelStep {
    /// Event marking this step.
    pub step: EventType,
    /// Distinct subjects that reached the step.
    pub count: u64,
    /// Share of the first step's count.
    pub percentage: f64,
    /// Share lost relative to the previous step.
    pub dropoff: f64,
}

/// Build funnel steps from per-step distinct subject counts.
#[must_use]
pub fn funnel_from_counts(counts: &BTreeMap<EventType, u64>) -> Vec<FunnelStep> {
    let first = counts.get(&FUNNEL_STEPS[0]).copied().unwrap_or(0);
    let mut previous: Option<u64> = None;
    FUNNEL_STEPS
        .iter()
        .map(|&step| {
            let count = counts.get(&step).copied().unwrap_or(0);
            let dropoff = previous.map_or(0.0, |prev| {
                if prev == 0 {
                    0.0
                } else {
                    100.0 - percentage(count.min(prev), prev)
                }
            });
            previous = Some(count);
            FunnelStep {
                step,
                count,
                percentage: percentage(count, first),
                dropoff: (dropoff * 10.0).round() / 10.0,
            }
        })
        .collect()
}

/// Activity attributed to one theme for a day.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeStats {
    /// Events attributed to the theme.
    pub events: u64,
    /// Distinct subjects with at least one attributed event.
    pub subjects: u64,
    /// `design_completed` and `payment_completed` events.
    pub completions: u64,
    /// Abandonment markers.
    pub abandonments: u64,
    /// `payment_completed` events.
    #[serde(default)]
    pub orders: u64,
    /// Sum of the orders' `amount` metadata.
    #[serde(default)]
    pub revenue: f64,
    /// `orders / subjects` as a percentage, one decimal.
    #[serde(default)]
    pub conversion_rate: f64,
}

/// Recovery email counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStats {
    /// Emails sent.
    pub sent: u64,
    /// Of those, opened.
    pub opened: u64,
    /// Of those, clicked.
    pub clicked: u64,
    /// Of those, converted.
    pub converted: u64,
}

impl RecoveryStats {
    /// Count one campaign. Unsent campaigns are ignored.
    pub fn add(&mut self, campaign: &RecoveryCampaign) {
        if campaign.sent_at.is_none() {
            return;
        }
        self.sent += 1;
        self.opened += u64::from(campaign.opened_at.is_some());
        self.clicked += u64::from(campaign.clicked_at.is_some());
        self.converted += u64::from(campaign.converted_at.is_some());
    }

    /// Tally a set of campaigns overall and per campaign type.
    #[must_use]
    pub fn tally<'a>(
        campaigns: impl IntoIterator<Item = &'a RecoveryCampaign>,
    ) -> (Self, BTreeMap<CampaignType, Self>) {
        let mut overall = Self::default();
        let mut by_type: BTreeMap<CampaignType, Self> =
            CampaignType::ALL.iter().map(|&ty| (ty, Self::default())).collect();
        for campaign in campaigns {
            overall.add(campaign);
            by_type.entry(campaign.campaign_type).or_default().add(campaign);
        }
        (overall, by_type)
    }
}

/// Rollup of one local calendar day.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyAggregate {
    /// Local calendar date.
    pub date: NaiveDate,
    /// IANA timezone the day boundaries were computed in.
    pub timezone: String,
    /// Events by type.
    pub event_counts: BTreeMap<EventType, u64>,
    /// Funnel conversion by step.
    pub funnel: Vec<FunnelStep>,
    /// Activity by theme id.
    pub theme_breakdown: BTreeMap<String, ThemeStats>,
    /// Recovery emails sent during the day and their outcomes so far.
    pub recovery: RecoveryStats,
    /// Same counters split by campaign type.
    pub recovery_by_type: BTreeMap<CampaignType, RecoveryStats>,
}

/// Storage for [`DailyAggregate`] rows.
pub trait AggregateStore: Send + Sync {
    /// Insert or fully replace the row for `aggregate.date`.
    ///
    /// # Errors
    ///
    /// `Database` / `Serialization` on backend failure. A failed upsert leaves
    /// the previous row for that date untouched.
    fn upsert<'a>(
        &'a self,
        aggregate: &'a DailyAggregate,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    /// Load the row for a date.
    ///
    /// # Errors
    ///
    /// `Database` / `Serialization` on backend failure.
    fn get(
        &self,
        date: NaiveDate,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DailyAggregate>, StoreError>> + Send + '_>>;

    /// Rows with `from <= date <= to`, ascending.
    ///
    /// # Errors
    ///
    /// `Database` / `Serialization` on backend failure.
    fn list(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DailyAggregate>, StoreError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_rounds_to_one_decimal() {
        assert!((percentage(1, 3) - 33.3).abs() < f64::EPSILON);
        assert!((percentage(2, 3) - 66.7).abs() < f64::EPSILON);
        assert!(percentage(5, 0).abs() < f64::EPSILON);
    }

    #[test]
    fn funnel_steps_follow_fixed_order() {
        let mut counts = BTreeMap::new();
        counts.insert(EventType::ThemeSelected, 10);
        counts.insert(EventType::CustomizerEntered, 8);
        counts.insert(EventType::PhotoUploaded, 4);

        let funnel = funnel_from_counts(&counts);
        assert_eq!(funnel.len(), FUNNEL_STEPS.len());
        assert_eq!(funnel[0].step, EventType::ThemeSelected);
        assert!((funnel[0].percentage - 100.0).abs() < f64::EPSILON);
        assert!((funnel[1].dropoff - 20.0).abs() < f64::EPSILON);
        assert!((funnel[2].dropoff - 50.0).abs() < f64::EPSILON);
        assert_eq!(funnel[6].count, 0);
    }
}
