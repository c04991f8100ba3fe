//! Daily Aggregator: per-day rollups of events and recovery outcomes.
//!
//! A run for a date scans every event with `occurred_at` inside that local
//! calendar day and every campaign sent inside it, computes the whole
//! [`DailyAggregate`] in memory and writes it with one upsert. Nothing is
//! written when the scan fails, so a committed row is only ever replaced by a
//! complete recomputation.
//!
//! Theme attribution uses the event's own `themeId` metadata, then the most
//! recent theme seen on the same subject earlier that day, then the subject's
//! current session state. Subjects with no theme anywhere are left out of the
//! theme breakdown. Orders are `payment_completed` events; their revenue is
//! the `amount` metadata.

use crate::calendar;
use crate::metrics::TickMetrics;
use chrono::NaiveDate;
use funnel_recovery_core::aggregate::{
    AggregateStore, DailyAggregate, FUNNEL_STEPS, RecoveryStats, ThemeStats, funnel_from_counts,
    percentage,
};
use funnel_recovery_core::campaign::CampaignStore;
use funnel_recovery_core::config::EngineConfig;
use funnel_recovery_core::error::Result;
use funnel_recovery_core::event::EventType;
use funnel_recovery_core::event_store::EventStore;
use funnel_recovery_core::session::SessionStateStore;
use funnel_recovery_core::subject::SubjectKey;
use futures::TryStreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, instrument};

struct DayEvent {
    key: SubjectKey,
    event_type: EventType,
    theme: Option<String>,
    amount: Option<f64>,
}

/// Per-day rollup writer.
#[derive(Clone)]
pub struct DailyAggregator {
    events: Arc<dyn EventStore>,
    sessions: Arc<dyn SessionStateStore>,
    campaigns: Arc<dyn CampaignStore>,
    aggregates: Arc<dyn AggregateStore>,
}

impl DailyAggregator {
    /// Build an aggregator.
    #[must_use]
    pub fn new(
        events: Arc<dyn EventStore>,
        sessions: Arc<dyn SessionStateStore>,
        campaigns: Arc<dyn CampaignStore>,
        aggregates: Arc<dyn AggregateStore>,
    ) -> Self {
        Self {
            events,
            sessions,
            campaigns,
            aggregates,
        }
    }

    /// Compute and upsert the aggregate for `date` in the configured timezone.
    ///
    /// # Errors
    ///
    /// Invalid timezone or any storage failure; the stored row for `date` is
    /// left as it was.
    #[instrument(skip(self, config))]
    pub async fn run(&self, date: NaiveDate, config: &EngineConfig) -> Result<DailyAggregate> {
        let aggregate = self.compute(date, config).await?;
        self.aggregates.upsert(&aggregate).await?;
        TickMetrics::record_aggregate();
        info!(
            %date,
            events = aggregate.event_counts.values().sum::<u64>(),
            recovery_sent = aggregate.recovery.sent,
            "Daily aggregate written"
        );
        Ok(aggregate)
    }

    /// Compute the aggregate for `date` without writing it.
    ///
    /// # Errors
    ///
    /// Invalid timezone or any storage failure.
    pub async fn compute(&self, date: NaiveDate, config: &EngineConfig) -> Result<DailyAggregate> {
        let tz = config.global.tz()?;
        let (from, to) = calendar::day_bounds(date, tz);

        let mut event_counts: BTreeMap<EventType, u64> = BTreeMap::new();
        let mut step_subjects: BTreeMap<EventType, BTreeSet<SubjectKey>> = BTreeMap::new();
        let mut day_events: Vec<DayEvent> = Vec::new();
        let mut known_themes: HashMap<SubjectKey, String> = HashMap::new();

        let mut stream = self.events.events_between(from, to);
        while let Some(event) = stream.try_next().await? {
            let key = event.subject_key();
            *event_counts.entry(event.event_type).or_default() += 1;
            if FUNNEL_STEPS.contains(&event.event_type) {
                step_subjects
                    .entry(event.event_type)
                    .or_default()
                    .insert(key.clone());
            }
            // Events stream in occurrence order, so only earlier themes are known here.
            let theme = match event.theme() {
                Some(theme) => {
                    known_themes.insert(key.clone(), theme.to_string());
                    Some(theme.to_string())
                }
                None => known_themes.get(&key).cloned(),
            };
            day_events.push(DayEvent {
                amount: event.amount(),
                key,
                event_type: event.event_type,
                theme,
            });
        }
        drop(stream);

        let mut theme_breakdown: BTreeMap<String, ThemeStats> = BTreeMap::new();
        let mut theme_subjects: BTreeMap<String, BTreeSet<SubjectKey>> = BTreeMap::new();
        let mut state_themes: HashMap<SubjectKey, Option<String>> = HashMap::new();
        for DayEvent {
            key,
            event_type,
            theme,
            amount,
        } in day_events
        {
            let theme = match theme {
                Some(theme) => Some(theme),
                None => self.state_theme(&key, &mut state_themes).await?,
            };
            let Some(theme) = theme else {
                continue;
            };
            let stats = theme_breakdown.entry(theme.clone()).or_default();
            stats.events += 1;
            if matches!(
                event_type,
                EventType::DesignCompleted | EventType::PaymentCompleted
            ) {
                stats.completions += 1;
            }
            if event_type == EventType::PaymentCompleted {
                stats.orders += 1;
                stats.revenue += amount.unwrap_or_default();
            }
            if event_type.is_system_marker() {
                stats.abandonments += 1;
            }
            theme_subjects.entry(theme).or_default().insert(key);
        }
        for (theme, subjects) in theme_subjects {
            if let Some(stats) = theme_breakdown.get_mut(&theme) {
                stats.subjects = subjects.len() as u64;
                stats.conversion_rate = percentage(stats.orders, stats.subjects);
            }
        }

        let step_counts: BTreeMap<EventType, u64> = step_subjects
            .iter()
            .map(|(step, subjects)| (*step, subjects.len() as u64))
            .collect();

        let sent = self.campaigns.sent_between(from, to).await?;
        let (recovery, recovery_by_type) = RecoveryStats::tally(&sent);

        Ok(DailyAggregate {
            date,
            timezone: tz.name().to_string(),
            event_counts,
            funnel: funnel_from_counts(&step_counts),
            theme_breakdown,
            recovery,
            recovery_by_type,
        })
    }

    async fn state_theme(
        &self,
        key: &SubjectKey,
        cache: &mut HashMap<SubjectKey, Option<String>>,
    ) -> Result<Option<String>> {
        if let Some(theme) = cache.get(key) {
            return Ok(theme.clone());
        }
        let theme = self.sessions.load(key).await?.and_then(|state| state.theme);
        cache.insert(key.clone(), theme.clone());
        Ok(theme)
    }
}
