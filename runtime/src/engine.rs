//! The engine facade: ingestion plus entry points for every periodic task.
//!
//! [`Engine::ingest`] is the write path for external events:
//!
//! 1. validate the input (nothing is written on failure)
//! 2. append it to the event store (idempotency keys deduplicate)
//! 3. bring the subject's state up to date and save it with compare-and-swap
//!
//! Step 3 folds every event positioned after the state's last applied event,
//! so it also picks up events whose state update was lost to a crash. An
//! event that sorts before the last applied one triggers a full replay of the
//! subject instead. A save that loses a race reloads and tries again.

use crate::aggregator::DailyAggregator;
use crate::calendar;
use crate::detector::{AbandonmentDetector, DetectorReport};
use crate::metrics::IngestMetrics;
use crate::query::QueryService;
use crate::scheduler::{RecoveryScheduler, SchedulerReport};
use crate::tracker;
use crate::{MAX_CAS_ATTEMPTS, Stores};
use chrono::{DateTime, Days, NaiveDate, Utc};
use funnel_recovery_core::aggregate::DailyAggregate;
use funnel_recovery_core::campaign::{CampaignId, RecoveryCampaign};
use funnel_recovery_core::config::{ConfigHandle, EngineConfig};
use funnel_recovery_core::email::EmailSender;
use funnel_recovery_core::environment::Clock;
use funnel_recovery_core::error::{EngineError, Result, StoreError};
use funnel_recovery_core::event::{Event, EventId, EventInput};
use funnel_recovery_core::session::SessionState;
use funnel_recovery_core::subject::{SubjectKey, Version};
use futures::TryStreamExt;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Result of ingesting one event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    /// Stored event id (the original's for a duplicate).
    pub event_id: EventId,
    /// The idempotency key matched an existing event.
    pub duplicate: bool,
    /// Subject state after the event, `None` when the state update gave up
    /// after repeated conflicts (the next event or a rebuild catches it up).
    pub state: Option<SessionState>,
}

/// How to bring a subject's stored state up to date.
#[derive(Copy, Clone, Debug)]
enum SyncMode {
    /// Fold new events; fall back to a replay if `trigger` sorts before the
    /// last applied event.
    CatchUp {
        trigger: Option<(DateTime<Utc>, EventId)>,
    },
    /// Replay the whole stream.
    Rebuild,
}

/// Ingestion, background ticks and queries over one set of stores.
#[derive(Clone)]
pub struct Engine {
    stores: Stores,
    scheduler: Arc<RecoveryScheduler>,
    detector: AbandonmentDetector,
    aggregator: DailyAggregator,
    query: QueryService,
    clock: Arc<dyn Clock>,
    config: ConfigHandle,
}

impl Engine {
    /// Wire an engine.
    #[must_use]
    pub fn new(
        stores: Stores,
        sender: Arc<dyn EmailSender>,
        clock: Arc<dyn Clock>,
        config: ConfigHandle,
    ) -> Self {
        let scheduler = Arc::new(RecoveryScheduler::new(
            Arc::clone(&stores.campaigns),
            Arc::clone(&stores.sessions),
            Arc::clone(&stores.events),
            sender,
        ));
        let detector = AbandonmentDetector::new(
            Arc::clone(&stores.sessions),
            Arc::clone(&stores.events),
            Arc::clone(&scheduler),
        );
        let aggregator = DailyAggregator::new(
            Arc::clone(&stores.events),
            Arc::clone(&stores.sessions),
            Arc::clone(&stores.campaigns),
            Arc::clone(&stores.aggregates),
        );
        let query = QueryService::new(
            Arc::clone(&stores.sessions),
            Arc::clone(&stores.campaigns),
            Arc::clone(&stores.aggregates),
        );
        Self {
            stores,
            scheduler,
            detector,
            aggregator,
            query,
            clock,
            config,
        }
    }

    /// Validate, store and apply one external event.
    ///
    /// # Errors
    ///
    /// - `Validation` for malformed input (nothing is written)
    /// - `Storage` when the append or the state update fails
    #[instrument(skip(self, input), fields(event_type = ?input.event_type, subject_id = ?input.subject_id))]
    pub async fn ingest(&self, input: EventInput) -> Result<IngestOutcome> {
        let config = self.config.snapshot();
        let now = self.clock.now();

        let event = match input.validate(now, config.global.clock_skew_tolerance()) {
            Ok(event) => event,
            Err(e) => {
                IngestMetrics::record_rejected();
                debug!(error = %e, "Event rejected");
                return Err(e.into());
            }
        };
        let key = event.subject_key();
        let occurred_at = event.occurred_at;

        let appended = self.stores.events.append(event).await?;
        IngestMetrics::record_accepted(appended.duplicate);

        // A duplicate's stored timestamp may differ from the resent one.
        let trigger = (!appended.duplicate).then_some((occurred_at, appended.id));
        let state = match self
            .sync_subject(&key, SyncMode::CatchUp { trigger }, &config)
            .await
        {
            Ok(state) => state,
            Err(e) if e.is_conflict() => {
                warn!(subject = %key, error = %e, "Gave up updating session state after repeated conflicts");
                None
            }
            Err(e) => return Err(e),
        };

        Ok(IngestOutcome {
            event_id: appended.id,
            duplicate: appended.duplicate,
            state,
        })
    }

    /// Recompute a subject's state from its full event stream and save it.
    ///
    /// A committed abandonment is kept even if its marker event is missing
    /// from the stream.
    ///
    /// # Errors
    ///
    /// `NotFound` when the subject has no events; `ConcurrencyConflict` if the
    /// save keeps losing races.
    pub async fn rebuild_subject(&self, key: &SubjectKey) -> Result<SessionState> {
        let config = self.config.snapshot();
        self.sync_subject(key, SyncMode::Rebuild, &config)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "subject_events",
                id: key.to_string(),
            })
    }

    async fn sync_subject(
        &self,
        key: &SubjectKey,
        mode: SyncMode,
        config: &EngineConfig,
    ) -> Result<Option<SessionState>> {
        let rules = &config.eligibility;
        let mut last_conflict = None;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let stored = self.stores.sessions.load(key).await?;

            let replay = match mode {
                SyncMode::Rebuild => true,
                SyncMode::CatchUp { trigger } => trigger.is_some_and(|position| {
                    stored
                        .as_ref()
                        .and_then(SessionState::last_position)
                        .is_some_and(|last| position < last)
                }),
            };

            let next = if replay {
                let events: Vec<Event> = self.stores.events.query(key, None).try_collect().await?;
                if events.is_empty() && matches!(mode, SyncMode::Rebuild) {
                    return Err(EngineError::NotFound {
                        entity: "subject_events",
                        id: key.to_string(),
                    });
                }
                debug!(subject = %key, events = events.len(), "Replaying subject stream");
                tracker::replay(&events, rules)
                    .map(|replayed| match &stored {
                        Some(stored) => tracker::retain_abandonment(replayed, stored),
                        None => replayed,
                    })
            } else {
                let since = stored.as_ref().and_then(|s| s.last_event_id);
                let mut state = stored.clone();
                let mut stream = self.stores.events.query(key, since);
                while let Some(event) = stream.try_next().await? {
                    state = Some(tracker::apply_event(state, &event, rules));
                }
                state
            };

            let Some(mut next) = next else {
                return Ok(stored);
            };
            next.version = stored.as_ref().map_or(Version::INITIAL, |s| s.version);
            if stored.as_ref() == Some(&next) {
                return Ok(stored);
            }

            match self.stores.sessions.save(&next).await {
                Ok(version) => {
                    next.version = version;
                    self.after_save(stored.as_ref(), &next).await;
                    return Ok(Some(next));
                }
                Err(conflict @ StoreError::ConcurrencyConflict { .. }) => {
                    debug!(subject = %key, attempt, "Session state changed concurrently, retrying");
                    last_conflict = Some(conflict);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_conflict.map_or_else(
            || EngineError::Storage("session state update retries exhausted".to_string()),
            EngineError::from,
        ))
    }

    /// Side effects of a committed state change.
    async fn after_save(&self, before: Option<&SessionState>, after: &SessionState) {
        let was_converted = before.is_some_and(SessionState::is_converted);
        if was_converted || !after.is_converted() {
            return;
        }
        let key = after.key();
        let at = after.converted_at.unwrap_or(after.updated_at);
        info!(subject = %key, converted_at = %at, "Subject converted");
        if let Err(e) = self.scheduler.on_subject_converted(&key, at).await {
            warn!(subject = %key, error = %e, "Failed to settle campaigns for converted subject");
        }
    }

    /// Run one abandonment sweep at the clock's current time.
    pub async fn run_detector(&self) -> DetectorReport {
        let config = self.config.snapshot();
        self.detector.tick(self.clock.now(), &config).await
    }

    /// Run one send tick at the clock's current time.
    ///
    /// # Errors
    ///
    /// Invalid timezone configuration or failure to list due campaigns.
    pub async fn run_scheduler(&self) -> Result<SchedulerReport> {
        let config = self.config.snapshot();
        self.scheduler.tick(self.clock.now(), &config).await
    }

    /// Compute and upsert the aggregate for `date`.
    ///
    /// # Errors
    ///
    /// Invalid timezone or storage failure; the previous row stays intact.
    pub async fn run_aggregator(&self, date: NaiveDate) -> Result<DailyAggregate> {
        let config = self.config.snapshot();
        self.aggregator.run(date, &config).await
    }

    /// Aggregate the local calendar day before today.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::run_aggregator`].
    pub async fn aggregate_previous_day(&self) -> Result<DailyAggregate> {
        let config = self.config.snapshot();
        let tz = config.global.tz()?;
        let today = calendar::local_date(self.clock.now(), tz);
        let yesterday = today.checked_sub_days(Days::new(1)).unwrap_or(today);
        self.aggregator.run(yesterday, &config).await
    }

    /// Delivery callback: the email was opened.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown campaign, `Validation` if it was never sent.
    pub async fn record_email_opened(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<RecoveryCampaign> {
        self.scheduler.record_opened(id, at).await
    }

    /// Delivery callback: the recovery link was clicked.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown campaign, `Validation` if it was never sent.
    pub async fn record_link_clicked(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<RecoveryCampaign> {
        self.scheduler.record_clicked(id, at).await
    }

    /// Attribution callback: the customer converted through this email.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown campaign, `Validation` if it was never sent.
    pub async fn record_conversion(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<RecoveryCampaign> {
        self.scheduler.record_converted(id, at).await
    }

    /// Read-only queries.
    #[must_use]
    pub const fn query(&self) -> &QueryService {
        &self.query
    }

    /// Live configuration.
    #[must_use]
    pub const fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// The scheduler, for callers that drive it directly.
    #[must_use]
    pub fn scheduler(&self) -> &RecoveryScheduler {
        &self.scheduler
    }

    /// Underlying stores.
    #[must_use]
    pub const fn stores(&self) -> &Stores {
        &self.stores
    }
}
