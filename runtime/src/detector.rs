//! Abandonment Detector: the periodic inactivity sweep.
//!
//! Each tick lists eligible `in_progress` subjects whose last activity is
//! older than the configured threshold and tries to move each one to
//! `abandoned` with a compare-and-swap save. Only the writer whose save
//! commits goes on to append the abandonment marker event and hand the
//! subject to the recovery scheduler, so overlapping sweeps (on one worker or
//! many) produce exactly one transition per subject.
//!
//! If that hand-off fails after the transition committed, the subject is
//! left `abandoned` with no first attempt. Every tick also runs a repair
//! pass over such subjects and repeats the hand-off; the marker's
//! idempotency key and the per-attempt campaign uniqueness make a repeat
//! harmless.
//!
//! Failures are isolated per subject: they are logged, counted in the
//! [`DetectorReport`] and the sweep moves on.

use crate::metrics::DetectorMetrics;
use crate::scheduler::{AbandonmentEvent, RecoveryScheduler};
use crate::tracker;
use chrono::{DateTime, Utc};
use funnel_recovery_core::config::EngineConfig;
use funnel_recovery_core::error::{EngineError, Result};
use funnel_recovery_core::event::NewEvent;
use funnel_recovery_core::event_store::EventStore;
use funnel_recovery_core::session::{SessionState, SessionStateStore};
use funnel_recovery_core::subject::SubjectType;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Counters returned by one detector tick.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DetectorReport {
    /// Candidates examined.
    pub processed: u64,
    /// Subjects this tick moved to `abandoned`.
    pub abandoned: u64,
    /// Candidates another writer changed first.
    pub conflicts: u64,
    /// Candidates whose processing failed.
    pub failed: u64,
    /// Earlier abandonments whose first attempt this tick scheduled.
    pub repaired: u64,
}

impl DetectorReport {
    fn merge(&mut self, other: Self) {
        self.processed += other.processed;
        self.abandoned += other.abandoned;
        self.conflicts += other.conflicts;
        self.failed += other.failed;
        self.repaired += other.repaired;
    }
}

/// Periodic abandonment sweep.
#[derive(Clone)]
pub struct AbandonmentDetector {
    sessions: Arc<dyn SessionStateStore>,
    events: Arc<dyn EventStore>,
    scheduler: Arc<RecoveryScheduler>,
}

impl AbandonmentDetector {
    /// Build a detector over the given stores.
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionStateStore>,
        events: Arc<dyn EventStore>,
        scheduler: Arc<RecoveryScheduler>,
    ) -> Self {
        Self {
            sessions,
            events,
            scheduler,
        }
    }

    /// Run one sweep at logical time `now`.
    #[instrument(skip(self, config))]
    pub async fn tick(&self, now: DateTime<Utc>, config: &EngineConfig) -> DetectorReport {
        let mut report = DetectorReport::default();
        for subject_type in SubjectType::ALL {
            report.merge(self.sweep(subject_type, now, config).await);
            report.merge(self.repair(subject_type, now, config).await);
        }
        DetectorMetrics::record_sweep(
            report.processed,
            report.abandoned,
            report.conflicts,
            report.failed,
        );
        DetectorMetrics::record_repaired(report.repaired);
        if report.abandoned > 0 || report.failed > 0 || report.repaired > 0 {
            info!(
                processed = report.processed,
                abandoned = report.abandoned,
                conflicts = report.conflicts,
                failed = report.failed,
                repaired = report.repaired,
                "Abandonment sweep finished"
            );
        } else {
            debug!(processed = report.processed, "Abandonment sweep found nothing to do");
        }
        report
    }

    async fn sweep(
        &self,
        subject_type: SubjectType,
        now: DateTime<Utc>,
        config: &EngineConfig,
    ) -> DetectorReport {
        let mut report = DetectorReport::default();
        let threshold = config.rule(subject_type).threshold();

        let candidates = match self
            .sessions
            .abandonment_candidates(subject_type, now - threshold, config.global.batch_size)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(subject_type = %subject_type, error = %e, "Failed to list abandonment candidates");
                report.failed += 1;
                return report;
            }
        };

        for candidate in candidates {
            report.processed += 1;
            let key = candidate.key();
            match self.abandon(&candidate, now, config).await {
                Ok(None) => {
                    debug!(subject = %key, "Candidate no longer due");
                }
                Ok(Some(abandoned)) => {
                    report.abandoned += 1;
                    if let Err(e) = self.announce(&abandoned, now, config).await {
                        warn!(subject = %key, error = %e, "Abandonment follow-up failed");
                        report.failed += 1;
                    }
                }
                Err(e) if e.is_conflict() => {
                    debug!(subject = %key, "Lost abandonment race to a concurrent writer");
                    report.conflicts += 1;
                }
                Err(e) => {
                    warn!(subject = %key, error = %e, "Failed to abandon subject");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Re-run the hand-off for abandoned subjects that never got attempt 1.
    async fn repair(
        &self,
        subject_type: SubjectType,
        now: DateTime<Utc>,
        config: &EngineConfig,
    ) -> DetectorReport {
        let mut report = DetectorReport::default();
        let stranded = match self
            .sessions
            .unscheduled_abandonments(subject_type, config.global.batch_size)
            .await
        {
            Ok(stranded) => stranded,
            Err(e) => {
                warn!(subject_type = %subject_type, error = %e, "Failed to list unscheduled abandonments");
                report.failed += 1;
                return report;
            }
        };

        for state in stranded {
            let key = state.key();
            match self.announce(&state, now, config).await {
                Ok(true) => {
                    info!(subject = %key, abandoned_at = ?state.abandoned_at, "Recovered lost abandonment hand-off");
                    report.repaired += 1;
                }
                Ok(false) => {
                    debug!(subject = %key, "First attempt already scheduled by another writer");
                }
                Err(e) => {
                    warn!(subject = %key, error = %e, "Abandonment repair failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Commit the transition. `Ok(None)` when the subject is not due.
    async fn abandon(
        &self,
        candidate: &SessionState,
        now: DateTime<Utc>,
        config: &EngineConfig,
    ) -> Result<Option<SessionState>> {
        let threshold = config.rule(candidate.subject_type).threshold();
        let Some(mut next) = tracker::mark_abandoned(candidate, now, threshold, &config.eligibility)
        else {
            return Ok(None);
        };
        next.version = self.sessions.save(&next).await?;
        info!(
            subject = %next.key(),
            customer_id = ?next.customer_id,
            last_activity_at = %next.last_activity_at,
            "Subject abandoned"
        );
        Ok(Some(next))
    }

    /// Record the marker event and schedule the first recovery attempt,
    /// both stamped with the subject's `abandoned_at`. Returns whether this
    /// call created the attempt.
    async fn announce(
        &self,
        state: &SessionState,
        now: DateTime<Utc>,
        config: &EngineConfig,
    ) -> Result<bool> {
        let key = state.key();
        let abandoned_at = state.abandoned_at.unwrap_or(now);
        self.events
            .append(NewEvent::abandonment_marker(
                &key,
                state.customer_id.clone(),
                abandoned_at,
            ))
            .await
            .map_err(EngineError::from)?;

        let abandonment = AbandonmentEvent {
            subject: key,
            customer_id: state.customer_id.clone(),
            abandoned_at,
        };
        Ok(self.scheduler.on_abandoned(&abandonment, config).await?.is_some())
    }
}
