//! Recovery Campaign Scheduler.
//!
//! Owns every write to recovery campaign rows:
//!
//! - [`RecoveryScheduler::on_abandoned`] creates attempt 1 at
//!   `abandoned_at + delay(1)`
//! - [`RecoveryScheduler::tick`] sends due attempts and, after a successful
//!   send, schedules attempt N+1 at `sent_at + delay(N+1)` until the cap
//! - the outcome callbacks record opens, clicks and conversions
//! - [`RecoveryScheduler::on_subject_converted`] cancels pending attempts
//!
//! # Send-time checks
//!
//! Every due attempt is re-checked when it fires, in this order:
//!
//! 1. subject no longer abandoned (converted): cancel
//! 2. inside quiet hours: push `scheduled_at` to the end of the window
//! 3. customer already at the daily cap (local calendar day): push to the
//!    next local day
//!
//! Campaign rows are updated with compare-and-swap on their version. Two
//! workers firing the same attempt both pass the same dedup key to the email
//! sender, so the provider sees one message; only one row update commits.

use crate::MAX_CAS_ATTEMPTS;
use crate::calendar;
use crate::metrics::SchedulerMetrics;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use funnel_recovery_core::campaign::{
    CampaignId, CampaignStatus, CampaignStore, RecoveryCampaign,
};
use funnel_recovery_core::config::{AbandonmentRule, EngineConfig, QuietHours};
use funnel_recovery_core::email::{EmailMessage, EmailSender};
use funnel_recovery_core::error::{EngineError, Result, StoreError, ValidationError};
use funnel_recovery_core::event::{EventType, NewEvent};
use funnel_recovery_core::event_store::EventStore;
use funnel_recovery_core::session::{SessionState, SessionStateStore, SessionStatus};
use funnel_recovery_core::subject::{CustomerId, SubjectKey};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Emitted by the detector when a subject is abandoned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbandonmentEvent {
    /// Abandoned subject.
    pub subject: SubjectKey,
    /// Owner to recover.
    pub customer_id: Option<CustomerId>,
    /// Detector tick time.
    pub abandoned_at: DateTime<Utc>,
}

/// Counters returned by one send tick.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerReport {
    /// Due campaigns examined.
    pub due: u64,
    /// Emails sent.
    pub sent: u64,
    /// Delivery failures (retryable or not).
    pub failed: u64,
    /// Attempts cancelled because the subject converted.
    pub cancelled: u64,
    /// Attempts pushed forward by quiet hours or the daily cap.
    pub deferred: u64,
    /// Follow-up attempts scheduled after a send.
    pub followups: u64,
    /// Attempts another worker updated first.
    pub conflicts: u64,
    /// Attempts that could not be processed (storage errors).
    pub errors: u64,
}

/// What happened to one due campaign.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Dispatch {
    Sent { followup: bool },
    Cancelled,
    Deferred,
    Failed,
}

/// Recovery email scheduling and delivery.
#[derive(Clone)]
pub struct RecoveryScheduler {
    campaigns: Arc<dyn CampaignStore>,
    sessions: Arc<dyn SessionStateStore>,
    events: Arc<dyn EventStore>,
    sender: Arc<dyn EmailSender>,
}

impl RecoveryScheduler {
    /// Build a scheduler.
    #[must_use]
    pub fn new(
        campaigns: Arc<dyn CampaignStore>,
        sessions: Arc<dyn SessionStateStore>,
        events: Arc<dyn EventStore>,
        sender: Arc<dyn EmailSender>,
    ) -> Self {
        Self {
            campaigns,
            sessions,
            events,
            sender,
        }
    }

    /// Schedule attempt 1 for a freshly abandoned subject.
    ///
    /// Returns `None` when attempt 1 already exists (idempotent).
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn on_abandoned(
        &self,
        abandonment: &AbandonmentEvent,
        config: &EngineConfig,
    ) -> Result<Option<RecoveryCampaign>> {
        let rule = config.rule(abandonment.subject.subject_type);
        let scheduled_at = abandonment.abandoned_at + rule.delay_for_attempt(1);
        let campaign = new_attempt(
            &abandonment.subject,
            abandonment.customer_id.clone(),
            1,
            scheduled_at,
            abandonment.abandoned_at,
            rule,
        );

        if self.campaigns.insert(&campaign).await? {
            info!(
                subject = %abandonment.subject,
                campaign_id = %campaign.id,
                scheduled_at = %campaign.scheduled_at,
                "Recovery attempt 1 scheduled"
            );
            Ok(Some(campaign))
        } else {
            debug!(subject = %abandonment.subject, "Recovery attempt 1 already scheduled");
            Ok(None)
        }
    }

    /// Fire every due attempt at logical time `now`.
    ///
    /// A no-op when recovery emails are disabled; scheduled rows stay as
    /// they are and fire once emails are re-enabled.
    ///
    /// # Errors
    ///
    /// Invalid timezone/quiet-hours configuration or failure to list due
    /// campaigns. Per-campaign failures are counted, not returned.
    #[instrument(skip(self, config))]
    pub async fn tick(&self, now: DateTime<Utc>, config: &EngineConfig) -> Result<SchedulerReport> {
        let mut report = SchedulerReport::default();
        if !config.global.enable_recovery_emails {
            debug!("Recovery emails disabled, skipping send tick");
            return Ok(report);
        }

        let tz = config.global.tz()?;
        let quiet = config.global.quiet_hours()?;
        let due = self.campaigns.due(now, config.global.batch_size).await?;

        for campaign in due {
            report.due += 1;
            let campaign_id = campaign.id;
            let attempt = campaign.attempt_number;
            match self.dispatch(campaign, now, config, tz, quiet).await {
                Ok(Dispatch::Sent { followup }) => {
                    report.sent += 1;
                    report.followups += u64::from(followup);
                }
                Ok(Dispatch::Cancelled) => report.cancelled += 1,
                Ok(Dispatch::Deferred) => report.deferred += 1,
                Ok(Dispatch::Failed) => report.failed += 1,
                Err(e) if e.is_conflict() => {
                    debug!(campaign_id = %campaign_id, attempt, "Campaign updated by another worker");
                    report.conflicts += 1;
                }
                Err(e) => {
                    warn!(campaign_id = %campaign_id, attempt, error = %e, "Failed to process campaign");
                    report.errors += 1;
                }
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                sent = report.sent,
                failed = report.failed,
                cancelled = report.cancelled,
                deferred = report.deferred,
                "Recovery send tick finished"
            );
        }
        Ok(report)
    }

    async fn dispatch(
        &self,
        mut campaign: RecoveryCampaign,
        now: DateTime<Utc>,
        config: &EngineConfig,
        tz: Tz,
        quiet: Option<QuietHours>,
    ) -> Result<Dispatch> {
        let key = campaign.subject_key();
        let state = self.sessions.load(&key).await?;
        let Some(state) = state.filter(|s| s.status == SessionStatus::Abandoned) else {
            campaign.status = CampaignStatus::Cancelled;
            campaign.cancelled_at = Some(now);
            self.campaigns.update(&campaign).await?;
            SchedulerMetrics::record_cancelled();
            info!(
                campaign_id = %campaign.id,
                subject = %key,
                attempt = campaign.attempt_number,
                "Recovery attempt cancelled, subject no longer abandoned"
            );
            return Ok(Dispatch::Cancelled);
        };

        let Some(recipient) = campaign.customer_id.clone().or_else(|| state.customer_id.clone())
        else {
            campaign.status = CampaignStatus::Failed;
            campaign.last_error = Some("no recipient for subject".to_string());
            self.campaigns.update(&campaign).await?;
            SchedulerMetrics::record_failure(true);
            warn!(campaign_id = %campaign.id, subject = %key, "Recovery attempt has no recipient");
            return Ok(Dispatch::Failed);
        };

        let send_at = calendar::defer_past_quiet_hours(now, quiet, tz);
        if send_at > now {
            campaign.scheduled_at = send_at;
            self.campaigns.update(&campaign).await?;
            SchedulerMetrics::record_deferred("quiet_hours");
            debug!(campaign_id = %campaign.id, until = %send_at, "Deferred past quiet hours");
            return Ok(Dispatch::Deferred);
        }

        let (day_start, day_end) = calendar::day_bounds(calendar::local_date(now, tz), tz);
        let sent_today = self
            .campaigns
            .count_sent_to_customer(&recipient, day_start, day_end)
            .await?;
        if sent_today >= config.global.max_emails_per_customer_per_day {
            let until = calendar::defer_past_quiet_hours(calendar::next_local_midnight(now, tz), quiet, tz);
            campaign.scheduled_at = until;
            self.campaigns.update(&campaign).await?;
            SchedulerMetrics::record_deferred("daily_cap");
            debug!(
                campaign_id = %campaign.id,
                customer_id = %recipient,
                until = %until,
                "Deferred by daily send cap"
            );
            return Ok(Dispatch::Deferred);
        }

        let rule = config.rule(key.subject_type);
        let message = build_message(&campaign, &state, recipient, rule);
        match self.sender.send(&message).await {
            Ok(receipt) => {
                campaign.status = CampaignStatus::Sent;
                campaign.sent_at = Some(now);
                campaign.delivery_id = Some(receipt.delivery_id);
                campaign.customer_id = Some(message.recipient.clone());
                campaign.version = self.campaigns.update(&campaign).await?;
                SchedulerMetrics::record_sent();
                info!(
                    campaign_id = %campaign.id,
                    subject = %key,
                    attempt = campaign.attempt_number,
                    template_id = %message.template_id,
                    "Recovery email sent"
                );

                self.append_tracking(&campaign, EventType::RecoveryEmailSent, now)
                    .await;
                let followup = match self.schedule_next(&campaign, now, rule).await {
                    Ok(created) => created,
                    Err(e) => {
                        warn!(campaign_id = %campaign.id, error = %e, "Failed to schedule follow-up attempt");
                        false
                    }
                };
                Ok(Dispatch::Sent { followup })
            }
            Err(err) => {
                campaign.failure_count += 1;
                campaign.last_error = Some(err.message.clone());
                let permanent =
                    !err.retryable || campaign.failure_count > config.global.max_delivery_retries;
                if permanent {
                    campaign.status = CampaignStatus::Failed;
                }
                self.campaigns.update(&campaign).await?;
                SchedulerMetrics::record_failure(permanent);
                warn!(
                    campaign_id = %campaign.id,
                    attempt = campaign.attempt_number,
                    failure_count = campaign.failure_count,
                    permanent,
                    error = %err,
                    "Recovery email delivery failed"
                );
                Ok(Dispatch::Failed)
            }
        }
    }

    /// Schedule attempt N+1 after attempt N was sent.
    async fn schedule_next(
        &self,
        sent: &RecoveryCampaign,
        sent_at: DateTime<Utc>,
        rule: &AbandonmentRule,
    ) -> Result<bool> {
        if sent.attempt_number >= rule.max_recovery_emails {
            return Ok(false);
        }
        let key = sent.subject_key();
        let converted = self
            .sessions
            .load(&key)
            .await?
            .is_none_or(|state| state.status != SessionStatus::Abandoned);
        if converted {
            return Ok(false);
        }

        let attempt = sent.attempt_number + 1;
        let next = new_attempt(
            &key,
            sent.customer_id.clone(),
            attempt,
            sent_at + rule.delay_for_attempt(attempt),
            sent_at,
            rule,
        );
        let created = self.campaigns.insert(&next).await?;
        if created {
            info!(
                subject = %key,
                campaign_id = %next.id,
                attempt,
                scheduled_at = %next.scheduled_at,
                "Recovery follow-up scheduled"
            );
        }
        Ok(created)
    }

    /// Record that the email was opened.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown campaign, `Validation` if it was never sent.
    pub async fn record_opened(&self, id: CampaignId, at: DateTime<Utc>) -> Result<RecoveryCampaign> {
        let campaign = self
            .modify(id, |campaign| campaign.record_opened(at))
            .await?;
        if let Some(opened_at) = campaign.opened_at {
            self.append_tracking(&campaign, EventType::RecoveryEmailOpened, opened_at)
                .await;
        }
        Ok(campaign)
    }

    /// Record that the recovery link was clicked (backfilling the open).
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown campaign, `Validation` if it was never sent.
    pub async fn record_clicked(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<RecoveryCampaign> {
        let campaign = self
            .modify(id, |campaign| campaign.record_clicked(at))
            .await?;
        if let (Some(opened_at), Some(clicked_at)) = (campaign.opened_at, campaign.clicked_at) {
            self.append_tracking(&campaign, EventType::RecoveryEmailOpened, opened_at)
                .await;
            self.append_tracking(&campaign, EventType::RecoveryLinkClicked, clicked_at)
                .await;
        }
        Ok(campaign)
    }

    /// Record that the customer converted through this email.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown campaign, `Validation` if it was never sent.
    pub async fn record_converted(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<RecoveryCampaign> {
        self.modify(id, |campaign| campaign.record_converted(at))
            .await
    }

    /// React to a subject converting: cancel its pending attempts and credit
    /// the conversion to the latest sent attempt.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn on_subject_converted(&self, key: &SubjectKey, at: DateTime<Utc>) -> Result<()> {
        let campaigns = self.campaigns.for_subject(key).await?;

        for pending in campaigns
            .iter()
            .filter(|c| c.status == CampaignStatus::Scheduled)
        {
            let updated = self
                .modify(pending.id, |campaign| {
                    if campaign.status != CampaignStatus::Scheduled {
                        return Ok(false);
                    }
                    campaign.status = CampaignStatus::Cancelled;
                    campaign.cancelled_at = Some(at);
                    Ok(true)
                })
                .await?;
            if updated.cancelled_at == Some(at) {
                SchedulerMetrics::record_cancelled();
                info!(subject = %key, campaign_id = %pending.id, "Pending recovery attempt cancelled on conversion");
            }
        }

        let latest_sent = campaigns
            .iter()
            .filter(|c| c.status == CampaignStatus::Sent)
            .max_by_key(|c| c.attempt_number);
        if let Some(latest) = latest_sent {
            self.record_converted(latest.id, at).await?;
        }
        Ok(())
    }

    /// Load, mutate and compare-and-swap a campaign, reloading on conflict.
    async fn modify<F>(&self, id: CampaignId, mutate: F) -> Result<RecoveryCampaign>
    where
        F: Fn(&mut RecoveryCampaign) -> std::result::Result<bool, ValidationError> + Send + Sync,
    {
        let mut last_conflict = None;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut campaign = self
                .campaigns
                .get(id)
                .await?
                .ok_or_else(|| EngineError::NotFound {
                    entity: "recovery_campaign",
                    id: id.to_string(),
                })?;
            if !mutate(&mut campaign)? {
                return Ok(campaign);
            }
            match self.campaigns.update(&campaign).await {
                Ok(version) => {
                    campaign.version = version;
                    return Ok(campaign);
                }
                Err(conflict @ StoreError::ConcurrencyConflict { .. }) => {
                    debug!(campaign_id = %id, "Campaign changed concurrently, retrying");
                    last_conflict = Some(conflict);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_conflict.map_or_else(
            || EngineError::Storage("campaign update retries exhausted".to_string()),
            EngineError::from,
        ))
    }

    /// Append a recovery tracking event. Failures are logged only; the
    /// campaign row is the record of truth for outcomes.
    async fn append_tracking(
        &self,
        campaign: &RecoveryCampaign,
        event_type: EventType,
        at: DateTime<Utc>,
    ) {
        let event = NewEvent {
            subject_type: campaign.subject_type,
            subject_id: campaign.subject_id.clone(),
            customer_id: campaign.customer_id.clone(),
            event_type,
            occurred_at: at,
            metadata: json!({
                "campaignId": campaign.id.to_string(),
                "campaignType": campaign.campaign_type.as_str(),
                "attempt": campaign.attempt_number,
            }),
            idempotency_key: Some(format!("{event_type}:{}", campaign.id)),
        };
        if let Err(e) = self.events.append(event).await {
            warn!(campaign_id = %campaign.id, event_type = %event_type, error = %e, "Failed to record tracking event");
        }
    }
}

fn new_attempt(
    key: &SubjectKey,
    customer_id: Option<CustomerId>,
    attempt: u32,
    scheduled_at: DateTime<Utc>,
    now: DateTime<Utc>,
    rule: &AbandonmentRule,
) -> RecoveryCampaign {
    let mut campaign = RecoveryCampaign::scheduled(key, customer_id, attempt, scheduled_at, now);
    if rule.discount_for_attempt(attempt).is_some() {
        campaign.discount_code = Some(campaign.derive_discount_code());
    }
    campaign
}

fn build_message(
    campaign: &RecoveryCampaign,
    state: &SessionState,
    recipient: CustomerId,
    rule: &AbandonmentRule,
) -> EmailMessage {
    let mut variables = BTreeMap::new();
    variables.insert("subjectId".to_string(), campaign.subject_id.to_string());
    variables.insert("subjectType".to_string(), campaign.subject_type.to_string());
    variables.insert("attempt".to_string(), campaign.attempt_number.to_string());
    if let Some(theme) = &state.theme {
        variables.insert("theme".to_string(), theme.clone());
    }
    if let Some(discount) = rule.discount_for_attempt(campaign.attempt_number) {
        let code = campaign
            .discount_code
            .clone()
            .unwrap_or_else(|| campaign.derive_discount_code());
        variables.insert("discountCode".to_string(), code);
        variables.insert("discountValue".to_string(), discount.display_value());
    }

    EmailMessage {
        recipient,
        template_id: campaign.template_id(),
        variables,
        dedup_key: campaign.dedup_key(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use funnel_recovery_core::subject::{SubjectId, SubjectType};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T01:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn abandoned_state(key: &SubjectKey) -> SessionState {
        let mut state = SessionState::new(key, Some(CustomerId::new("cust-1")), t0());
        state.status = SessionStatus::Abandoned;
        state.abandoned_at = Some(t0());
        state.theme = Some("BDAY".to_string());
        state
    }

    #[test]
    fn discount_code_only_on_configured_attempt() {
        let config = EngineConfig::default();
        let key = SubjectKey::new(SubjectType::DesignSession, SubjectId::new("ds-1"));
        let first = new_attempt(&key, None, 1, t0(), t0(), &config.design_abandonment);
        let second = new_attempt(&key, None, 2, t0(), t0(), &config.design_abandonment);
        assert!(first.discount_code.is_none());
        assert_eq!(second.discount_code, Some(second.derive_discount_code()));
    }

    #[test]
    fn message_carries_template_variables_and_dedup_key() {
        let config = EngineConfig::default();
        let key = SubjectKey::new(SubjectType::CartItem, SubjectId::new("ci-1"));
        let campaign = new_attempt(
            &key,
            Some(CustomerId::new("cust-1")),
            2,
            t0() + Duration::hours(1),
            t0(),
            &config.cart_abandonment,
        );
        let message = build_message(
            &campaign,
            &abandoned_state(&key),
            CustomerId::new("cust-1"),
            &config.cart_abandonment,
        );

        assert_eq!(message.template_id, "cart_abandoned_attempt_2");
        assert_eq!(message.dedup_key, format!("{}:2", campaign.id));
        assert_eq!(message.variables.get("theme").map(String::as_str), Some("BDAY"));
        assert_eq!(
            message.variables.get("discountValue").map(String::as_str),
            Some("5000")
        );
        assert!(message.variables["discountCode"].starts_with("RECOVER-"));
    }
}
