//! End-to-end scenarios: activity, abandonment, recovery emails, conversion.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::{DateTime, Duration, Utc};
use funnel_recovery_core::campaign::CampaignStatus;
use funnel_recovery_core::config::EngineConfig;
use funnel_recovery_core::environment::Clock;
use funnel_recovery_core::error::{DeliveryError, EngineError};
use funnel_recovery_core::event::EventType;
use funnel_recovery_core::session::SessionStatus;
use funnel_recovery_core::subject::SubjectKey;
use funnel_recovery_testing::{
    EventBuilder, InMemoryAggregateStore, InMemoryCampaignStore, InMemoryEventStore,
    InMemorySessionStore, MockEmailSender, TestEngine, design_session, test_clock, test_engine,
};
use funnel_recovery_runtime::{Engine, Stores};
use std::sync::Arc;

// ============================================================================
// Fixtures
// ============================================================================

fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

/// Upload a photo to `key` as `customer` at the clock's current time.
async fn start_design(h: &TestEngine, key: &SubjectKey, customer: &str) {
    let input = EventBuilder::new(key, EventType::PhotoUploaded)
        .customer(customer)
        .theme("BDAY")
        .at(h.clock.now())
        .input();
    h.engine.ingest(input).await.unwrap();
}

async fn ingest(h: &TestEngine, key: &SubjectKey, event_type: EventType) {
    let input = EventBuilder::new(key, event_type).at(h.clock.now()).input();
    h.engine.ingest(input).await.unwrap();
}

/// Start a design and let it go quiet long enough to be abandoned.
async fn abandoned_design(h: &TestEngine, id: &str, customer: &str) -> SubjectKey {
    let key = design_session(id);
    start_design(h, &key, customer).await;
    h.clock.advance(Duration::minutes(61));
    h.engine.run_detector().await;
    key
}

fn markers(h: &TestEngine, key: &SubjectKey) -> usize {
    h.events
        .for_subject(key)
        .iter()
        .filter(|e| e.event_type == EventType::DesignAbandoned)
        .count()
}

// ============================================================================
// Detection
// ============================================================================

#[tokio::test]
async fn abandons_after_61_minutes_but_not_59() {
    let h = test_engine(EngineConfig::default());
    let t = h.clock.now();
    let key = design_session("ds-1");
    start_design(&h, &key, "cust-1").await;

    h.clock.set(t + Duration::minutes(59));
    let early = h.engine.run_detector().await;
    assert_eq!(early.abandoned, 0);
    assert_eq!(h.sessions.get(&key).unwrap().status, SessionStatus::InProgress);
    assert!(h.campaigns.is_empty());

    h.clock.set(t + Duration::minutes(61));
    let report = h.engine.run_detector().await;
    assert_eq!(report.abandoned, 1);

    let state = h.sessions.get(&key).unwrap();
    assert_eq!(state.status, SessionStatus::Abandoned);
    assert_eq!(state.abandoned_at, Some(t + Duration::minutes(61)));
    assert!(!state.eligible_for_abandonment);

    let campaigns = h.campaigns.for_key(&key);
    assert_eq!(campaigns.len(), 1);
    assert_eq!(campaigns[0].attempt_number, 1);
    assert_eq!(campaigns[0].status, CampaignStatus::Scheduled);
    assert_eq!(campaigns[0].scheduled_at, t + Duration::minutes(61 + 120));
    assert_eq!(markers(&h, &key), 1);
}

#[tokio::test]
async fn exact_threshold_is_not_yet_due() {
    let h = test_engine(EngineConfig::default());
    let t = h.clock.now();
    let key = design_session("ds-1");
    start_design(&h, &key, "cust-1").await;

    h.clock.set(t + Duration::minutes(60));
    assert_eq!(h.engine.run_detector().await.abandoned, 0);
    assert!(h.campaigns.for_key(&key).is_empty());

    h.clock.set(t + Duration::minutes(60) + Duration::seconds(1));
    assert_eq!(h.engine.run_detector().await.abandoned, 1);
}

#[tokio::test]
async fn repeated_detector_tick_is_a_no_op() {
    let h = test_engine(EngineConfig::default());
    let key = abandoned_design(&h, "ds-1", "cust-1").await;

    let again = h.engine.run_detector().await;
    assert_eq!(again.abandoned, 0);
    assert_eq!(again.processed, 0);
    assert_eq!(markers(&h, &key), 1);
    assert_eq!(h.campaigns.for_key(&key).len(), 1);
}

#[tokio::test]
async fn subjects_without_photos_are_not_abandoned() {
    let h = test_engine(EngineConfig::default());
    let key = design_session("ds-1");
    ingest(&h, &key, EventType::ThemeSelected).await;

    h.clock.advance(Duration::hours(5));
    assert_eq!(h.engine.run_detector().await.abandoned, 0);
}

#[tokio::test]
async fn concurrent_detectors_abandon_exactly_once() {
    let clock = test_clock();
    let events = InMemoryEventStore::new();
    let campaigns = InMemoryCampaignStore::new();
    let sessions = InMemorySessionStore::new()
        .with_campaigns(campaigns.clone())
        .interleaved();
    let stores = Stores {
        events: Arc::new(events.clone()),
        sessions: Arc::new(sessions.clone()),
        campaigns: Arc::new(campaigns.clone()),
        aggregates: Arc::new(InMemoryAggregateStore::new()),
    };
    let config = funnel_recovery_core::config::ConfigHandle::new(EngineConfig::default()).unwrap();
    let engine = Engine::new(
        stores,
        Arc::new(MockEmailSender::new()),
        Arc::new(clock.clone()),
        config,
    );

    let key = design_session("ds-1");
    let input = EventBuilder::new(&key, EventType::PhotoUploaded)
        .at(clock.now())
        .input();
    engine.ingest(input).await.unwrap();
    clock.advance(Duration::minutes(61));

    let first = engine.clone();
    let second = engine.clone();
    let (a, b) = tokio::join!(first.run_detector(), second.run_detector());

    assert_eq!(a.abandoned + b.abandoned, 1);
    assert_eq!(a.processed + b.processed, 2);
    assert_eq!(a.conflicts + b.conflicts, 1);
    let marker_count = events
        .for_subject(&key)
        .iter()
        .filter(|e| e.event_type.is_system_marker())
        .count();
    assert_eq!(marker_count, 1);
    assert_eq!(campaigns.for_key(&key).len(), 1);
    assert_eq!(sessions.get(&key).unwrap().status, SessionStatus::Abandoned);
}

#[tokio::test]
async fn lost_hand_off_is_repaired_on_a_later_tick() {
    let h = test_engine(EngineConfig::default());
    let t = h.clock.now();
    let key = design_session("ds-1");
    start_design(&h, &key, "cust-1").await;

    // Both the sweep's insert and the same-tick repair fail.
    h.campaigns.fail_inserts(2);
    h.clock.set(t + Duration::minutes(61));
    let first = h.engine.run_detector().await;
    assert_eq!(first.abandoned, 1);
    assert_eq!(first.failed, 2);
    assert_eq!(first.repaired, 0);
    assert_eq!(h.sessions.get(&key).unwrap().status, SessionStatus::Abandoned);
    assert!(h.campaigns.for_key(&key).is_empty());

    h.clock.set(t + Duration::minutes(62));
    let second = h.engine.run_detector().await;
    assert_eq!(second.abandoned, 0);
    assert_eq!(second.repaired, 1);

    let campaigns = h.campaigns.for_key(&key);
    assert_eq!(campaigns.len(), 1);
    assert_eq!(campaigns[0].attempt_number, 1);
    assert_eq!(campaigns[0].scheduled_at, t + Duration::minutes(61 + 120));
    assert_eq!(markers(&h, &key), 1);

    let third = h.engine.run_detector().await;
    assert_eq!(third.repaired, 0);
    assert_eq!(h.campaigns.for_key(&key).len(), 1);

    h.clock.set(t + Duration::minutes(61 + 120));
    assert_eq!(h.engine.run_scheduler().await.unwrap().sent, 1);
}

// ============================================================================
// Sending
// ============================================================================

#[tokio::test]
async fn sends_first_attempt_when_due_and_schedules_the_next() {
    let h = test_engine(EngineConfig::default());
    let key = abandoned_design(&h, "ds-1", "cust-1").await;
    let scheduled_at = h.campaigns.for_key(&key)[0].scheduled_at;

    h.clock.set(scheduled_at - Duration::minutes(1));
    assert_eq!(h.engine.run_scheduler().await.unwrap().sent, 0);

    h.clock.set(scheduled_at);
    let report = h.engine.run_scheduler().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.followups, 1);

    let sent = h.sender.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template_id, "design_abandoned_attempt_1");
    assert_eq!(sent[0].recipient.as_str(), "cust-1");
    assert_eq!(sent[0].variables["theme"], "BDAY");
    assert!(!sent[0].variables.contains_key("discountCode"));

    let campaigns = h.campaigns.for_key(&key);
    assert_eq!(campaigns.len(), 2);
    assert_eq!(campaigns[0].status, CampaignStatus::Sent);
    assert_eq!(campaigns[0].sent_at, Some(scheduled_at));
    assert_eq!(campaigns[1].attempt_number, 2);
    assert_eq!(campaigns[1].scheduled_at, scheduled_at + Duration::minutes(1440));
    assert_eq!(
        campaigns[1].discount_code,
        Some(campaigns[1].derive_discount_code())
    );

    let tracking = h
        .events
        .for_subject(&key)
        .iter()
        .filter(|e| e.event_type == EventType::RecoveryEmailSent)
        .count();
    assert_eq!(tracking, 1);
}

#[tokio::test]
async fn repeated_scheduler_tick_sends_once() {
    let h = test_engine(EngineConfig::default());
    let key = abandoned_design(&h, "ds-1", "cust-1").await;
    h.clock.set(h.campaigns.for_key(&key)[0].scheduled_at);

    h.engine.run_scheduler().await.unwrap();
    let again = h.engine.run_scheduler().await.unwrap();
    assert_eq!(again.sent, 0);
    assert_eq!(h.sender.sent_count(), 1);
}

#[tokio::test]
async fn stops_after_the_configured_number_of_attempts() {
    let h = test_engine(EngineConfig::default());
    let key = abandoned_design(&h, "ds-1", "cust-1").await;

    for _ in 0..5 {
        let next = h
            .campaigns
            .for_key(&key)
            .into_iter()
            .filter(|c| c.status == CampaignStatus::Scheduled)
            .map(|c| c.scheduled_at)
            .min();
        let Some(next) = next else { break };
        h.clock.set(next);
        h.engine.run_scheduler().await.unwrap();
    }

    let attempts: Vec<u32> = h
        .campaigns
        .for_key(&key)
        .iter()
        .map(|c| c.attempt_number)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(h.sender.sent_count(), 3);
    let templates: Vec<String> = h.sender.sent().into_iter().map(|m| m.template_id).collect();
    assert_eq!(templates[2], "design_abandoned_attempt_3");
}

#[tokio::test]
async fn quiet_hours_defer_to_morning() {
    let h = test_engine(EngineConfig::default());
    // 21:00 in Seoul; attempt 1 falls due just after midnight local time.
    h.clock.set(utc("2025-01-01T12:00:00Z"));
    let key = abandoned_design(&h, "ds-1", "cust-1").await;
    let due = h.campaigns.for_key(&key)[0].scheduled_at;
    assert_eq!(due, utc("2025-01-01T15:01:00Z"));

    h.clock.set(due);
    let report = h.engine.run_scheduler().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(h.sender.sent_count(), 0);
    assert_eq!(
        h.campaigns.for_key(&key)[0].scheduled_at,
        utc("2025-01-01T23:00:00Z")
    );

    h.clock.set(utc("2025-01-01T23:00:00Z"));
    assert_eq!(h.engine.run_scheduler().await.unwrap().sent, 1);
}

#[tokio::test]
async fn daily_cap_defers_second_email_to_next_local_morning() {
    let h = test_engine(EngineConfig::default());
    let first = design_session("ds-1");
    let second = design_session("ds-2");
    start_design(&h, &first, "cust-1").await;
    start_design(&h, &second, "cust-1").await;
    h.clock.advance(Duration::minutes(61));
    assert_eq!(h.engine.run_detector().await.abandoned, 2);

    h.clock.advance(Duration::minutes(120));
    let report = h.engine.run_scheduler().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.deferred, 1);

    let deferred = h
        .campaigns
        .all()
        .into_iter()
        .find(|c| c.status == CampaignStatus::Scheduled && c.attempt_number == 1)
        .unwrap();
    // Next local midnight is inside quiet hours, so it lands at 08:00 Seoul.
    assert_eq!(deferred.scheduled_at, utc("2025-01-01T23:00:00Z"));
}

#[tokio::test]
async fn transient_failures_retry_then_fail() {
    let h = test_engine(EngineConfig::default());
    let key = abandoned_design(&h, "ds-1", "cust-1").await;
    h.clock.set(h.campaigns.for_key(&key)[0].scheduled_at);
    h.sender.fail_always(DeliveryError::transient("provider timeout"));

    for expected_failures in 1..=2 {
        assert_eq!(h.engine.run_scheduler().await.unwrap().failed, 1);
        let campaign = &h.campaigns.for_key(&key)[0];
        assert_eq!(campaign.status, CampaignStatus::Scheduled);
        assert_eq!(campaign.failure_count, expected_failures);
    }

    assert_eq!(h.engine.run_scheduler().await.unwrap().failed, 1);
    let campaign = &h.campaigns.for_key(&key)[0];
    assert_eq!(campaign.status, CampaignStatus::Failed);
    assert_eq!(campaign.last_error.as_deref(), Some("provider timeout"));

    h.sender.recover();
    assert_eq!(h.engine.run_scheduler().await.unwrap().due, 0);
    assert_eq!(h.sender.attempts(), 3);
}

#[tokio::test]
async fn permanent_failure_fails_immediately() {
    let h = test_engine(EngineConfig::default());
    let key = abandoned_design(&h, "ds-1", "cust-1").await;
    h.clock.set(h.campaigns.for_key(&key)[0].scheduled_at);
    h.sender.fail_next(DeliveryError::permanent("invalid address"));

    h.engine.run_scheduler().await.unwrap();
    let campaigns = h.campaigns.for_key(&key);
    assert_eq!(campaigns.len(), 1);
    assert_eq!(campaigns[0].status, CampaignStatus::Failed);
    assert_eq!(campaigns[0].failure_count, 1);
}

#[tokio::test]
async fn disabled_recovery_emails_keep_campaigns_scheduled() {
    let mut config = EngineConfig::default();
    config.global.enable_recovery_emails = false;
    let h = test_engine(config);
    let key = abandoned_design(&h, "ds-1", "cust-1").await;
    h.clock.set(h.campaigns.for_key(&key)[0].scheduled_at);

    let report = h.engine.run_scheduler().await.unwrap();
    assert_eq!(report.due, 0);
    assert_eq!(h.sender.sent_count(), 0);
    assert_eq!(h.campaigns.for_key(&key)[0].status, CampaignStatus::Scheduled);

    h.engine
        .config()
        .apply_patch(&serde_json::json!({ "global": { "enableRecoveryEmails": true } }))
        .unwrap();
    assert_eq!(h.engine.run_scheduler().await.unwrap().sent, 1);
}

// ============================================================================
// Conversion and outcomes
// ============================================================================

#[tokio::test]
async fn conversion_before_send_cancels_the_pending_attempt() {
    let h = test_engine(EngineConfig::default());
    let key = abandoned_design(&h, "ds-1", "cust-1").await;

    h.clock.advance(Duration::minutes(30));
    ingest(&h, &key, EventType::DesignResumed).await;

    let state = h.sessions.get(&key).unwrap();
    assert_eq!(state.status, SessionStatus::Converted);
    assert_eq!(state.converted_at, Some(h.clock.now()));

    let campaign = &h.campaigns.for_key(&key)[0];
    assert_eq!(campaign.status, CampaignStatus::Cancelled);

    h.clock.advance(Duration::days(10));
    assert_eq!(h.engine.run_scheduler().await.unwrap().sent, 0);
    assert_eq!(h.sender.sent_count(), 0);
}

#[tokio::test]
async fn conversion_after_send_credits_the_sent_attempt() {
    let h = test_engine(EngineConfig::default());
    let key = abandoned_design(&h, "ds-1", "cust-1").await;
    h.clock.set(h.campaigns.for_key(&key)[0].scheduled_at);
    h.engine.run_scheduler().await.unwrap();

    h.clock.advance(Duration::hours(1));
    ingest(&h, &key, EventType::DesignCompleted).await;

    let campaigns = h.campaigns.for_key(&key);
    assert_eq!(campaigns[0].status, CampaignStatus::Sent);
    assert_eq!(campaigns[0].converted_at, Some(h.clock.now()));
    assert_eq!(campaigns[1].status, CampaignStatus::Cancelled);
}

#[tokio::test]
async fn late_scheduler_cancels_attempt_for_converted_subject() {
    let h = test_engine(EngineConfig::default());
    let key = abandoned_design(&h, "ds-1", "cust-1").await;
    let campaign = h.campaigns.for_key(&key)[0].clone();

    // Conversion recorded directly on the row, bypassing ingestion.
    let mut state = h.sessions.get(&key).unwrap();
    state.status = SessionStatus::Converted;
    h.sessions.put(state);

    h.clock.set(campaign.scheduled_at);
    let report = h.engine.run_scheduler().await.unwrap();
    assert_eq!(report.cancelled, 1);
    assert_eq!(h.sender.sent_count(), 0);
}

#[tokio::test]
async fn outcome_callbacks_require_a_sent_email() {
    let h = test_engine(EngineConfig::default());
    let key = abandoned_design(&h, "ds-1", "cust-1").await;
    let id = h.campaigns.for_key(&key)[0].id;

    let err = h.engine.record_email_opened(id, h.clock.now()).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let unknown = funnel_recovery_core::campaign::CampaignId::new();
    let err = h.engine.record_link_clicked(unknown, h.clock.now()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn click_backfills_open_and_records_tracking_events() {
    let h = test_engine(EngineConfig::default());
    let key = abandoned_design(&h, "ds-1", "cust-1").await;
    h.clock.set(h.campaigns.for_key(&key)[0].scheduled_at);
    h.engine.run_scheduler().await.unwrap();
    let id = h.campaigns.for_key(&key)[0].id;

    h.clock.advance(Duration::minutes(10));
    let clicked = h.engine.record_link_clicked(id, h.clock.now()).await.unwrap();
    assert_eq!(clicked.opened_at, Some(h.clock.now()));
    assert_eq!(clicked.clicked_at, Some(h.clock.now()));

    // Opening afterwards changes nothing.
    let opened = h
        .engine
        .record_email_opened(id, h.clock.now() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(opened.opened_at, Some(h.clock.now()));

    let types: Vec<EventType> = h
        .events
        .for_subject(&key)
        .iter()
        .map(|e| e.event_type)
        .filter(|t| t.is_recovery_tracking())
        .collect();
    assert_eq!(
        types,
        vec![
            EventType::RecoveryEmailSent,
            EventType::RecoveryEmailOpened,
            EventType::RecoveryLinkClicked,
        ]
    );

    // Tracking events never count as activity.
    ingest(&h, &key, EventType::PreviewViewed).await;
    assert_eq!(h.sessions.get(&key).unwrap().status, SessionStatus::Abandoned);
}
