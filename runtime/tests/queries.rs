//! Dashboard reads: filtered listings, lookups and recovery performance.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)] // Test code can use unwrap/expect

use chrono::{Duration, NaiveDate};
use funnel_recovery_core::campaign::{CampaignId, CampaignStatus, CampaignType};
use funnel_recovery_core::config::EngineConfig;
use funnel_recovery_core::environment::Clock;
use funnel_recovery_core::error::EngineError;
use funnel_recovery_core::event::EventType;
use funnel_recovery_core::query::{CampaignQuery, PageRequest, SessionQuery};
use funnel_recovery_core::session::SessionStatus;
use funnel_recovery_core::subject::{SubjectKey, SubjectType};
use funnel_recovery_testing::{EventBuilder, TestEngine, cart_item, design_session, test_engine};

async fn ingest(h: &TestEngine, key: &SubjectKey, event_type: EventType, customer: &str) {
    let input = EventBuilder::new(key, event_type)
        .customer(customer)
        .at(h.clock.now())
        .input();
    h.engine.ingest(input).await.unwrap();
}

/// Two abandoned designs and one abandoned cart item, each owned by a
/// different customer, with every first attempt sent and one design
/// recovered through its email.
async fn recovered_day() -> (TestEngine, CampaignId) {
    let h = test_engine(EngineConfig::default());
    ingest(&h, &design_session("ds-1"), EventType::PhotoUploaded, "cust-1").await;
    ingest(&h, &design_session("ds-2"), EventType::PhotoUploaded, "cust-2").await;
    ingest(&h, &cart_item("ci-1"), EventType::AddedToCart, "cust-3").await;
    ingest(&h, &design_session("ds-3"), EventType::ThemeSelected, "cust-4").await;

    h.clock.advance(Duration::minutes(61));
    assert_eq!(h.engine.run_detector().await.abandoned, 3);

    h.clock.advance(Duration::minutes(120));
    let report = h.engine.run_scheduler().await.unwrap();
    assert_eq!(report.sent, 3);
    assert_eq!(report.followups, 3);

    let first = h
        .engine
        .query()
        .campaigns_for_subject(&design_session("ds-1"))
        .await
        .unwrap()[0]
        .id;
    h.clock.advance(Duration::minutes(5));
    h.engine.record_link_clicked(first, h.clock.now()).await.unwrap();
    h.clock.advance(Duration::minutes(5));
    h.engine.record_conversion(first, h.clock.now()).await.unwrap();
    (h, first)
}

#[tokio::test]
async fn sessions_filter_by_status_and_type() {
    let (h, _) = recovered_day().await;
    let query = h.engine.query();

    let abandoned = query
        .sessions(&SessionQuery {
            status: Some(SessionStatus::Abandoned),
            ..SessionQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(abandoned.total, 3);

    let carts = query
        .sessions(&SessionQuery {
            subject_type: Some(SubjectType::CartItem),
            ..SessionQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(carts.total, 1);
    assert_eq!(carts.items[0].subject_id.as_str(), "ci-1");

    // The photo-less design is still open.
    let open = query
        .sessions(&SessionQuery {
            status: Some(SessionStatus::InProgress),
            ..SessionQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(open.total, 1);
    assert_eq!(open.items[0].subject_id.as_str(), "ds-3");
}

#[tokio::test]
async fn campaigns_are_filtered_and_paginated() {
    let (h, _) = recovered_day().await;
    let query = h.engine.query();

    let all = query.campaigns(&CampaignQuery::default()).await.unwrap();
    assert_eq!(all.total, 6);

    let sent = query
        .campaigns(&CampaignQuery {
            status: Some(CampaignStatus::Sent),
            ..CampaignQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(sent.total, 3);

    let carts = query
        .campaigns(&CampaignQuery {
            campaign_type: Some(CampaignType::CartAbandoned),
            ..CampaignQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(carts.total, 2);

    let first_page = query
        .campaigns(&CampaignQuery {
            page: PageRequest::new(0, 4),
            ..CampaignQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(first_page.items.len(), 4);
    assert!(first_page.has_more());
    let second_page = query
        .campaigns(&CampaignQuery {
            page: PageRequest::new(4, 4),
            ..CampaignQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(second_page.items.len(), 2);
    assert!(!second_page.has_more());
}

#[tokio::test]
async fn recovery_stats_report_rates_per_type() {
    let (h, _) = recovered_day().await;
    let report = h
        .engine
        .query()
        .recovery_stats(&CampaignQuery {
            page: PageRequest::new(0, 1),
            ..CampaignQuery::default()
        })
        .await
        .unwrap();

    assert_eq!(report.overall.sent, 3);
    assert_eq!(report.overall.opened, 1);
    assert_eq!(report.overall.clicked, 1);
    assert_eq!(report.overall.converted, 1);
    assert_eq!(report.overall.open_rate, 33.3);
    assert_eq!(report.overall.click_rate, 100.0);

    let design = report.by_type[&CampaignType::DesignAbandoned];
    assert_eq!(design.sent, 2);
    assert_eq!(design.conversion_rate, 50.0);
    let cart = report.by_type[&CampaignType::CartAbandoned];
    assert_eq!(cart.sent, 1);
    assert_eq!(cart.open_rate, 0.0);
}

#[tokio::test]
async fn lookups_report_not_found() {
    let (h, first) = recovered_day().await;
    let query = h.engine.query();

    assert_eq!(query.campaign(first).await.unwrap().id, first);
    assert!(query.campaign(first).await.unwrap().converted_at.is_some());
    assert!(matches!(
        query.campaign(CampaignId::new()).await,
        Err(EngineError::NotFound { entity: "recovery_campaign", .. })
    ));
    assert!(matches!(
        query.session(&design_session("ds-404")).await,
        Err(EngineError::NotFound { entity: "session_state", .. })
    ));

    let new_year = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    h.engine.run_aggregator(new_year).await.unwrap();
    assert_eq!(query.aggregate(new_year).await.unwrap().date, new_year);
    assert_eq!(
        query
            .aggregates(new_year, new_year + Duration::days(6))
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(matches!(
        query.aggregate(new_year + Duration::days(1)).await,
        Err(EngineError::NotFound { entity: "daily_aggregate", .. })
    ));
}
