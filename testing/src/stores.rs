//! In-memory store implementations.
//!
//! Fast, deterministic backends for every store trait:
//! - [`InMemoryEventStore`]: event log with idempotency keys
//! - [`InMemorySessionStore`]: session states with compare-and-swap saves
//! - [`InMemoryCampaignStore`]: campaigns with compare-and-swap updates and insert failure injection
//! - [`InMemoryAggregateStore`]: daily aggregates with failure injection
//!
//! Each check-and-write happens under a single lock acquisition, so the
//! compare-and-swap semantics match the database backends.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use chrono::{DateTime, NaiveDate, Utc};
use funnel_recovery_core::aggregate::{AggregateStore, DailyAggregate};
use funnel_recovery_core::campaign::{
    CampaignId, CampaignStatus, CampaignStore, RecoveryCampaign,
};
use funnel_recovery_core::error::StoreError;
use funnel_recovery_core::event::{Event, EventId, NewEvent};
use funnel_recovery_core::event_store::{Appended, EventStore};
use funnel_recovery_core::query::{CampaignQuery, Page, SessionQuery};
use funnel_recovery_core::session::{SessionState, SessionStateStore, SessionStatus};
use funnel_recovery_core::subject::{CustomerId, SubjectKey, SubjectType, Version};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Yield to the scheduler before touching the data when enabled, so that
/// `tokio::join!`-ed callers interleave at every store call.
async fn maybe_yield(enabled: &AtomicBool) {
    if enabled.load(Ordering::Relaxed) {
        tokio::task::yield_now().await;
    }
}

#[derive(Debug, Default)]
struct EventLog {
    events: Vec<Event>,
    idempotency: HashMap<String, EventId>,
}

/// In-memory event log.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<EventLog>>,
}

impl InMemoryEventStore {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored event in insertion order.
    #[must_use]
    pub fn all(&self) -> Vec<Event> {
        self.log.read().unwrap().events.clone()
    }

    /// Stored events for one subject, in stream order.
    #[must_use]
    pub fn for_subject(&self, key: &SubjectKey) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .log
            .read()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.subject_type == key.subject_type && e.subject_id == key.subject_id)
            .cloned()
            .collect();
        events.sort_by_key(Event::position);
        events
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.read().unwrap().events.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, event: NewEvent) -> StoreFuture<'_, Appended> {
        Box::pin(async move {
            let mut log = self.log.write().unwrap();
            if let Some(key) = &event.idempotency_key {
                if let Some(&id) = log.idempotency.get(key) {
                    return Ok(Appended {
                        id,
                        duplicate: true,
                    });
                }
            }
            let id = EventId::new(log.events.len() as u64 + 1);
            if let Some(key) = &event.idempotency_key {
                log.idempotency.insert(key.clone(), id);
            }
            log.events.push(event.into_event(id));
            Ok(Appended {
                id,
                duplicate: false,
            })
        })
    }

    fn query<'a>(
        &'a self,
        subject: &'a SubjectKey,
        since: Option<EventId>,
    ) -> BoxStream<'a, Result<Event, StoreError>> {
        let events = self.for_subject(subject);
        let after = since.and_then(|id| events.iter().find(|e| e.id == id).map(Event::position));
        let events: Vec<Event> = events
            .into_iter()
            .filter(|e| after.is_none_or(|position| e.position() > position))
            .collect();
        stream::iter(events.into_iter().map(Ok)).boxed()
    }

    fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BoxStream<'_, Result<Event, StoreError>> {
        let mut events: Vec<Event> = self
            .log
            .read()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.occurred_at >= from && e.occurred_at < to)
            .cloned()
            .collect();
        events.sort_by_key(Event::position);
        stream::iter(events.into_iter().map(Ok)).boxed()
    }
}

/// In-memory session state table.
///
/// [`SessionStateStore::unscheduled_abandonments`] needs the campaign table;
/// link one with [`InMemorySessionStore::with_campaigns`]. Unlinked, every
/// abandoned subject is reported.
#[derive(Clone, Debug, Default)]
pub struct InMemorySessionStore {
    rows: Arc<RwLock<HashMap<SubjectKey, SessionState>>>,
    interleave: Arc<AtomicBool>,
    campaigns: Option<InMemoryCampaignStore>,
}

impl InMemorySessionStore {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Yield before every operation so concurrent callers race realistically.
    #[must_use]
    pub fn interleaved(self) -> Self {
        self.interleave.store(true, Ordering::Relaxed);
        self
    }

    /// Consult `campaigns` when looking for unscheduled abandonments.
    #[must_use]
    pub fn with_campaigns(mut self, campaigns: InMemoryCampaignStore) -> Self {
        self.campaigns = Some(campaigns);
        self
    }

    /// Current row for `key`.
    #[must_use]
    pub fn get(&self, key: &SubjectKey) -> Option<SessionState> {
        self.rows.read().unwrap().get(key).cloned()
    }

    /// Overwrite a row, bypassing compare-and-swap (test setup only).
    pub fn put(&self, state: SessionState) {
        self.rows.write().unwrap().insert(state.key(), state);
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStateStore for InMemorySessionStore {
    fn load<'a>(&'a self, key: &'a SubjectKey) -> StoreFuture<'a, Option<SessionState>> {
        Box::pin(async move {
            maybe_yield(&self.interleave).await;
            Ok(self.get(key))
        })
    }

    fn save<'a>(&'a self, state: &'a SessionState) -> StoreFuture<'a, Version> {
        Box::pin(async move {
            maybe_yield(&self.interleave).await;
            let key = state.key();
            let mut rows = self.rows.write().unwrap();
            let actual = rows.get(&key).map_or(Version::INITIAL, |row| row.version);
            if actual != state.version {
                return Err(StoreError::ConcurrencyConflict {
                    entity: "session_state",
                    id: key.to_string(),
                    expected: state.version,
                    actual,
                });
            }
            let mut row = state.clone();
            row.version = actual.next();
            rows.insert(key, row);
            Ok(actual.next())
        })
    }

    fn abandonment_candidates(
        &self,
        subject_type: SubjectType,
        inactive_since: DateTime<Utc>,
        limit: u32,
    ) -> StoreFuture<'_, Vec<SessionState>> {
        Box::pin(async move {
            maybe_yield(&self.interleave).await;
            let mut candidates: Vec<SessionState> = self
                .rows
                .read()
                .unwrap()
                .values()
                .filter(|s| {
                    s.subject_type == subject_type
                        && s.status == SessionStatus::InProgress
                        && s.eligible_for_abandonment
                        && s.last_activity_at < inactive_since
                })
                .cloned()
                .collect();
            candidates.sort_by(|a, b| {
                a.last_activity_at
                    .cmp(&b.last_activity_at)
                    .then_with(|| a.subject_id.cmp(&b.subject_id))
            });
            candidates.truncate(limit as usize);
            Ok(candidates)
        })
    }

    fn unscheduled_abandonments(
        &self,
        subject_type: SubjectType,
        limit: u32,
    ) -> StoreFuture<'_, Vec<SessionState>> {
        Box::pin(async move {
            maybe_yield(&self.interleave).await;
            let mut abandoned: Vec<SessionState> = self
                .rows
                .read()
                .unwrap()
                .values()
                .filter(|s| s.subject_type == subject_type && s.status == SessionStatus::Abandoned)
                .cloned()
                .collect();
            if let Some(campaigns) = &self.campaigns {
                abandoned.retain(|s| {
                    let key = s.key();
                    !campaigns
                        .for_key(&key)
                        .iter()
                        .any(|c| c.attempt_number == 1)
                });
            }
            abandoned.sort_by(|a, b| {
                a.abandoned_at
                    .cmp(&b.abandoned_at)
                    .then_with(|| a.subject_id.cmp(&b.subject_id))
            });
            abandoned.truncate(limit as usize);
            Ok(abandoned)
        })
    }

    fn list<'a>(&'a self, query: &'a SessionQuery) -> StoreFuture<'a, Page<SessionState>> {
        Box::pin(async move {
            let mut matching: Vec<SessionState> = self
                .rows
                .read()
                .unwrap()
                .values()
                .filter(|s| query.matches(s))
                .cloned()
                .collect();
            matching.sort_by(|a, b| {
                b.updated_at
                    .cmp(&a.updated_at)
                    .then_with(|| a.key().cmp(&b.key()))
            });
            Ok(query.page.apply(matching))
        })
    }
}

/// In-memory campaign table.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCampaignStore {
    rows: Arc<RwLock<HashMap<CampaignId, RecoveryCampaign>>>,
    failing_inserts: Arc<AtomicUsize>,
}

impl InMemoryCampaignStore {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every campaign, ordered by subject then attempt.
    #[must_use]
    pub fn all(&self) -> Vec<RecoveryCampaign> {
        let mut rows: Vec<RecoveryCampaign> = self.rows.read().unwrap().values().cloned().collect();
        rows.sort_by(|a, b| {
            a.subject_key()
                .cmp(&b.subject_key())
                .then(a.attempt_number.cmp(&b.attempt_number))
        });
        rows
    }

    /// Campaigns for one subject, by attempt.
    #[must_use]
    pub fn for_key(&self, key: &SubjectKey) -> Vec<RecoveryCampaign> {
        self.all()
            .into_iter()
            .filter(|c| c.subject_key() == *key)
            .collect()
    }

    /// Make the next `count` inserts fail with a database error.
    pub fn fail_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::Relaxed);
    }

    /// Overwrite a row, bypassing compare-and-swap (test setup only).
    pub fn put(&self, campaign: RecoveryCampaign) {
        self.rows.write().unwrap().insert(campaign.id, campaign);
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sent_in(campaign: &RecoveryCampaign, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        campaign.sent_at.is_some_and(|at| at >= from && at < to)
    }
}

impl CampaignStore for InMemoryCampaignStore {
    fn insert<'a>(&'a self, campaign: &'a RecoveryCampaign) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let injected = self
                .failing_inserts
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(StoreError::Database("injected insert failure".to_string()));
            }
            let mut rows = self.rows.write().unwrap();
            let exists = rows.values().any(|c| {
                c.subject_type == campaign.subject_type
                    && c.subject_id == campaign.subject_id
                    && c.attempt_number == campaign.attempt_number
            });
            if exists {
                return Ok(false);
            }
            rows.insert(campaign.id, campaign.clone());
            Ok(true)
        })
    }

    fn get(&self, id: CampaignId) -> StoreFuture<'_, Option<RecoveryCampaign>> {
        Box::pin(async move { Ok(self.rows.read().unwrap().get(&id).cloned()) })
    }

    fn update<'a>(&'a self, campaign: &'a RecoveryCampaign) -> StoreFuture<'a, Version> {
        Box::pin(async move {
            let mut rows = self.rows.write().unwrap();
            let Some(current) = rows.get(&campaign.id) else {
                return Err(StoreError::NotFound {
                    entity: "recovery_campaign",
                    id: campaign.id.to_string(),
                });
            };
            if current.version != campaign.version {
                return Err(StoreError::ConcurrencyConflict {
                    entity: "recovery_campaign",
                    id: campaign.id.to_string(),
                    expected: campaign.version,
                    actual: current.version,
                });
            }
            let mut row = campaign.clone();
            row.version = campaign.version.next();
            rows.insert(campaign.id, row);
            Ok(campaign.version.next())
        })
    }

    fn due(&self, now: DateTime<Utc>, limit: u32) -> StoreFuture<'_, Vec<RecoveryCampaign>> {
        Box::pin(async move {
            let mut due: Vec<RecoveryCampaign> = self
                .rows
                .read()
                .unwrap()
                .values()
                .filter(|c| c.status == CampaignStatus::Scheduled && c.scheduled_at <= now)
                .cloned()
                .collect();
            due.sort_by(|a, b| {
                a.scheduled_at
                    .cmp(&b.scheduled_at)
                    .then(a.attempt_number.cmp(&b.attempt_number))
                    .then(a.id.as_uuid().cmp(b.id.as_uuid()))
            });
            due.truncate(limit as usize);
            Ok(due)
        })
    }

    fn for_subject<'a>(&'a self, key: &'a SubjectKey) -> StoreFuture<'a, Vec<RecoveryCampaign>> {
        Box::pin(async move { Ok(self.for_key(key)) })
    }

    fn sent_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<RecoveryCampaign>> {
        Box::pin(async move {
            let mut sent: Vec<RecoveryCampaign> = self
                .all()
                .into_iter()
                .filter(|c| Self::sent_in(c, from, to))
                .collect();
            sent.sort_by_key(|c| c.sent_at);
            Ok(sent)
        })
    }

    fn count_sent_to_customer<'a>(
        &'a self,
        customer_id: &'a CustomerId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreFuture<'a, u32> {
        Box::pin(async move {
            let count = self
                .rows
                .read()
                .unwrap()
                .values()
                .filter(|c| c.customer_id.as_ref() == Some(customer_id) && Self::sent_in(c, from, to))
                .count();
            Ok(u32::try_from(count).unwrap_or(u32::MAX))
        })
    }

    fn list<'a>(&'a self, query: &'a CampaignQuery) -> StoreFuture<'a, Page<RecoveryCampaign>> {
        Box::pin(async move {
            let mut matching: Vec<RecoveryCampaign> = self
                .all()
                .into_iter()
                .filter(|c| query.matches(c))
                .collect();
            matching.sort_by(|a, b| {
                b.scheduled_at
                    .cmp(&a.scheduled_at)
                    .then(a.id.as_uuid().cmp(b.id.as_uuid()))
            });
            Ok(query.page.apply(matching))
        })
    }
}

/// In-memory daily aggregate table.
#[derive(Clone, Debug, Default)]
pub struct InMemoryAggregateStore {
    rows: Arc<RwLock<BTreeMap<NaiveDate, DailyAggregate>>>,
    fail_upserts: Arc<AtomicBool>,
}

impl InMemoryAggregateStore {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following upsert fail (or succeed again).
    pub fn fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::Relaxed);
    }

    /// Stored row for `date`.
    #[must_use]
    pub fn row(&self, date: NaiveDate) -> Option<DailyAggregate> {
        self.rows.read().unwrap().get(&date).cloned()
    }
}

impl AggregateStore for InMemoryAggregateStore {
    fn upsert<'a>(&'a self, aggregate: &'a DailyAggregate) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.fail_upserts.load(Ordering::Relaxed) {
                return Err(StoreError::Database("injected upsert failure".to_string()));
            }
            self.rows
                .write()
                .unwrap()
                .insert(aggregate.date, aggregate.clone());
            Ok(())
        })
    }

    fn get(&self, date: NaiveDate) -> StoreFuture<'_, Option<DailyAggregate>> {
        Box::pin(async move { Ok(self.row(date)) })
    }

    fn list(&self, from: NaiveDate, to: NaiveDate) -> StoreFuture<'_, Vec<DailyAggregate>> {
        Box::pin(async move {
            Ok(self
                .rows
                .read()
                .unwrap()
                .range(from..=to)
                .map(|(_, row)| row.clone())
                .collect())
        })
    }
}
