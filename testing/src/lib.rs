//! # Funnel Recovery Testing
//!
//! Testing utilities for the funnel recovery engine.
//!
//! This crate provides:
//! - A settable [`FixedClock`]
//! - In-memory implementations of every store trait
//! - [`MockEmailSender`] that records sends and injects failures
//! - [`TrackerTest`], a Given-When-Then harness for the state machine
//! - Event builders and proptest strategies
//!
//! ## Example
//!
//! ```ignore
//! use funnel_recovery_testing::{test_clock, test_engine};
//!
//! #[tokio::test]
//! async fn abandons_after_timeout() {
//!     let harness = test_engine(EngineConfig::default());
//!     harness.engine.ingest(photo_uploaded("ds-1")).await?;
//!     harness.clock.advance(Duration::minutes(61));
//!     assert_eq!(harness.engine.run_detector().await.abandoned, 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use funnel_recovery_core::environment::Clock;

pub mod email;
pub mod stores;
pub mod tracker_test;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, RwLock};

    /// Settable clock for deterministic tests.
    ///
    /// Clones share the same time, so a test can hold one copy and move the
    /// engine's copy forward.
    ///
    /// # Example
    ///
    /// ```
    /// use funnel_recovery_testing::mocks::FixedClock;
    /// use funnel_recovery_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let before = clock.now();
    /// assert_eq!(before, clock.now()); // Always the same!
    ///
    /// clock.advance(Duration::minutes(5));
    /// assert_eq!(clock.now() - before, Duration::minutes(5));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Jump to `time`.
        #[allow(clippy::unwrap_used)]
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.write().unwrap() = time;
        }

        /// Move forward by `by`.
        #[allow(clippy::unwrap_used)]
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.write().unwrap();
            *time += by;
        }
    }

    impl Clock for FixedClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC,
    /// 09:00 in Seoul, outside the default quiet hours)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Builders for events, inputs and wired engines.
pub mod helpers {
    use crate::email::MockEmailSender;
    use crate::mocks::{FixedClock, test_clock};
    use crate::stores::{
        InMemoryAggregateStore, InMemoryCampaignStore, InMemoryEventStore, InMemorySessionStore,
    };
    use chrono::{DateTime, Utc};
    use funnel_recovery_core::config::{ConfigHandle, EngineConfig};
    use funnel_recovery_core::event::{Event, EventId, EventInput, EventType, NewEvent};
    use funnel_recovery_core::subject::{CustomerId, SubjectId, SubjectKey, SubjectType};
    use funnel_recovery_runtime::{Engine, Stores};
    use serde_json::{Value, json};
    use std::sync::Arc;

    /// Key of a design session.
    #[must_use]
    pub fn design_session(id: &str) -> SubjectKey {
        SubjectKey::new(SubjectType::DesignSession, SubjectId::new(id))
    }

    /// Key of a cart item.
    #[must_use]
    pub fn cart_item(id: &str) -> SubjectKey {
        SubjectKey::new(SubjectType::CartItem, SubjectId::new(id))
    }

    /// Fluent builder for events in their three shapes: raw input, validated
    /// [`NewEvent`] and stored [`Event`].
    #[derive(Clone, Debug)]
    pub struct EventBuilder {
        key: SubjectKey,
        event_type: EventType,
        customer_id: Option<CustomerId>,
        occurred_at: DateTime<Utc>,
        metadata: Value,
        idempotency_key: Option<String>,
        id: u64,
    }

    impl EventBuilder {
        /// An event of `event_type` on `key`, by customer `cust-1`, at the test clock's time.
        #[must_use]
        pub fn new(key: &SubjectKey, event_type: EventType) -> Self {
            use funnel_recovery_core::environment::Clock;
            Self {
                key: key.clone(),
                event_type,
                customer_id: Some(CustomerId::new("cust-1")),
                occurred_at: test_clock().now(),
                metadata: json!({}),
                idempotency_key: None,
                id: 1,
            }
        }

        /// Owning customer.
        #[must_use]
        pub fn customer(mut self, id: &str) -> Self {
            self.customer_id = Some(CustomerId::new(id));
            self
        }

        /// No customer (logged out).
        #[must_use]
        pub fn anonymous(mut self) -> Self {
            self.customer_id = None;
            self
        }

        /// Occurrence time.
        #[must_use]
        pub const fn at(mut self, at: DateTime<Utc>) -> Self {
            self.occurred_at = at;
            self
        }

        /// Theme id in metadata.
        #[must_use]
        pub fn theme(mut self, theme: &str) -> Self {
            self.metadata["themeId"] = json!(theme);
            self
        }

        /// Order amount in metadata.
        #[must_use]
        pub fn amount(mut self, amount: u64) -> Self {
            self.metadata["amount"] = json!(amount);
            self
        }

        /// Idempotency key.
        #[must_use]
        pub fn idempotency_key(mut self, key: &str) -> Self {
            self.idempotency_key = Some(key.to_string());
            self
        }

        /// Store id for [`EventBuilder::build`].
        #[must_use]
        pub const fn id(mut self, id: u64) -> Self {
            self.id = id;
            self
        }

        /// Raw input as the frontend posts it.
        #[must_use]
        pub fn input(self) -> EventInput {
            EventInput {
                event_type: Some(self.event_type.as_str().to_string()),
                subject_type: Some(self.key.subject_type.as_str().to_string()),
                subject_id: Some(self.key.subject_id.as_str().to_string()),
                customer_id: self.customer_id.map(|id| id.as_str().to_string()),
                metadata: Some(self.metadata),
                occurred_at: Some(self.occurred_at),
                idempotency_key: self.idempotency_key,
            }
        }

        /// Validated event, ready to append.
        #[must_use]
        pub fn new_event(self) -> NewEvent {
            NewEvent {
                subject_type: self.key.subject_type,
                subject_id: self.key.subject_id,
                customer_id: self.customer_id,
                event_type: self.event_type,
                occurred_at: self.occurred_at,
                metadata: self.metadata,
                idempotency_key: self.idempotency_key,
            }
        }

        /// Stored event with the configured id.
        #[must_use]
        pub fn build(self) -> Event {
            let id = EventId::new(self.id);
            self.new_event().into_event(id)
        }
    }

    /// Engine over in-memory stores, with handles to every collaborator.
    #[derive(Clone)]
    pub struct TestEngine {
        /// The engine under test.
        pub engine: Engine,
        /// Shared clock; advance it to move the engine forward.
        pub clock: FixedClock,
        /// Recorded emails.
        pub sender: MockEmailSender,
        /// Event log.
        pub events: InMemoryEventStore,
        /// Session states.
        pub sessions: InMemorySessionStore,
        /// Campaigns.
        pub campaigns: InMemoryCampaignStore,
        /// Aggregates.
        pub aggregates: InMemoryAggregateStore,
    }

    /// Wire an engine over fresh in-memory stores and [`test_clock`].
    ///
    /// # Panics
    ///
    /// Panics if `config` does not validate.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_engine(config: EngineConfig) -> TestEngine {
        let clock = test_clock();
        let sender = MockEmailSender::new();
        let events = InMemoryEventStore::new();
        let campaigns = InMemoryCampaignStore::new();
        let sessions = InMemorySessionStore::new().with_campaigns(campaigns.clone());
        let aggregates = InMemoryAggregateStore::new();
        let stores = Stores {
            events: Arc::new(events.clone()),
            sessions: Arc::new(sessions.clone()),
            campaigns: Arc::new(campaigns.clone()),
            aggregates: Arc::new(aggregates.clone()),
        };
        let config = ConfigHandle::new(config).expect("test configuration should validate");
        let engine = Engine::new(
            stores,
            Arc::new(sender.clone()),
            Arc::new(clock.clone()),
            config,
        );
        TestEngine {
            engine,
            clock,
            sender,
            events,
            sessions,
            campaigns,
            aggregates,
        }
    }

    /// Install a `tracing` subscriber writing to the test output. Safe to call
    /// from every test.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use chrono::{DateTime, Duration, Utc};
    use funnel_recovery_core::event::{Event, EventId, EventType};
    use funnel_recovery_core::subject::{CustomerId, SubjectKey};
    use proptest::prelude::*;
    use serde_json::json;

    /// Event types a client may send (system markers excluded).
    pub fn client_event_type() -> impl Strategy<Value = EventType> {
        let types: Vec<EventType> = EventType::ALL
            .into_iter()
            .filter(|ty| !ty.is_system_marker())
            .collect();
        proptest::sample::select(types)
    }

    /// Any event type, markers included.
    pub fn any_event_type() -> impl Strategy<Value = EventType> {
        proptest::sample::select(EventType::ALL.to_vec())
    }

    /// An ordered stream of 1..`max_len` events for `key`, starting at
    /// `start`, with increasing ids and gaps of up to two hours.
    pub fn event_stream(
        key: SubjectKey,
        start: DateTime<Utc>,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<Event>> {
        proptest::collection::vec(
            (any_event_type(), 0_i64..7200, proptest::option::of("[a-c]")),
            1..max_len,
        )
        .prop_map(move |steps| {
            let mut at = start;
            steps
                .into_iter()
                .enumerate()
                .map(|(index, (event_type, gap_seconds, theme))| {
                    at += Duration::seconds(gap_seconds);
                    let metadata = theme.map_or_else(|| json!({}), |t| json!({ "themeId": t }));
                    Event {
                        id: EventId::new(index as u64 + 1),
                        subject_type: key.subject_type,
                        subject_id: key.subject_id.clone(),
                        customer_id: Some(CustomerId::new("cust-1")),
                        event_type,
                        occurred_at: at,
                        metadata,
                        idempotency_key: None,
                    }
                })
                .collect()
        })
    }

    /// Email delay lists of 1..=4 entries.
    pub fn email_delays() -> impl Strategy<Value = Vec<u32>> {
        proptest::collection::vec(1_u32..10_000, 1..=4)
    }
}

// Re-export commonly used items
pub use email::MockEmailSender;
pub use helpers::{EventBuilder, TestEngine, cart_item, design_session, init_tracing, test_engine};
pub use mocks::{FixedClock, test_clock};
pub use stores::{
    InMemoryAggregateStore, InMemoryCampaignStore, InMemoryEventStore, InMemorySessionStore,
};
pub use tracker_test::TrackerTest;
