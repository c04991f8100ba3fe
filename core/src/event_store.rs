//! Event store trait: the append-only log every timing decision is derived from.
//!
//! # Design
//!
//! The store does three things:
//!
//! - Append a validated event and hand back its [`EventId`]
//! - Stream one subject's events in `(occurred_at, id)` order
//! - Stream every event whose `occurred_at` falls in a time window
//!
//! Events are never updated or deleted. Supplying an idempotency key that was
//! already used turns the append into a no-op that returns the original id.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `funnel-recovery-postgres`): production storage
//! - `InMemoryEventStore` (in `funnel-recovery-testing`): deterministic tests
//!
//! # Example
//!
//! ```no_run
//! use funnel_recovery_core::error::StoreError;
//! use funnel_recovery_core::event::NewEvent;
//! use funnel_recovery_core::event_store::EventStore;
//! use futures::TryStreamExt;
//!
//! async fn example<S: EventStore>(store: &S, event: NewEvent) -> Result<(), StoreError> {
//!     let key = event.subject_key();
//!     let appended = store.append(event).await?;
//!
//!     // Replay from scratch, or resume after the last applied event.
//!     let all: Vec<_> = store.query(&key, None).try_collect().await?;
//!     let newer: Vec<_> = store.query(&key, Some(appended.id)).try_collect().await?;
//!     Ok(())
//! }
//! ```

use crate::error::StoreError;
use crate::event::{Event, EventId, NewEvent};
use crate::subject::SubjectKey;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;

/// Outcome of [`EventStore::append`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Appended {
    /// Id of the stored event (the original one for a deduplicated append).
    pub id: EventId,
    /// `true` when the idempotency key matched an existing event and nothing was written.
    pub duplicate: bool,
}

/// Append-only event log.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures and streams so the store can live behind
/// `Arc<dyn EventStore>` inside the engine and the periodic tasks.
pub trait EventStore: Send + Sync {
    /// Append a validated event.
    ///
    /// # Errors
    ///
    /// - `Database`: connection or query failure
    /// - `Serialization`: metadata could not be encoded
    fn append(
        &self,
        event: NewEvent,
    ) -> Pin<Box<dyn Future<Output = Result<Appended, StoreError>> + Send + '_>>;

    /// Lazily stream a subject's events ordered by `(occurred_at, id)`.
    ///
    /// With `since = Some(id)` only events positioned strictly after that
    /// event are produced. Each call starts a fresh sequence, so a consumer
    /// that failed halfway can simply call again. An unknown subject yields
    /// an empty stream.
    fn query<'a>(
        &'a self,
        subject: &'a SubjectKey,
        since: Option<EventId>,
    ) -> BoxStream<'a, Result<Event, StoreError>>;

    /// Lazily stream all events with `from <= occurred_at < to`, ordered by
    /// `(occurred_at, id)`.
    fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BoxStream<'_, Result<Event, StoreError>>;
}
