//! # Funnel Recovery Runtime
//!
//! The moving parts of the abandonment and recovery engine.
//!
//! ## Components
//!
//! - **Tracker** ([`tracker`]): pure state machine folding events into session state
//! - **Detector** ([`detector`]): periodic inactivity sweep that abandons subjects
//! - **Scheduler** ([`scheduler`]): recovery email attempts, sends and outcomes
//! - **Aggregator** ([`aggregator`]): per-day rollups
//! - **Engine** ([`engine`]): ingestion facade and entry points for every tick
//! - **Ticks** ([`tick`]): non-overlapping periodic execution
//!
//! ## Example
//!
//! ```ignore
//! use funnel_recovery_runtime::{Engine, Stores};
//!
//! let engine = Engine::new(stores, sender, clock, config);
//! engine.ingest(input).await?;
//! let report = engine.run_detector().await;
//! let sent = engine.run_scheduler().await?;
//! ```

use funnel_recovery_core::aggregate::AggregateStore;
use funnel_recovery_core::campaign::CampaignStore;
use funnel_recovery_core::event_store::EventStore;
use funnel_recovery_core::session::SessionStateStore;
use std::sync::Arc;

pub mod aggregator;
pub mod calendar;
pub mod detector;
pub mod engine;
pub mod metrics;
pub mod query;
pub mod scheduler;
pub mod tick;
pub mod tracker;

pub use aggregator::DailyAggregator;
pub use detector::{AbandonmentDetector, DetectorReport};
pub use engine::{Engine, IngestOutcome};
pub use query::{QueryService, RecoveryRates, RecoveryReport};
pub use scheduler::{AbandonmentEvent, RecoveryScheduler, SchedulerReport};
pub use tick::{PeriodicTask, TickGuard, TickPermit};

/// Compare-and-swap attempts before a per-row update gives up.
pub const MAX_CAS_ATTEMPTS: usize = 5;

/// The four stores the engine reads and writes.
#[derive(Clone)]
pub struct Stores {
    /// Append-only event log.
    pub events: Arc<dyn EventStore>,
    /// Live per-subject state.
    pub sessions: Arc<dyn SessionStateStore>,
    /// Recovery email attempts.
    pub campaigns: Arc<dyn CampaignStore>,
    /// Daily rollups.
    pub aggregates: Arc<dyn AggregateStore>,
}
