//! # Funnel Recovery Core
//!
//! Domain types and collaborator traits for the abandonment detection and
//! recovery campaign engine.
//!
//! ## Core Concepts
//!
//! - **Event**: immutable record of customer activity on a design session or cart item
//! - **Session State**: live status of one subject, derived from its events
//! - **Recovery Campaign**: one scheduled recovery email attempt
//! - **Daily Aggregate**: per-day rollup for reporting
//! - **Environment**: injected collaborators ([`environment::Clock`], [`email::EmailSender`], stores)
//!
//! ## Architecture Principles
//!
//! - Pure state transitions, side effects at the edges
//! - Every tick takes `now` and the configuration explicitly
//! - Per-subject writes are compare-and-swap on a row version
//!
//! Runtime components live in `funnel-recovery-runtime`; storage backends in
//! `funnel-recovery-postgres` and `funnel-recovery-testing`.

pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod campaign;
pub mod config;
pub mod email;
pub mod error;
pub mod event;
pub mod event_store;
pub mod query;
pub mod session;
pub mod subject;

pub use error::{EngineError, Result};

/// Environment traits for dependency injection.
///
/// All external dependencies are abstracted behind traits and injected into
/// the engine components at construction time.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use funnel_recovery_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock reading the system time.
    #[derive(Copy, Clone, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
