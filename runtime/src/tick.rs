//! Non-overlapping periodic execution of the engine's background ticks.
//!
//! [`TickGuard`] makes sure at most one run of a task is in flight; a tick
//! that fires while the previous run is still going is skipped and counted
//! instead of queued. [`PeriodicTask`] drives a guarded job from a tokio
//! interval until a shutdown signal arrives, then waits for the in-flight run.

use crate::metrics::TickMetrics;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Single-flight guard shared by everything that may run one task.
#[derive(Clone, Debug, Default)]
pub struct TickGuard {
    running: Arc<AtomicBool>,
}

impl TickGuard {
    /// A guard with no run in flight.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard. `None` while another run holds it.
    #[must_use]
    pub fn try_acquire(&self) -> Option<TickPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickPermit(Arc::clone(&self.running)))
    }

    /// Whether a run currently holds the guard.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run `fut` unless another run is in flight.
    pub async fn run<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let _permit = self.try_acquire()?;
        Some(fut.await)
    }
}

/// Held for the duration of one run; releases the guard on drop, including
/// when the run panics or is cancelled.
#[derive(Debug)]
pub struct TickPermit(Arc<AtomicBool>);

impl Drop for TickPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A named job fired on a fixed period.
#[derive(Clone, Debug)]
pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
    guard: TickGuard,
}

impl PeriodicTask {
    /// A task with its own guard.
    #[must_use]
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self::with_guard(name, period, TickGuard::new())
    }

    /// A task sharing `guard` with other triggers of the same job.
    #[must_use]
    pub const fn with_guard(name: &'static str, period: Duration, guard: TickGuard) -> Self {
        Self {
            name,
            period,
            guard,
        }
    }

    /// Task name used in logs and metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The guard this task runs under.
    #[must_use]
    pub const fn guard(&self) -> &TickGuard {
        &self.guard
    }

    /// Fire `job` every period until `shutdown` becomes `true` (or its
    /// sender is dropped). The first run happens immediately.
    pub async fn run<F, Fut>(self, mut shutdown: watch::Receiver<bool>, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<()>> = None;
        info!(task = self.name, period_secs = self.period.as_secs(), "Periodic task started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    let Some(permit) = self.guard.try_acquire() else {
                        debug!(task = self.name, "Previous run still in progress, skipping tick");
                        TickMetrics::record_skipped(self.name);
                        continue;
                    };
                    let name = self.name;
                    let run = job();
                    in_flight = Some(tokio::spawn(async move {
                        let _permit = permit;
                        let started = Instant::now();
                        run.await;
                        TickMetrics::record_run(name, started.elapsed());
                    }));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(handle) = in_flight {
            if let Err(e) = handle.await {
                warn!(task = self.name, error = %e, "In-flight run did not complete cleanly");
            }
        }
        info!(task = self.name, "Periodic task stopped");
    }
}
