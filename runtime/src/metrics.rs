//! Prometheus metrics for the engine's background tasks.
//!
//! This module provides metric collection for:
//! - Event ingestion
//! - Abandonment detector sweeps
//! - Recovery email sends
//! - Daily aggregation runs
//! - Tick scheduling (duration, skipped overlaps)
//!
//! # Example
//!
//! ```rust,no_run
//! use funnel_recovery_runtime::metrics::MetricsServer;
//!
//! # #[tokio::main] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and start the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built (e.g. the address is in use).
    ///
    /// # Note
    ///
    /// Only one recorder can be installed per process. A second call (as
    /// happens across tests) logs a warning and leaves the first one active.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });
        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "recovery_events_ingested_total",
        "Events accepted by ingestion (label: duplicate)"
    );
    describe_counter!(
        "recovery_events_rejected_total",
        "Events rejected by validation"
    );

    describe_counter!(
        "recovery_detector_processed_total",
        "Subjects examined by the abandonment detector"
    );
    describe_counter!(
        "recovery_detector_abandoned_total",
        "Subjects transitioned to abandoned"
    );
    describe_counter!(
        "recovery_detector_conflicts_total",
        "Abandonment transitions lost to a concurrent writer"
    );
    describe_counter!(
        "recovery_detector_failures_total",
        "Per-subject detector failures"
    );
    describe_counter!(
        "recovery_detector_repaired_total",
        "Abandonments whose first attempt was scheduled by the repair pass"
    );

    describe_counter!("recovery_emails_sent_total", "Recovery emails sent");
    describe_counter!(
        "recovery_emails_failed_total",
        "Recovery email delivery failures (label: permanent)"
    );
    describe_counter!(
        "recovery_campaigns_cancelled_total",
        "Campaign attempts cancelled because the subject converted"
    );
    describe_counter!(
        "recovery_campaigns_deferred_total",
        "Campaign attempts deferred (label: reason)"
    );

    describe_counter!(
        "recovery_aggregates_written_total",
        "Daily aggregate rows written"
    );

    describe_histogram!(
        "recovery_tick_duration_seconds",
        "Wall time of one periodic tick (label: task)"
    );
    describe_counter!(
        "recovery_ticks_skipped_total",
        "Ticks skipped because the previous run was still in progress (label: task)"
    );
}

/// Ingestion metrics recorder.
pub struct IngestMetrics;

impl IngestMetrics {
    /// Record an accepted event.
    pub fn record_accepted(duplicate: bool) {
        counter!("recovery_events_ingested_total", "duplicate" => duplicate.to_string())
            .increment(1);
    }

    /// Record a rejected event.
    pub fn record_rejected() {
        counter!("recovery_events_rejected_total").increment(1);
    }
}

/// Detector metrics recorder.
pub struct DetectorMetrics;

impl DetectorMetrics {
    /// Record the outcome of one sweep.
    pub fn record_sweep(processed: u64, abandoned: u64, conflicts: u64, failed: u64) {
        counter!("recovery_detector_processed_total").increment(processed);
        counter!("recovery_detector_abandoned_total").increment(abandoned);
        counter!("recovery_detector_conflicts_total").increment(conflicts);
        counter!("recovery_detector_failures_total").increment(failed);
    }

    /// Record abandonments whose first attempt a repair pass scheduled.
    pub fn record_repaired(repaired: u64) {
        counter!("recovery_detector_repaired_total").increment(repaired);
    }
}

/// Scheduler metrics recorder.
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    /// Record a sent email.
    pub fn record_sent() {
        counter!("recovery_emails_sent_total").increment(1);
    }

    /// Record a delivery failure.
    pub fn record_failure(permanent: bool) {
        counter!("recovery_emails_failed_total", "permanent" => permanent.to_string())
            .increment(1);
    }

    /// Record a cancelled attempt.
    pub fn record_cancelled() {
        counter!("recovery_campaigns_cancelled_total").increment(1);
    }

    /// Record a deferred attempt.
    pub fn record_deferred(reason: &'static str) {
        counter!("recovery_campaigns_deferred_total", "reason" => reason).increment(1);
    }
}

/// Tick metrics recorder.
pub struct TickMetrics;

impl TickMetrics {
    /// Record a completed tick.
    pub fn record_run(task: &'static str, duration: Duration) {
        histogram!("recovery_tick_duration_seconds", "task" => task)
            .record(duration.as_secs_f64());
    }

    /// Record a tick skipped due to overlap.
    pub fn record_skipped(task: &'static str) {
        counter!("recovery_ticks_skipped_total", "task" => task).increment(1);
    }

    /// Record a written daily aggregate.
    pub fn record_aggregate() {
        counter!("recovery_aggregates_written_total").increment(1);
    }
}
