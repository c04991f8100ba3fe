//! Funnel recovery worker.
//!
//! Runs the background side of the recovery engine against `PostgreSQL`:
//! - abandonment sweep (default every 5 minutes)
//! - recovery email sends (default every minute)
//! - previous-day aggregation (default hourly, idempotent)
//!
//! Settings come from the environment (see [`config`]); a `.env` file is
//! loaded when present. On Unix, `SIGHUP` reloads the recovery rules without
//! a restart. Metrics are served at `http://METRICS_ADDR/metrics`.
//!
//! Run with: `cargo run -p funnel-recovery-worker`

mod config;
mod email;

use config::WorkerConfig;
use email::ConsoleEmailSender;
use funnel_recovery_core::config::ConfigHandle;
use funnel_recovery_core::environment::SystemClock;
use funnel_recovery_postgres::{
    PostgresAggregateStore, PostgresCampaignStore, PostgresEventStore, PostgresSessionStore,
};
use funnel_recovery_runtime::metrics::MetricsServer;
use funnel_recovery_runtime::{Engine, PeriodicTask, Stores};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if present)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,funnel_recovery=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = WorkerConfig::from_env()?;
    let rules = settings.engine_config()?;
    info!(
        detector_secs = settings.detector_interval.as_secs(),
        scheduler_secs = settings.scheduler_interval.as_secs(),
        aggregator_secs = settings.aggregator_interval.as_secs(),
        rules = settings.rules_path.as_ref().map_or("built-in", |_| "file"),
        "Starting funnel recovery worker"
    );

    let pool = funnel_recovery_postgres::connect(&settings.database_url, settings.max_connections).await?;
    funnel_recovery_postgres::migrate(&pool).await?;
    info!("Database migrations applied");

    let mut metrics = MetricsServer::new(settings.metrics_addr);
    metrics.start()?;

    let stores = Stores {
        events: Arc::new(PostgresEventStore::new(pool.clone())),
        sessions: Arc::new(PostgresSessionStore::new(pool.clone())),
        campaigns: Arc::new(PostgresCampaignStore::new(pool.clone())),
        aggregates: Arc::new(PostgresAggregateStore::new(pool.clone())),
    };
    let engine = Engine::new(
        stores,
        Arc::new(ConsoleEmailSender),
        Arc::new(SystemClock),
        ConfigHandle::new(rules)?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    #[cfg(unix)]
    let reloader = tokio::spawn(reload_on_hangup(
        settings.clone(),
        engine.config().clone(),
        shutdown_rx.clone(),
    ));

    let detector = {
        let engine = engine.clone();
        PeriodicTask::new("detector", settings.detector_interval).run(
            shutdown_rx.clone(),
            move || {
                let engine = engine.clone();
                async move {
                    let report = engine.run_detector().await;
                    if report.failed > 0 {
                        warn!(failed = report.failed, "Detector tick had failures");
                    }
                }
            },
        )
    };

    let scheduler = {
        let engine = engine.clone();
        PeriodicTask::new("scheduler", settings.scheduler_interval).run(
            shutdown_rx.clone(),
            move || {
                let engine = engine.clone();
                async move {
                    if let Err(e) = engine.run_scheduler().await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
            },
        )
    };

    let aggregator = PeriodicTask::new("aggregator", settings.aggregator_interval).run(
        shutdown_rx,
        move || {
            let engine = engine.clone();
            async move {
                if let Err(e) = engine.aggregate_previous_day().await {
                    error!(error = %e, "Daily aggregation failed");
                }
            }
        },
    );

    let tasks = [
        tokio::spawn(detector),
        tokio::spawn(scheduler),
        tokio::spawn(aggregator),
    ];

    signal::ctrl_c().await?;
    info!("Shutdown signal received, waiting for in-flight ticks");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Periodic task panicked");
        }
    }
    #[cfg(unix)]
    if let Err(e) = reloader.await {
        error!(error = %e, "Rules reload task panicked");
    }

    pool.close().await;
    info!("Worker stopped");
    Ok(())
}

/// Re-read the recovery rules on every `SIGHUP` until shutdown.
#[cfg(unix)]
async fn reload_on_hangup(
    settings: WorkerConfig,
    handle: ConfigHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable, rules reload disabled");
            return;
        }
    };
    loop {
        tokio::select! {
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
                match settings.reload_rules(&handle) {
                    Ok(()) => info!("Recovery rules reloaded"),
                    Err(e) => warn!(error = %e, "Rules reload rejected, keeping current rules"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
