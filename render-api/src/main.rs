//! Service entrypoint: builds the configured store flavor, wires the
//! scheduler loops and serves the REST surface.

use std::sync::Arc;
use std::time;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use tokio::sync::{watch, Notify};
use tracing::info;

use render_common::health::Liveness;
use render_common::store::build_store;
use render_scheduler::dispatcher::Dispatcher;
use render_scheduler::lifecycle::Lifecycle;
use render_scheduler::local_pool::{CommandProcessor, LocalWorkerPool};
use render_scheduler::monitor::Monitor;
use render_scheduler::notifier::WebhookNotifier;
use render_scheduler::reconciler;
use render_scheduler::remote::{HttpRemoteExecutor, RemoteExecutor};

use config::Config;
use handlers::AppState;
use service::JobService;

mod config;
mod handlers;
mod service;

/// Silence allowance for a loop ticking at `interval`: three missed
/// ticks plus slack.
fn max_silence(interval: time::Duration) -> time::Duration {
    interval * 3 + time::Duration::from_secs(30)
}

async fn listen(app: Router, bind: String, shutdown: watch::Sender<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("listening on {:?}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", err);
            }
            info!("shutdown signal received");
            _ = shutdown.send(true);
        })
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = build_store(
        config.queue_storage,
        &config.redis_url,
        config.max_remote_workers,
        config.job_ttl_seconds,
    )
    .await
    .expect("failed to initialize job store");

    let remote: Arc<dyn RemoteExecutor> = Arc::new(HttpRemoteExecutor::new(
        &config.remote_api_base,
        config.remote_api_key.as_deref(),
        config.remote_timeout.0,
    ));
    let notifier = Arc::new(WebhookNotifier::new(
        store.clone(),
        config.webhook_secret.clone(),
        config.webhook_max_attempts,
        config.webhook_timeout.0,
    ));
    let dispatch_signal = Arc::new(Notify::new());
    let local_signal = Arc::new(Notify::new());
    let lifecycle = Arc::new(Lifecycle::new(
        store.clone(),
        remote.clone(),
        notifier,
        dispatch_signal.clone(),
    ));

    // Crash recovery before any loop starts scheduling.
    match reconciler::reconcile(store.as_ref(), config.max_remote_workers).await {
        Ok(report) => info!(
            residuals_zeroed = report.residuals_zeroed,
            correction = report.correction,
            available = report.available,
            "startup reconciliation finished"
        ),
        Err(err) => tracing::error!("startup reconciliation failed: {}", err),
    }

    let liveness = Liveness::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        remote.clone(),
        lifecycle.clone(),
        dispatch_signal.clone(),
    ));
    let heartbeat = liveness.track("dispatcher", max_silence(config.dispatch_tick.0));
    tokio::spawn(dispatcher.run(shutdown_rx.clone(), heartbeat, config.dispatch_tick.0));

    let processor = Arc::new(CommandProcessor::new(&config.local_processor_cmd));
    let pool = Arc::new(LocalWorkerPool::new(
        store.clone(),
        lifecycle.clone(),
        processor,
        config.max_local_concurrency,
        local_signal.clone(),
        dispatch_signal.clone(),
    ));
    let heartbeat = liveness.track("local-pool", max_silence(config.dispatch_tick.0));
    tokio::spawn(pool.run(shutdown_rx.clone(), heartbeat, config.dispatch_tick.0));

    let monitor = Arc::new(Monitor::new(
        store.clone(),
        remote.clone(),
        lifecycle.clone(),
        config.max_remote_workers,
    ));
    let heartbeat = liveness.track("active-poll", max_silence(config.poll_interval.0));
    tokio::spawn(
        monitor
            .clone()
            .run_poll_loop(shutdown_rx.clone(), heartbeat, config.poll_interval.0),
    );
    let heartbeat = liveness.track("timeout-sweep", max_silence(config.timeout_check.0));
    tokio::spawn(
        monitor
            .clone()
            .run_timeout_loop(shutdown_rx.clone(), heartbeat, config.timeout_check.0),
    );
    let heartbeat = liveness.track("reconciler", max_silence(config.reconcile_interval.0));
    tokio::spawn(monitor.run_reconcile_loop(
        shutdown_rx,
        heartbeat,
        config.reconcile_interval.0,
    ));

    let service = Arc::new(JobService::new(
        store,
        lifecycle,
        remote,
        dispatch_signal,
        local_signal,
        config.max_remote_workers,
    ));
    let state = AppState::new(
        service,
        liveness,
        config.api_key.clone(),
        config.rate_limit_per_second,
        config.rate_limit_burst,
    );
    let app = handlers::router(state, config.max_body_size, true);

    if let Err(err) = listen(app, config.bind(), shutdown_tx).await {
        tracing::error!("failed to serve orchestrator api: {}", err);
    }
}
