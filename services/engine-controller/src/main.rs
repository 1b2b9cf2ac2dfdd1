//! Engine controller
//!
//! Runs next to the status store and result archive in the engine namespace
//! and manages the lifecycle of test engine pods.
//!
//! ## Workers
//!
//! - **Scheduler**: launches engine pods for queued runs
//! - **Interrupt worker**: tears down interrupted runs, on a sweep and on watch activity
//! - **Status watcher**: feeds run changes to the interrupt worker
//! - **Cleanup worker**: deletes terminated pods of finished runs
//! - **Settings refresher**: reloads engine settings from the config map

use std::sync::Arc;

use anyhow::{Context, Result};
use enginectl_controller::cleanup::{CleanupWorker, RunPodCleanup};
use enginectl_controller::cluster::KubeClusterClient;
use enginectl_controller::config::Config;
use enginectl_controller::facade::EngineFacade;
use enginectl_controller::interrupts::{InterruptCollector, InterruptProcessor, InterruptWorker};
use enginectl_controller::pod_template::PodTemplate;
use enginectl_controller::scheduler::{EngineScheduler, SchedulerWorker};
use enginectl_controller::settings::SettingsRefresher;
use enginectl_controller::watcher::StatusWatcher;
use enginectl_reconcile::{Clock, SystemClock};
use enginectl_runs::memory::{InMemoryArchive, InMemoryRunRegistry};
use enginectl_runs::{ArchiveStore, RunRegistry, StatusFeed};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        namespace = %config.namespace,
        pod_name = %config.pod_name,
        config_map = %config.config_map_name,
        install_name = %config.install_name,
        "Starting engine controller"
    );

    let cluster = KubeClusterClient::try_default()
        .await
        .context("failed to connect to the cluster")?;
    let facade = EngineFacade::new(
        Arc::new(cluster),
        config.namespace.clone(),
        config.install_name.clone(),
        config.call_timeout,
    );

    let (refresher, settings) = SettingsRefresher::load(facade.clone(), config.config_map_name.clone())
        .await
        .context("failed to load engine settings")?;

    // In-memory until a persistent status store backend is wired in.
    warn!("Using in-memory run registry and archive");
    let store = Arc::new(InMemoryRunRegistry::new());
    let registry: Arc<dyn RunRegistry> = store.clone();
    let archive: Arc<dyn ArchiveStore> = Arc::new(InMemoryArchive::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    handles.push(tokio::spawn(refresher.run(shutdown_rx.clone())));

    let scheduler = EngineScheduler::new(
        facade.clone(),
        registry.clone(),
        settings.clone(),
        PodTemplate::from_config(&config),
        clock.clone(),
        config.pod_name.clone(),
        config.call_timeout,
    );
    handles.push(tokio::spawn(
        SchedulerWorker::new(scheduler, settings.clone()).run(shutdown_rx.clone()),
    ));

    let (watcher, changes) = StatusWatcher::channel(config.watch_queue_capacity);
    handles.push(tokio::spawn(watcher.run(store.subscribe(), shutdown_rx.clone())));

    let collector = InterruptCollector::new(
        facade.clone(),
        registry.clone(),
        settings.clone(),
        clock,
        config.call_timeout,
    );
    let processor = InterruptProcessor::new(facade.clone(), registry.clone(), archive, config.call_timeout);
    handles.push(tokio::spawn(
        InterruptWorker::new(collector, processor, changes, config.interrupt_poll).run(shutdown_rx.clone()),
    ));

    let cleanup = RunPodCleanup::new(facade, registry, settings.clone(), config.call_timeout);
    handles.push(tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            CleanupWorker::new(cleanup, settings).run(shutdown_rx).await;
        }
    }));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Worker task failed");
        }
    }

    info!("Engine controller shutdown complete");
    Ok(())
}
