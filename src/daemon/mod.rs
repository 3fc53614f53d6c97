use crate::config::{Config, GatewayConfig, JobsConfig};
use crate::orchestrator::{BroadcastEventSink, Coordinator, OrchestratorEvent};
use crate::store::Store;
use crate::transport::DeliverySettings;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 60;
const EVENT_BUFFER: usize = 1024;

pub async fn run(config: Config) -> Result<()> {
    let db_path = config.db_path();
    let store = Store::open(&db_path)?;
    let events = Arc::new(BroadcastEventSink::new(EVENT_BUFFER));
    let coordinator = Arc::new(Coordinator::new(
        store,
        events.clone(),
        DeliverySettings::from(&config.delivery),
        config.dedup.retention(),
    ));

    let purged = coordinator
        .agents()
        .purge_stale()
        .context("Failed to clear agents from a previous run")?;
    if purged > 0 {
        tracing::info!(purged, "Removed agents left by a previous run");
    }

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    {
        let gateway_cfg = config.gateway.clone();
        let gateway_coordinator = Arc::clone(&coordinator);
        handles.push(spawn_component_supervisor(
            "gateway",
            INITIAL_BACKOFF_SECS,
            MAX_BACKOFF_SECS,
            move || {
                let cfg: GatewayConfig = gateway_cfg.clone();
                let coordinator = Arc::clone(&gateway_coordinator);
                async move { crate::gateway::run_gateway(cfg, coordinator).await }
            },
        ));
    }

    {
        let jobs_cfg = config.jobs.clone();
        let sweeper_coordinator = Arc::clone(&coordinator);
        handles.push(spawn_component_supervisor(
            "idle_sweeper",
            INITIAL_BACKOFF_SECS,
            MAX_BACKOFF_SECS,
            move || {
                let cfg = jobs_cfg.clone();
                let coordinator = Arc::clone(&sweeper_coordinator);
                async move { run_idle_sweeper(coordinator, cfg).await }
            },
        ));
    }

    {
        let log_events = Arc::clone(&events);
        handles.push(spawn_component_supervisor(
            "event_log",
            INITIAL_BACKOFF_SECS,
            MAX_BACKOFF_SECS,
            move || {
                let rx = log_events.subscribe();
                async move { run_event_log(rx).await }
            },
        ));
    }

    println!("threadhub daemon started");
    println!("   Gateway:  http://{}:{}", config.gateway.host, config.gateway.port);
    println!("   Database: {}", db_path.display());
    println!("   Components: gateway, idle_sweeper, event_log");
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }
    coordinator.shutdown().await;

    Ok(())
}

fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            match run_component().await {
                Ok(()) => {
                    tracing::warn!("Daemon component '{name}' exited unexpectedly");
                    // A clean exit means it ran; start the backoff over.
                    backoff = initial_backoff_secs.max(1);
                }
                Err(e) => {
                    tracing::error!("Daemon component '{name}' failed: {e:#}");
                }
            }

            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}

/// Periodically release agents from idle jobs. A failed pass is logged and
/// the next tick tries again.
async fn run_idle_sweeper(coordinator: Arc<Coordinator>, config: JobsConfig) -> Result<()> {
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.idle_sweep_interval_secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        if let Err(e) = coordinator.sweep_idle_jobs(config.idle_minutes) {
            tracing::warn!("Idle sweep failed: {e:#}");
        }
    }
}

/// Trace every orchestrator event as one structured line.
async fn run_event_log(mut rx: broadcast::Receiver<OrchestratorEvent>) -> Result<()> {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let json = serde_json::to_string(&event)?;
                tracing::info!(event = event.name(), "{json}");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event log lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => {
                anyhow::bail!("event channel closed");
            }
        }
    }
}
