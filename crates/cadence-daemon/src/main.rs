use std::sync::Arc;
use std::time::Duration;

use cadence_core::CadenceConfig;
use cadence_runner::ProcessRunner;
use cadence_scheduler::{JobRequest, Orchestrator, RunEvent};
use cadence_store::{spawn_durability_task, JobId, JobRepository, SqliteRepository};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_daemon=info,cadence_scheduler=info".into()),
        )
        .init();

    // load config: CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = std::env::var("CADENCE_CONFIG").ok();
    let config = CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    let repo: Arc<dyn JobRepository> = Arc::new(SqliteRepository::open(&config.database.path)?);
    let runner = Arc::new(ProcessRunner::from_config(&config.runner));
    let orchestrator = Orchestrator::new(repo.clone(), runner, config.scheduler.clone());

    submit_configured_jobs(&orchestrator, &config).await;

    // flush on its own timer, independent of orchestrator start/stop
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let durability = spawn_durability_task(
        repo.clone(),
        Duration::from_secs(config.durability.flush_interval_secs.max(1)),
        shutdown_rx,
    );

    tokio::spawn(log_events(orchestrator.subscribe()));
    orchestrator.start()?;
    info!("cadenced running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    orchestrator.stop().await?;
    let _ = shutdown_tx.send(true);
    if let Err(e) = durability.await {
        error!(error = %e, "durability task ended abnormally");
    }
    Ok(())
}

/// Submit every `[[jobs]]` entry the repository does not know yet.
///
/// A bad entry is logged and skipped so the others still start.
async fn submit_configured_jobs(orchestrator: &Orchestrator, config: &CadenceConfig) {
    for def in &config.jobs {
        let id = JobId::from(def.id.as_str());
        match orchestrator.job_exists(&id).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                error!(job_id = %id, error = %e, "could not check configured job");
                continue;
            }
        }
        if let Err(e) = orchestrator.add_job(JobRequest::from(def)).await {
            error!(job_id = %id, code = e.code(), error = %e, "configured job rejected");
        }
    }
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<RunEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let instance = event.instance();
                match &event {
                    RunEvent::Failed { error, .. } => warn!(
                        event = event.kind(),
                        job_id = %instance.job_id,
                        instance_id = %instance.id,
                        error = %error,
                        "run event"
                    ),
                    _ => info!(
                        event = event.kind(),
                        job_id = %instance.job_id,
                        instance_id = %instance.id,
                        "run event"
                    ),
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}
