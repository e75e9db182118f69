use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::{connect_store, pipeline_for, SyncConfig, SyncPipeline};

/// Scheduler that runs `pipeline` on `cron`. A tick that fires while the
/// previous run is still in progress is skipped.
pub async fn build_scheduler(cron: &str, pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let in_progress = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron, move |_uuid, _sched| {
        let pipeline = pipeline.clone();
        let in_progress = in_progress.clone();
        Box::pin(async move {
            let Ok(_running) = in_progress.try_lock() else {
                warn!("previous sync still running, skipping scheduled tick");
                return;
            };
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    outcome = ?summary.outcome,
                    associations = summary.association_ids.len(),
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Run sync on the configured cron until Ctrl-C.
pub async fn run_scheduled() -> Result<()> {
    let config = SyncConfig::from_env().context("loading configuration")?;
    let store = connect_store(&config)
        .await
        .context("connecting to the relational store")?;
    let pipeline = Arc::new(pipeline_for(&config, store.clone()));

    let mut sched = build_scheduler(&config.sync_cron, pipeline).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    store.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use filelink_core::AssociationKinds;
    use filelink_storage::MemoryStore;
    use filelink_transport::MemoryTransport;

    use crate::Collaborators;

    fn idle_pipeline() -> Arc<SyncPipeline> {
        let store = Arc::new(MemoryStore::new());
        Arc::new(SyncPipeline::new(
            AssociationKinds::default(),
            Collaborators {
                transport: Arc::new(MemoryTransport::new()),
                domains: store.clone(),
                files: store.clone(),
                associations: store,
            },
        ))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn default_cron_builds_a_scheduler() {
        assert!(build_scheduler(crate::DEFAULT_SYNC_CRON, idle_pipeline())
            .await
            .is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_cron_is_rejected() {
        assert!(build_scheduler("every tuesday-ish", idle_pipeline())
            .await
            .is_err());
    }
}
