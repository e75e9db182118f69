//! Sync pipeline orchestration: remote listing -> match -> diff -> fetch ->
//! store -> link.

use std::sync::Arc;

use anyhow::{Context, Result};
use filelink_storage::PgStore;
use filelink_transport::FtpTransport;

mod config;
mod pipeline;
mod schedule;

pub use config::{ConfigError, DatabaseConfig, SyncConfig, DEFAULT_SYNC_CRON};
pub use pipeline::{
    Collaborators, LinkedArtifact, RunOutcome, SyncError, SyncPipeline, SyncPlan, SyncRunSummary,
};
pub use schedule::{build_scheduler, run_scheduled};

pub const CRATE_NAME: &str = "filelink-sync";

pub async fn connect_store(config: &SyncConfig) -> Result<PgStore, SyncError> {
    let options = config.database.connect_options()?;
    Ok(PgStore::connect(options).await?)
}

/// Wire the Postgres store and FTP transport described by `config`.
pub fn pipeline_for(config: &SyncConfig, store: PgStore) -> SyncPipeline {
    let store = Arc::new(store);
    SyncPipeline::new(
        config.kinds.clone(),
        Collaborators {
            transport: Arc::new(FtpTransport::new(config.remote.clone())),
            domains: store.clone(),
            files: store.clone(),
            associations: store,
        },
    )
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env().context("loading configuration")?;
    let store = connect_store(&config)
        .await
        .context("connecting to the relational store")?;
    let summary = pipeline_for(&config, store.clone()).run_once().await;
    store.close().await;
    Ok(summary?)
}

pub async fn plan_from_env() -> Result<SyncPlan> {
    let config = SyncConfig::from_env().context("loading configuration")?;
    let store = connect_store(&config)
        .await
        .context("connecting to the relational store")?;
    let plan = pipeline_for(&config, store.clone()).plan().await;
    store.close().await;
    Ok(plan?)
}

pub async fn migrate_from_env() -> Result<()> {
    let config = SyncConfig::from_env().context("loading configuration")?;
    let store = connect_store(&config)
        .await
        .context("connecting to the relational store")?;
    store.migrate().await.context("applying migrations")?;
    store.close().await;
    Ok(())
}
