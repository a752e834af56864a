//! Tender collection, status reconciliation and retention orchestration.

use std::sync::Arc;

use anyhow::{Context, Result};
use tender_adapters::NaraApiClient;
use tender_storage::{HttpFetcher, ResponseArchive};
use tokio_cron_scheduler::JobScheduler;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod collector;
pub mod config;
pub mod lock;
pub mod postgres;
pub mod schedule;
pub mod store;

pub use collector::{
    CollectError, CollectionReport, Collector, CollectorSettings, PassError, PurgeReport,
    ReconcileReport,
};
pub use config::{JobAction, ScheduleConfig, ScheduledJob, SyncConfig, WindowSpec};
pub use lock::{Operation, RunLease, RunLocks};
pub use postgres::PgTenderStore;
pub use store::{
    ManualStatusPolicy, MemoryTenderStore, StoreError, TenderFilter, TenderStore, UpsertOutcome,
};

pub const CRATE_NAME: &str = "tender-sync";

/// Upstream client with the configured transport, retry policy and archive.
pub fn build_api_client(config: &SyncConfig) -> Result<NaraApiClient> {
    if config.api_key.is_empty() {
        warn!("TENDER_API_KEY is empty; upstream will reject requests");
    }
    let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
    let mut client = NaraApiClient::new(Arc::new(http), config.api_client_config());
    if let Some(dir) = &config.raw_archive_dir {
        info!(dir = %dir.display(), "archiving raw upstream pages");
        client = client.with_archive(ResponseArchive::new(dir.clone()));
    }
    Ok(client)
}

pub fn collector_settings(config: &SyncConfig) -> Result<CollectorSettings> {
    Ok(CollectorSettings {
        inquiry_division: config.inquiry_division.clone(),
        page_size: config.page_size,
        max_window_days: config.max_window_days,
        max_pages: config.max_pages,
        utc_offset: config.utc_offset()?,
        respect_manual_status: config.respect_manual_status,
    })
}

/// Wired pipeline: Postgres store, upstream client and collector.
pub struct SyncRuntime {
    config: SyncConfig,
    store: Arc<PgTenderStore>,
    collector: Arc<Collector>,
}

impl SyncRuntime {
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store = Arc::new(PgTenderStore::connect(&config.database_url).await?);
        let source = Arc::new(build_api_client(&config)?);
        let collector = Arc::new(Collector::new(
            source,
            store.clone(),
            collector_settings(&config)?,
        ));
        Ok(Self {
            config,
            store,
            collector,
        })
    }

    pub async fn from_env() -> Result<Self> {
        Self::connect(SyncConfig::from_env()).await
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PgTenderStore> {
        &self.store
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub async fn maybe_build_scheduler(
        &self,
        cancel: CancellationToken,
    ) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let schedule = ScheduleConfig::load(&self.config.schedule_file).await?;
        let sched = schedule::build_scheduler(self.collector.clone(), &schedule, cancel).await?;
        Ok(Some(sched))
    }
}
