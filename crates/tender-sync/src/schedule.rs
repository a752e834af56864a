//! Cron-driven invocation of the collector operations.

use std::sync::Arc;

use anyhow::{Context, Result};
use tender_adapters::DateWindow;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::collector::{CollectError, Collector, PassError};
use crate::config::{JobAction, ScheduleConfig, ScheduledJob};

pub async fn build_scheduler(
    collector: Arc<Collector>,
    schedule: &ScheduleConfig,
    cancel: CancellationToken,
) -> Result<JobScheduler> {
    schedule.validate()?;
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for spec in &schedule.jobs {
        let collector = collector.clone();
        let cancel = cancel.clone();
        let job_spec = spec.clone();
        let job = Job::new_async(spec.cron.as_str(), move |_uuid, _l| {
            let collector = collector.clone();
            let cancel = cancel.clone();
            let job_spec = job_spec.clone();
            Box::pin(async move {
                run_job(&collector, &job_spec, &cancel).await;
            })
        })
        .with_context(|| format!("creating scheduler job `{}` for cron {}", spec.name, spec.cron))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(job = %spec.name, cron = %spec.cron, action = ?spec.action, "job scheduled");
    }
    Ok(sched)
}

/// Runs one scheduled job to completion; failures are logged, never raised,
/// so a bad run does not take the scheduler down.
pub async fn run_job(collector: &Collector, job: &ScheduledJob, cancel: &CancellationToken) {
    match job.action {
        JobAction::Collect => {
            let window = DateWindow::around(
                collector.today(),
                job.window.days_back,
                job.window.days_forward,
            );
            match collector.collect_by_date_range(window, None, cancel).await {
                Ok(report) => info!(
                    job = %job.name,
                    run_id = %report.run_id,
                    created = report.created,
                    updated = report.updated,
                    mapping_failures = report.mapping_failures,
                    "scheduled collection finished"
                ),
                Err(CollectError::AlreadyRunning(_)) => {}
                Err(err) => error!(job = %job.name, error = %err, "scheduled collection failed"),
            }
        }
        JobAction::Reconcile => match collector.reconcile_statuses().await {
            Ok(report) => info!(job = %job.name, run_id = %report.run_id, changed = report.changed, "scheduled reconciliation finished"),
            Err(PassError::AlreadyRunning(_)) => {}
            Err(err) => error!(job = %job.name, error = %err, "scheduled reconciliation failed"),
        },
        JobAction::Purge => match collector.purge_closed().await {
            Ok(report) => info!(job = %job.name, run_id = %report.run_id, deleted = report.deleted, "scheduled purge finished"),
            Err(PassError::AlreadyRunning(_)) => {}
            Err(err) => error!(job = %job.name, error = %err, "scheduled purge failed"),
        },
    }
}

/// Start the scheduler and park until `cancel` fires.
pub async fn run_until_cancelled(mut sched: JobScheduler, cancel: CancellationToken) -> Result<()> {
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running");
    cancel.cancelled().await;
    info!("scheduler shutdown requested");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorSettings;
    use crate::config::WindowSpec;
    use crate::store::{ManualStatusPolicy, MemoryTenderStore, TenderStore};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use tender_adapters::{ApiError, ApiPage, PageRequest, TenderSource};
    use tender_core::{Tender, TenderStatus};

    #[derive(Default)]
    struct RecordingSource {
        requests: Mutex<Vec<PageRequest>>,
    }

    #[async_trait]
    impl TenderSource for RecordingSource {
        async fn fetch_page(&self, request: &PageRequest) -> Result<ApiPage, ApiError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(ApiPage {
                result_code: "03".into(),
                result_message: "NODATA_ERROR".into(),
                total_count: 0,
                page_no: request.page_no,
                items: Vec::new(),
            })
        }
    }

    fn job(action: JobAction, window: WindowSpec) -> ScheduledJob {
        ScheduledJob {
            name: "test".into(),
            cron: "0 0 * * * *".into(),
            action,
            window,
        }
    }

    #[tokio::test]
    async fn collect_job_uses_rolling_window() {
        let source = Arc::new(RecordingSource::default());
        let collector = Collector::new(source.clone(), Arc::new(MemoryTenderStore::new()), CollectorSettings::default());
        let spec = job(
            JobAction::Collect,
            WindowSpec {
                days_back: 14,
                days_forward: 0,
            },
        );
        run_job(&collector, &spec, &CancellationToken::new()).await;

        let requests = source.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].window.days(), 15);
        assert_eq!(requests[0].window.end, collector.today());
    }

    #[tokio::test]
    async fn purge_job_runs_against_store() {
        let store = Arc::new(MemoryTenderStore::new());
        let mut closed = Tender::new("A", Utc::now());
        closed.status = TenderStatus::Closed;
        store.upsert(&closed, ManualStatusPolicy::Overwrite).await.unwrap();
        let collector = Collector::new(
            Arc::new(RecordingSource::default()),
            store.clone(),
            CollectorSettings::default(),
        );
        run_job(&collector, &job(JobAction::Purge, WindowSpec::default()), &CancellationToken::new()).await;
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn default_schedule_registers() {
        let collector = Arc::new(Collector::new(
            Arc::new(RecordingSource::default()),
            Arc::new(MemoryTenderStore::new()),
            CollectorSettings::default(),
        ));
        let sched = build_scheduler(collector, &ScheduleConfig::default(), CancellationToken::new()).await;
        assert!(sched.is_ok());
    }
}
