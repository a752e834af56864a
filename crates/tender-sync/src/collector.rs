//! Collection, status reconciliation and the retention sweep.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::Serialize;
use tender_adapters::{
    map_record, AdvancedFilter, ApiError, DateWindow, ListOperation, PageRequest, TenderSource,
};
use tender_core::{StatusSource, TenderStatus};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::lock::{Operation, RunGuard, RunLease, RunLocks};
use crate::store::{ManualStatusPolicy, StatusChange, StoreError, TenderStore, UpsertOutcome};

pub const MAX_ERROR_SAMPLES: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub run_id: Uuid,
    pub operation: &'static str,
    pub window: DateWindow,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pages: u32,
    pub fetched: u64,
    pub created: u64,
    pub updated: u64,
    pub mapping_failures: u64,
    pub store_failures: u64,
    pub filtered_out: u64,
    pub cancelled: bool,
    pub errors: Vec<String>,
}

impl CollectionReport {
    fn start(operation: ListOperation, window: DateWindow) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            operation: operation.path(),
            window,
            started_at: Utc::now(),
            finished_at: None,
            pages: 0,
            fetched: 0,
            created: 0,
            updated: 0,
            mapping_failures: 0,
            store_failures: 0,
            filtered_out: 0,
            cancelled: false,
            errors: Vec::new(),
        }
    }

    fn note_error(&mut self, message: String) {
        if self.errors.len() < MAX_ERROR_SAMPLES {
            self.errors.push(message);
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub run_id: Uuid,
    pub today: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scanned: u64,
    pub changed: u64,
    pub skipped_manual: u64,
    /// `"active->closed"` style keys.
    pub transitions: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub deleted: u64,
    pub remaining: u64,
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("a {0} run is already in progress")]
    AlreadyRunning(Operation),
    #[error("upstream request failed: {source}")]
    Api {
        #[source]
        source: ApiError,
        partial: Box<CollectionReport>,
    },
    #[error("store failed mid-run: {source}")]
    Store {
        #[source]
        source: StoreError,
        partial: Box<CollectionReport>,
    },
}

impl CollectError {
    pub fn partial_report(&self) -> Option<&CollectionReport> {
        match self {
            CollectError::AlreadyRunning(_) => None,
            CollectError::Api { partial, .. } | CollectError::Store { partial, .. } => {
                Some(partial.as_ref())
            }
        }
    }
}

/// Reconciliation and purge failures abort only that pass.
#[derive(Debug, Error)]
pub enum PassError {
    #[error("a {0} run is already in progress")]
    AlreadyRunning(Operation),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub inquiry_division: String,
    pub page_size: u32,
    pub max_window_days: u32,
    /// Safety stop per window in case upstream misreports its total.
    pub max_pages: u32,
    pub utc_offset: FixedOffset,
    pub respect_manual_status: bool,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            inquiry_division: "1".to_string(),
            page_size: 100,
            max_window_days: 31,
            max_pages: 500,
            utc_offset: FixedOffset::east_opt(9 * 3600).unwrap_or_else(|| Utc.fix()),
            respect_manual_status: false,
        }
    }
}

/// Both claims on an operation, held for one run.
struct RunHold {
    _lease: RunLease,
    _local: RunGuard,
}

pub struct Collector {
    source: Arc<dyn TenderSource>,
    store: Arc<dyn TenderStore>,
    locks: RunLocks,
    settings: CollectorSettings,
}

impl Collector {
    pub fn new(
        source: Arc<dyn TenderSource>,
        store: Arc<dyn TenderStore>,
        settings: CollectorSettings,
    ) -> Self {
        Self {
            source,
            store,
            locks: RunLocks::new(),
            settings,
        }
    }

    /// Share run locks with other collectors in the same process.
    pub fn with_locks(mut self, locks: RunLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn TenderStore> {
        &self.store
    }

    /// Calendar day at the configured upstream offset.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.settings.utc_offset).date_naive()
    }

    fn manual_policy(&self) -> ManualStatusPolicy {
        ManualStatusPolicy::from_flag(self.settings.respect_manual_status)
    }

    pub async fn collect_by_date_range(
        &self,
        window: DateWindow,
        inquiry_division: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CollectionReport, CollectError> {
        let division = inquiry_division
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(self.settings.inquiry_division.as_str())
            .to_string();
        self.run_collection(
            ListOperation::ByDateRange,
            window,
            division,
            AdvancedFilter::default(),
            cancel,
        )
        .await
    }

    /// Uses the search operation, sending what it supports natively and
    /// re-checking every criterion on the mapped records.
    pub async fn collect_with_filters(
        &self,
        window: DateWindow,
        filter: AdvancedFilter,
        cancel: &CancellationToken,
    ) -> Result<CollectionReport, CollectError> {
        let division = self.settings.inquiry_division.clone();
        self.run_collection(ListOperation::ServiceSearch, window, division, filter, cancel)
            .await
    }

    /// Process-local claim first, then the store-wide one that other
    /// processes on the same store also take.
    async fn acquire(&self, operation: Operation) -> Result<Option<RunHold>, StoreError> {
        let Some(local) = self.locks.try_acquire(operation) else {
            warn!(operation = %operation, "run skipped, previous run still in progress");
            return Ok(None);
        };
        match self.store.try_lock(operation).await? {
            Some(lease) => Ok(Some(RunHold {
                _lease: lease,
                _local: local,
            })),
            None => {
                warn!(operation = %operation, "run skipped, another process is running it");
                Ok(None)
            }
        }
    }

    async fn run_collection(
        &self,
        operation: ListOperation,
        window: DateWindow,
        inquiry_division: String,
        filter: AdvancedFilter,
        cancel: &CancellationToken,
    ) -> Result<CollectionReport, CollectError> {
        let mut report = CollectionReport::start(operation, window);
        let _hold = match self.acquire(Operation::Collect).await {
            Ok(Some(hold)) => hold,
            Ok(None) => return Err(CollectError::AlreadyRunning(Operation::Collect)),
            Err(source) => {
                return Err(CollectError::Store {
                    source,
                    partial: Box::new(report.finish()),
                })
            }
        };

        let today = self.today();
        let policy = self.manual_policy();
        info!(
            run_id = %report.run_id,
            operation = operation.path(),
            begin = %window.begin,
            end = %window.end,
            "collection started"
        );

        'windows: for part in window.split(self.settings.max_window_days) {
            let mut page_no = 1u32;
            let mut seen = 0u64;
            loop {
                if cancel.is_cancelled() {
                    info!(run_id = %report.run_id, page = page_no, "collection cancelled between pages");
                    report.cancelled = true;
                    break 'windows;
                }

                let request = PageRequest {
                    operation,
                    window: part,
                    inquiry_division: inquiry_division.clone(),
                    page_no,
                    page_size: self.settings.page_size,
                    filter: filter.clone(),
                };
                let page = match self.source.fetch_page(&request).await {
                    Ok(page) => page,
                    Err(source) => {
                        error!(run_id = %report.run_id, page = page_no, error = %source, "collection aborted");
                        return Err(CollectError::Api {
                            source,
                            partial: Box::new(report.finish()),
                        });
                    }
                };
                report.pages += 1;
                if page.items.is_empty() {
                    break;
                }

                let collected_at = Utc::now();
                for raw in &page.items {
                    report.fetched += 1;
                    let mut tender = match map_record(raw, collected_at) {
                        Ok(tender) => tender,
                        Err(err) => {
                            report.mapping_failures += 1;
                            warn!(run_id = %report.run_id, page = page_no, error = %err, "record skipped");
                            report.note_error(format!("page {page_no}: {err}"));
                            continue;
                        }
                    };
                    if !filter.matches(&tender) {
                        report.filtered_out += 1;
                        continue;
                    }

                    tender.status = tender.derived_status(today);
                    tender.status_source = StatusSource::Auto;
                    match self.store.upsert(&tender, policy).await {
                        Ok(UpsertOutcome::Created) => report.created += 1,
                        Ok(UpsertOutcome::Updated) => report.updated += 1,
                        Err(source) if source.is_systemic() => {
                            error!(
                                run_id = %report.run_id,
                                tender_number = %tender.tender_number,
                                error = %source,
                                "store unavailable, aborting collection"
                            );
                            return Err(CollectError::Store {
                                source,
                                partial: Box::new(report.finish()),
                            });
                        }
                        Err(err) => {
                            report.store_failures += 1;
                            warn!(tender_number = %tender.tender_number, error = %err, "record not stored");
                            report.note_error(format!("{}: {err}", tender.tender_number));
                        }
                    }
                }

                seen += page.items.len() as u64;
                if seen >= page.total_count {
                    break;
                }
                if page_no >= self.settings.max_pages {
                    warn!(
                        run_id = %report.run_id,
                        pages = page_no,
                        total = page.total_count,
                        "page limit reached before upstream total"
                    );
                    break;
                }
                page_no += 1;
            }
        }

        let report = report.finish();
        info!(
            run_id = %report.run_id,
            fetched = report.fetched,
            created = report.created,
            updated = report.updated,
            mapping_failures = report.mapping_failures,
            store_failures = report.store_failures,
            cancelled = report.cancelled,
            "collection finished"
        );
        Ok(report)
    }

    pub async fn reconcile_statuses(&self) -> Result<ReconcileReport, PassError> {
        self.reconcile_statuses_on(self.today()).await
    }

    /// Recomputes status for every non-terminal tender as of `today`.
    pub async fn reconcile_statuses_on(&self, today: NaiveDate) -> Result<ReconcileReport, PassError> {
        let _hold = self
            .acquire(Operation::Reconcile)
            .await?
            .ok_or(PassError::AlreadyRunning(Operation::Reconcile))?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let policy = self.manual_policy();

        let candidates = self.store.list_reconcilable().await?;
        let mut skipped_manual = 0u64;
        let mut transitions: BTreeMap<String, u64> = BTreeMap::new();
        let mut changes = Vec::new();
        for tender in &candidates {
            if policy.preserves(tender.status_source) {
                skipped_manual += 1;
                continue;
            }
            let next = tender.derived_status(today);
            if next != tender.status {
                *transitions.entry(format!("{}->{}", tender.status, next)).or_default() += 1;
                changes.push(StatusChange {
                    tender_number: tender.tender_number.clone(),
                    from: tender.status,
                    to: next,
                });
            }
        }

        let changed = self.store.apply_status_changes(&changes).await?;
        let report = ReconcileReport {
            run_id,
            today,
            started_at,
            finished_at: Utc::now(),
            scanned: candidates.len() as u64,
            changed,
            skipped_manual,
            transitions,
        };
        info!(run_id = %run_id, scanned = report.scanned, changed, skipped_manual, "statuses reconciled");
        Ok(report)
    }

    pub async fn purge_closed(&self) -> Result<PurgeReport, PassError> {
        let _hold = self
            .acquire(Operation::Purge)
            .await?
            .ok_or(PassError::AlreadyRunning(Operation::Purge))?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let counts = self.store.delete_by_status(TenderStatus::Closed).await?;
        info!(run_id = %run_id, deleted = counts.deleted, remaining = counts.remaining, "closed tenders purged");
        Ok(PurgeReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            deleted: counts.deleted,
            remaining: counts.remaining,
        })
    }
}
