//! Persistence boundary for tenders.
//!
//! Every write goes through upsert-by-tender-number or a scoped bulk
//! operation; collaborators (UI, scorer, attachment collector) read through
//! `get` and `find`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tender_core::{StatusSource, Tender, TenderStatus};
use tender_storage::{RetryDisposition, Retryable};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::lock::{Operation, RunLease, RunLocks};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection loss or pool exhaustion; the current batch must stop.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store refused this one record.
    #[error("store rejected write: {0}")]
    Rejected(String),
    #[error("store serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_systemic(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl Retryable for StoreError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Unavailable(_) => RetryDisposition::Retryable,
            StoreError::Rejected(_) | StoreError::Serialization(_) => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Whether ingestion may overwrite an operator-set status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManualStatusPolicy {
    #[default]
    Overwrite,
    Preserve,
}

impl ManualStatusPolicy {
    pub fn from_flag(respect_manual_status: bool) -> Self {
        if respect_manual_status {
            ManualStatusPolicy::Preserve
        } else {
            ManualStatusPolicy::Overwrite
        }
    }

    pub fn preserves(self, source: StatusSource) -> bool {
        self == ManualStatusPolicy::Preserve && source == StatusSource::Manual
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub tender_number: String,
    pub from: TenderStatus,
    pub to: TenderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PurgeCounts {
    pub deleted: u64,
    pub remaining: u64,
}

/// Read-side selection. Empty fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenderFilter {
    #[serde(default)]
    pub statuses: Vec<TenderStatus>,
    pub closes_on_or_after: Option<NaiveDate>,
    pub closes_on_or_before: Option<NaiveDate>,
    pub min_total_budget: Option<i64>,
    pub max_total_budget: Option<i64>,
    /// Case-insensitive substring of the region name.
    pub region: Option<String>,
    pub classification_prefix: Option<String>,
    pub limit: Option<u32>,
}

impl TenderFilter {
    pub fn matches(&self, tender: &Tender) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&tender.status) {
            return false;
        }

        let close_date = tender.timeline.bid_close_at.map(|ts| ts.date());
        if let Some(from) = self.closes_on_or_after {
            if close_date.map_or(true, |d| d < from) {
                return false;
            }
        }
        if let Some(to) = self.closes_on_or_before {
            if close_date.map_or(true, |d| d > to) {
                return false;
            }
        }

        if let Some(min) = self.min_total_budget {
            if tender.budget.total.map_or(true, |t| t < min) {
                return false;
            }
        }
        if let Some(max) = self.max_total_budget {
            if tender.budget.total.map_or(true, |t| t > max) {
                return false;
            }
        }

        if let Some(region) = &self.region {
            let wanted = region.trim().to_lowercase();
            if !tender
                .region
                .as_deref()
                .is_some_and(|r| r.to_lowercase().contains(&wanted))
            {
                return false;
            }
        }

        if let Some(prefix) = &self.classification_prefix {
            if !tender
                .classification
                .code
                .as_deref()
                .is_some_and(|code| code.starts_with(prefix.trim()))
            {
                return false;
            }
        }

        true
    }
}

#[async_trait]
pub trait TenderStore: Send + Sync {
    async fn get(&self, tender_number: &str) -> Result<Option<Tender>, StoreError>;

    async fn find(&self, filter: &TenderFilter) -> Result<Vec<Tender>, StoreError>;

    /// Insert, or overwrite every upstream-owned field of the existing row.
    /// `favorite` and `unsuitable` are never touched on update.
    async fn upsert(
        &self,
        tender: &Tender,
        policy: ManualStatusPolicy,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Tenders whose status is not terminal.
    async fn list_reconcilable(&self) -> Result<Vec<Tender>, StoreError>;

    /// Applies all changes in one transaction. A change only lands if the
    /// stored status still equals `from`; returns how many landed.
    async fn apply_status_changes(&self, changes: &[StatusChange]) -> Result<u64, StoreError>;

    /// Deletes every tender in `status` and counts what is left, atomically.
    async fn delete_by_status(&self, status: TenderStatus) -> Result<PurgeCounts, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    /// Operator override; marks the status as manually set.
    async fn set_operator_status(
        &self,
        tender_number: &str,
        status: TenderStatus,
    ) -> Result<bool, StoreError>;

    /// Claims `operation` for every process using this store. `None` while
    /// another holder has it; never waits.
    async fn try_lock(&self, operation: Operation) -> Result<Option<RunLease>, StoreError>;
}

/// In-process store keyed by tender number.
#[derive(Debug, Default)]
pub struct MemoryTenderStore {
    tenders: RwLock<BTreeMap<String, Tender>>,
    locks: RunLocks,
}

impl MemoryTenderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<Tender> {
        self.tenders.read().await.values().cloned().collect()
    }

    pub async fn set_flags(&self, tender_number: &str, favorite: bool, unsuitable: bool) -> bool {
        match self.tenders.write().await.get_mut(tender_number) {
            Some(tender) => {
                tender.favorite = favorite;
                tender.unsuitable = unsuitable;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl TenderStore for MemoryTenderStore {
    async fn get(&self, tender_number: &str) -> Result<Option<Tender>, StoreError> {
        Ok(self.tenders.read().await.get(tender_number).cloned())
    }

    async fn find(&self, filter: &TenderFilter) -> Result<Vec<Tender>, StoreError> {
        let guard = self.tenders.read().await;
        let mut found: Vec<Tender> = guard.values().filter(|t| filter.matches(t)).cloned().collect();
        found.sort_by(|a, b| {
            let key = |t: &Tender| (t.timeline.bid_close_at.is_none(), t.timeline.bid_close_at);
            key(a).cmp(&key(b)).then_with(|| a.tender_number.cmp(&b.tender_number))
        });
        if let Some(limit) = filter.limit {
            found.truncate(limit as usize);
        }
        Ok(found)
    }

    async fn upsert(
        &self,
        tender: &Tender,
        policy: ManualStatusPolicy,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut guard = self.tenders.write().await;
        match guard.get_mut(&tender.tender_number) {
            Some(existing) => {
                let mut next = tender.clone();
                next.favorite = existing.favorite;
                next.unsuitable = existing.unsuitable;
                if policy.preserves(existing.status_source) {
                    next.status = existing.status;
                    next.status_source = existing.status_source;
                }
                *existing = next;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                guard.insert(tender.tender_number.clone(), tender.clone());
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn list_reconcilable(&self) -> Result<Vec<Tender>, StoreError> {
        Ok(self
            .tenders
            .read()
            .await
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn apply_status_changes(&self, changes: &[StatusChange]) -> Result<u64, StoreError> {
        let mut guard = self.tenders.write().await;
        let mut applied = 0;
        for change in changes {
            if let Some(tender) = guard.get_mut(&change.tender_number) {
                if tender.status == change.from {
                    tender.status = change.to;
                    tender.status_source = StatusSource::Auto;
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }

    async fn delete_by_status(&self, status: TenderStatus) -> Result<PurgeCounts, StoreError> {
        let mut guard = self.tenders.write().await;
        let before = guard.len();
        guard.retain(|_, t| t.status != status);
        Ok(PurgeCounts {
            deleted: (before - guard.len()) as u64,
            remaining: guard.len() as u64,
        })
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.tenders.read().await.len() as u64)
    }

    async fn set_operator_status(
        &self,
        tender_number: &str,
        status: TenderStatus,
    ) -> Result<bool, StoreError> {
        match self.tenders.write().await.get_mut(tender_number) {
            Some(tender) => {
                tender.status = status;
                tender.status_source = StatusSource::Manual;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn try_lock(&self, operation: Operation) -> Result<Option<RunLease>, StoreError> {
        Ok(self
            .locks
            .try_acquire(operation)
            .map(|guard| RunLease::new(operation, guard)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tender_core::Budget;

    fn tender(number: &str, status: TenderStatus) -> Tender {
        let mut t = Tender::new(number, Utc::now());
        t.status = status;
        t
    }

    #[tokio::test]
    async fn upsert_creates_then_updates_and_keeps_operator_flags() {
        let store = MemoryTenderStore::new();
        let mut t = tender("A-1", TenderStatus::Active);
        t.title = "first".into();
        assert_eq!(store.upsert(&t, ManualStatusPolicy::Overwrite).await.unwrap(), UpsertOutcome::Created);
        assert!(store.set_flags("A-1", true, true).await);

        t.title = "second".into();
        assert_eq!(store.upsert(&t, ManualStatusPolicy::Overwrite).await.unwrap(), UpsertOutcome::Updated);

        let stored = store.get("A-1").await.unwrap().unwrap();
        assert_eq!(stored.title, "second");
        assert!(stored.favorite);
        assert!(stored.unsuitable);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn manual_status_survives_upsert_only_when_preserved() {
        let store = MemoryTenderStore::new();
        let t = tender("A-1", TenderStatus::Active);
        store.upsert(&t, ManualStatusPolicy::Overwrite).await.unwrap();
        assert!(store.set_operator_status("A-1", TenderStatus::Closed).await.unwrap());
        assert!(!store.set_operator_status("missing", TenderStatus::Closed).await.unwrap());

        store.upsert(&t, ManualStatusPolicy::Preserve).await.unwrap();
        let stored = store.get("A-1").await.unwrap().unwrap();
        assert_eq!(stored.status, TenderStatus::Closed);
        assert_eq!(stored.status_source, StatusSource::Manual);

        store.upsert(&t, ManualStatusPolicy::Overwrite).await.unwrap();
        let stored = store.get("A-1").await.unwrap().unwrap();
        assert_eq!(stored.status, TenderStatus::Active);
        assert_eq!(stored.status_source, StatusSource::Auto);
    }

    #[tokio::test]
    async fn status_changes_are_compare_and_set() {
        let store = MemoryTenderStore::new();
        store.upsert(&tender("A-1", TenderStatus::Active), ManualStatusPolicy::Overwrite).await.unwrap();
        let applied = store
            .apply_status_changes(&[
                StatusChange {
                    tender_number: "A-1".into(),
                    from: TenderStatus::Active,
                    to: TenderStatus::Closed,
                },
                StatusChange {
                    tender_number: "A-1".into(),
                    from: TenderStatus::Active,
                    to: TenderStatus::Opened,
                },
            ])
            .await
            .unwrap();
        assert_eq!(applied, 1);
        assert_eq!(store.get("A-1").await.unwrap().unwrap().status, TenderStatus::Closed);
    }

    #[tokio::test]
    async fn delete_by_status_reports_remaining() {
        let store = MemoryTenderStore::new();
        for (n, s) in [("A", TenderStatus::Closed), ("B", TenderStatus::Closed), ("C", TenderStatus::Active)] {
            store.upsert(&tender(n, s), ManualStatusPolicy::Overwrite).await.unwrap();
        }
        let counts = store.delete_by_status(TenderStatus::Closed).await.unwrap();
        assert_eq!(counts, PurgeCounts { deleted: 2, remaining: 1 });
        assert!(store.list_reconcilable().await.unwrap().iter().all(|t| t.tender_number == "C"));
    }

    #[tokio::test]
    async fn find_applies_every_criterion() {
        let store = MemoryTenderStore::new();
        let mut a = tender("A", TenderStatus::Active);
        a.region = Some("서울특별시".into());
        a.classification.code = Some("72101501".into());
        a.budget = Budget::from_components(Some(1_000_000), Some(100_000), None);
        a.timeline.bid_close_at = NaiveDate::from_ymd_opt(2025, 9, 10).and_then(|d| d.and_hms_opt(18, 0, 0));
        let mut b = tender("B", TenderStatus::Closed);
        b.region = Some("부산광역시".into());
        store.upsert(&a, ManualStatusPolicy::Overwrite).await.unwrap();
        store.upsert(&b, ManualStatusPolicy::Overwrite).await.unwrap();

        let filter = TenderFilter {
            statuses: vec![TenderStatus::Active],
            closes_on_or_after: NaiveDate::from_ymd_opt(2025, 9, 10),
            closes_on_or_before: NaiveDate::from_ymd_opt(2025, 9, 30),
            min_total_budget: Some(1_100_000),
            max_total_budget: Some(2_000_000),
            region: Some("서울".into()),
            classification_prefix: Some("7210".into()),
            limit: Some(10),
        };
        let found = store.find(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tender_number, "A");

        let all = store.find(&TenderFilter { limit: Some(1), ..Default::default() }).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].tender_number, "A");

        let over_budget = TenderFilter { min_total_budget: Some(1_100_001), ..Default::default() };
        assert!(store.find(&over_budget).await.unwrap().is_empty());
    }

    #[test]
    fn only_unavailable_is_systemic() {
        assert!(StoreError::Unavailable("down".into()).is_systemic());
        assert!(StoreError::Unavailable("down".into()).is_retryable());
        assert!(!StoreError::Rejected("dup".into()).is_systemic());
        assert!(!StoreError::Serialization("bad".into()).is_retryable());
    }

    #[tokio::test]
    async fn store_lock_is_exclusive_per_operation() {
        let store = MemoryTenderStore::new();
        let lease = store.try_lock(Operation::Collect).await.unwrap().unwrap();
        assert!(store.try_lock(Operation::Collect).await.unwrap().is_none());
        assert!(store.try_lock(Operation::Purge).await.unwrap().is_some());
        drop(lease);
        assert!(store.try_lock(Operation::Collect).await.unwrap().is_some());
    }
}
