//! `sqlx` Postgres implementation of [`TenderStore`].

use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tender_core::{
    AttachmentRef, Budget, Classification, StatusSource, Tender, TenderStatus, TenderTimeline,
};
use tracing::{debug, info};

use crate::lock::{Operation, RunLease};
use crate::store::{
    ManualStatusPolicy, PurgeCounts, StatusChange, StoreError, TenderFilter, TenderStore,
    UpsertOutcome,
};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

const SELECT_COLUMNS: &str = r#"
    SELECT id, tender_number, notice_order, notice_kind, renotice, title, body,
           agency_name, demand_agency_name, region,
           category_large, category_mid, category_detail, category_code, product_code,
           allocated_budget, vat, assigned_budget, total_budget,
           notice_at, bid_begin_at, bid_close_at, opening_at, rebid_opening_at,
           registered_at, changed_at, start_date, end_date, detail_url,
           status, status_source, favorite, unsuitable,
           attachments, raw_fields, metadata, collected_at
      FROM tenders
"#;

const ADVISORY_LOCK_SQL: &str = "SELECT pg_try_advisory_lock(hashtext($1)::bigint)";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(db) => {
                // 08xxx connection exceptions, 57Pxx operator intervention (shutdown).
                let systemic = db
                    .code()
                    .is_some_and(|code| code.starts_with("08") || code.starts_with("57P"));
                if systemic {
                    StoreError::Unavailable(err.to_string())
                } else {
                    StoreError::Rejected(err.to_string())
                }
            }
            sqlx::Error::Encode(_) | sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
                StoreError::Serialization(err.to_string())
            }
            _ => StoreError::Rejected(err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgTenderStore {
    pool: PgPool,
}

impl PgTenderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to tender database")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("applying tender migrations")?;
        info!("migrations applied");
        Ok(())
    }
}

fn tender_from_row(row: &PgRow) -> Result<Tender, StoreError> {
    let status: String = row.try_get("status")?;
    let status = TenderStatus::from_str(&status)
        .map_err(|err| StoreError::Serialization(err.to_string()))?;
    let status_source: String = row.try_get("status_source")?;
    let attachments: Json<Vec<AttachmentRef>> = row.try_get("attachments")?;
    let raw_fields: Json<std::collections::BTreeMap<String, String>> = row.try_get("raw_fields")?;
    let metadata: Json<JsonMap<String, JsonValue>> = row.try_get("metadata")?;

    Ok(Tender {
        id: row.try_get("id")?,
        tender_number: row.try_get("tender_number")?,
        notice_order: row.try_get("notice_order")?,
        notice_kind: row.try_get("notice_kind")?,
        renotice: row.try_get("renotice")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        agency_name: row.try_get("agency_name")?,
        demand_agency_name: row.try_get("demand_agency_name")?,
        region: row.try_get("region")?,
        classification: Classification {
            large: row.try_get("category_large")?,
            mid: row.try_get("category_mid")?,
            detail: row.try_get("category_detail")?,
            code: row.try_get("category_code")?,
        },
        product_code: row.try_get("product_code")?,
        budget: Budget {
            allocated: row.try_get("allocated_budget")?,
            vat: row.try_get("vat")?,
            assigned: row.try_get("assigned_budget")?,
            total: row.try_get("total_budget")?,
        },
        timeline: TenderTimeline {
            notice_at: row.try_get("notice_at")?,
            bid_begin_at: row.try_get("bid_begin_at")?,
            bid_close_at: row.try_get("bid_close_at")?,
            opening_at: row.try_get("opening_at")?,
            rebid_opening_at: row.try_get("rebid_opening_at")?,
            registered_at: row.try_get("registered_at")?,
            changed_at: row.try_get("changed_at")?,
        },
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        detail_url: row.try_get("detail_url")?,
        status,
        status_source: StatusSource::parse(&status_source),
        favorite: row.try_get("favorite")?,
        unsuitable: row.try_get("unsuitable")?,
        attachments: attachments.0,
        raw_fields: raw_fields.0,
        metadata: metadata.0,
        collected_at: row.try_get("collected_at")?,
    })
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &TenderFilter) {
    qb.push(" WHERE TRUE");
    if !filter.statuses.is_empty() {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_string()).collect();
        qb.push(" AND status = ANY(").push_bind(statuses).push(")");
    }
    if let Some(from) = filter.closes_on_or_after {
        qb.push(" AND bid_close_at::date >= ").push_bind(from);
    }
    if let Some(to) = filter.closes_on_or_before {
        qb.push(" AND bid_close_at::date <= ").push_bind(to);
    }
    if let Some(min) = filter.min_total_budget {
        qb.push(" AND total_budget >= ").push_bind(min);
    }
    if let Some(max) = filter.max_total_budget {
        qb.push(" AND total_budget <= ").push_bind(max);
    }
    if let Some(region) = &filter.region {
        qb.push(" AND region ILIKE ")
            .push_bind(format!("%{}%", escape_like(region.trim())))
            .push(" ESCAPE '\\'");
    }
    if let Some(prefix) = &filter.classification_prefix {
        qb.push(" AND category_code LIKE ")
            .push_bind(format!("{}%", escape_like(prefix.trim())))
            .push(" ESCAPE '\\'");
    }
    qb.push(" ORDER BY bid_close_at ASC NULLS LAST, tender_number ASC");
    if let Some(limit) = filter.limit {
        qb.push(" LIMIT ").push_bind(i64::from(limit));
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[async_trait]
impl TenderStore for PgTenderStore {
    async fn get(&self, tender_number: &str) -> Result<Option<Tender>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE tender_number = $1"))
            .bind(tender_number)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(tender_from_row).transpose()
    }

    async fn find(&self, filter: &TenderFilter) -> Result<Vec<Tender>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        push_filter(&mut qb, filter);
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(tender_from_row).collect()
    }

    async fn upsert(
        &self,
        tender: &Tender,
        policy: ManualStatusPolicy,
    ) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO tenders (
                id, tender_number, notice_order, notice_kind, renotice, title, body,
                agency_name, demand_agency_name, region,
                category_large, category_mid, category_detail, category_code, product_code,
                allocated_budget, vat, assigned_budget, total_budget,
                notice_at, bid_begin_at, bid_close_at, opening_at, rebid_opening_at,
                registered_at, changed_at, start_date, end_date, detail_url,
                status, status_source, favorite, unsuitable,
                attachments, raw_fields, metadata, collected_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                $8, $9, $10,
                $11, $12, $13, $14, $15,
                $16, $17, $18, $19,
                $20, $21, $22, $23, $24,
                $25, $26, $27, $28, $29,
                $30, $31, $32, $33,
                $34, $35, $36, $37
            )
            ON CONFLICT (tender_number) DO UPDATE SET
                notice_order = EXCLUDED.notice_order,
                notice_kind = EXCLUDED.notice_kind,
                renotice = EXCLUDED.renotice,
                title = EXCLUDED.title,
                body = EXCLUDED.body,
                agency_name = EXCLUDED.agency_name,
                demand_agency_name = EXCLUDED.demand_agency_name,
                region = EXCLUDED.region,
                category_large = EXCLUDED.category_large,
                category_mid = EXCLUDED.category_mid,
                category_detail = EXCLUDED.category_detail,
                category_code = EXCLUDED.category_code,
                product_code = EXCLUDED.product_code,
                allocated_budget = EXCLUDED.allocated_budget,
                vat = EXCLUDED.vat,
                assigned_budget = EXCLUDED.assigned_budget,
                total_budget = EXCLUDED.total_budget,
                notice_at = EXCLUDED.notice_at,
                bid_begin_at = EXCLUDED.bid_begin_at,
                bid_close_at = EXCLUDED.bid_close_at,
                opening_at = EXCLUDED.opening_at,
                rebid_opening_at = EXCLUDED.rebid_opening_at,
                registered_at = EXCLUDED.registered_at,
                changed_at = EXCLUDED.changed_at,
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date,
                detail_url = EXCLUDED.detail_url,
                status = CASE
                    WHEN $38 AND tenders.status_source = 'manual' THEN tenders.status
                    ELSE EXCLUDED.status
                END,
                status_source = CASE
                    WHEN $38 AND tenders.status_source = 'manual' THEN tenders.status_source
                    ELSE EXCLUDED.status_source
                END,
                attachments = EXCLUDED.attachments,
                raw_fields = EXCLUDED.raw_fields,
                metadata = EXCLUDED.metadata,
                collected_at = EXCLUDED.collected_at,
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(tender.id)
        .bind(&tender.tender_number)
        .bind(&tender.notice_order)
        .bind(&tender.notice_kind)
        .bind(tender.renotice)
        .bind(&tender.title)
        .bind(&tender.body)
        .bind(&tender.agency_name)
        .bind(&tender.demand_agency_name)
        .bind(&tender.region)
        .bind(&tender.classification.large)
        .bind(&tender.classification.mid)
        .bind(&tender.classification.detail)
        .bind(&tender.classification.code)
        .bind(&tender.product_code)
        .bind(tender.budget.allocated)
        .bind(tender.budget.vat)
        .bind(tender.budget.assigned)
        .bind(tender.budget.total)
        .bind(tender.timeline.notice_at)
        .bind(tender.timeline.bid_begin_at)
        .bind(tender.timeline.bid_close_at)
        .bind(tender.timeline.opening_at)
        .bind(tender.timeline.rebid_opening_at)
        .bind(tender.timeline.registered_at)
        .bind(tender.timeline.changed_at)
        .bind(tender.start_date)
        .bind(tender.end_date)
        .bind(&tender.detail_url)
        .bind(tender.status.as_str())
        .bind(tender.status_source.as_str())
        .bind(tender.favorite)
        .bind(tender.unsuitable)
        .bind(Json(&tender.attachments))
        .bind(Json(&tender.raw_fields))
        .bind(Json(&tender.metadata))
        .bind(tender.collected_at)
        .bind(policy == ManualStatusPolicy::Preserve)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        debug!(tender_number = %tender.tender_number, inserted, "tender upserted");
        Ok(if inserted {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn list_reconcilable(&self) -> Result<Vec<Tender>, StoreError> {
        let terminal: Vec<String> = TenderStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str().to_string())
            .collect();
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE NOT (status = ANY($1)) ORDER BY tender_number"
        ))
        .bind(terminal)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(tender_from_row).collect()
    }

    async fn apply_status_changes(&self, changes: &[StatusChange]) -> Result<u64, StoreError> {
        if changes.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut applied = 0;
        for change in changes {
            applied += sqlx::query(
                r#"
                UPDATE tenders
                   SET status = $2,
                       status_source = 'auto',
                       updated_at = NOW()
                 WHERE tender_number = $1
                   AND status = $3
                "#,
            )
            .bind(&change.tender_number)
            .bind(change.to.as_str())
            .bind(change.from.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(applied)
    }

    async fn delete_by_status(&self, status: TenderStatus) -> Result<PurgeCounts, StoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM tenders WHERE status = $1")
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenders")
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(PurgeCounts {
            deleted,
            remaining: remaining.max(0) as u64,
        })
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenders")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn set_operator_status(
        &self,
        tender_number: &str,
        status: TenderStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tenders
               SET status = $2,
                   status_source = 'manual',
                   updated_at = NOW()
             WHERE tender_number = $1
            "#,
        )
        .bind(tender_number)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn try_lock(&self, operation: Operation) -> Result<Option<RunLease>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar(ADVISORY_LOCK_SQL)
            .bind(operation.lock_key())
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            debug!(operation = %operation, "advisory lock held elsewhere");
            return Ok(None);
        }
        // Session-level lock: ending the session releases it.
        conn.close_on_drop();
        Ok(Some(RunLease::new(operation, conn)))
    }
}
