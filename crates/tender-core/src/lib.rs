//! Core domain model for public tender ingestion.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

pub mod normalize;
pub mod status;

pub use normalize::{normalize_text, normalize_value, parse_flag, parse_money, parse_timestamp};
pub use status::derive_status;

pub const CRATE_NAME: &str = "tender-core";

/// Lifecycle state of a tender, recomputed from its timeline on every pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenderStatus {
    Pending,
    Active,
    Closed,
    Opened,
    Completed,
    Cancelled,
}

impl TenderStatus {
    pub const ALL: [TenderStatus; 6] = [
        TenderStatus::Pending,
        TenderStatus::Active,
        TenderStatus::Closed,
        TenderStatus::Opened,
        TenderStatus::Completed,
        TenderStatus::Cancelled,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            TenderStatus::Pending => "pending",
            TenderStatus::Active => "active",
            TenderStatus::Closed => "closed",
            TenderStatus::Opened => "opened",
            TenderStatus::Completed => "completed",
            TenderStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal tenders are left alone by reconciliation; closed ones are
    /// eventually removed by the retention sweep.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            TenderStatus::Closed | TenderStatus::Completed | TenderStatus::Cancelled
        )
    }
}

impl fmt::Display for TenderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown tender status `{}`", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for TenderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TenderStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Who last decided the persisted status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    #[default]
    Auto,
    Manual,
}

impl StatusSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            StatusSource::Auto => "auto",
            StatusSource::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("manual") {
            StatusSource::Manual
        } else {
            StatusSource::Auto
        }
    }
}

/// Budget figures in whole currency units.
///
/// `total` is never taken from upstream: it is derived from `allocated + vat`,
/// or from the assigned budget minus VAT when the pre-tax estimate is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Budget {
    pub allocated: Option<i64>,
    pub vat: Option<i64>,
    pub assigned: Option<i64>,
    pub total: Option<i64>,
}

impl Budget {
    pub fn from_components(allocated: Option<i64>, vat: Option<i64>, assigned: Option<i64>) -> Self {
        let allocated = match (allocated, vat, assigned) {
            (Some(a), _, _) => Some(a),
            (None, Some(v), Some(s)) => s.checked_sub(v),
            _ => None,
        };
        let total = match (allocated, vat) {
            (Some(a), Some(v)) => a.checked_add(v),
            _ => None,
        };
        Self {
            allocated,
            vat,
            assigned,
            total,
        }
    }
}

/// Fine-grained lifecycle timestamps, upstream wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TenderTimeline {
    pub notice_at: Option<NaiveDateTime>,
    pub bid_begin_at: Option<NaiveDateTime>,
    pub bid_close_at: Option<NaiveDateTime>,
    pub opening_at: Option<NaiveDateTime>,
    pub rebid_opening_at: Option<NaiveDateTime>,
    pub registered_at: Option<NaiveDateTime>,
    pub changed_at: Option<NaiveDateTime>,
}

impl TenderTimeline {
    pub fn start_date(&self) -> Option<NaiveDate> {
        self.bid_begin_at.or(self.notice_at).map(|ts| ts.date())
    }

    pub fn end_date(&self) -> Option<NaiveDate> {
        self.bid_close_at.or(self.opening_at).map(|ts| ts.date())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Classification {
    pub large: Option<String>,
    pub mid: Option<String>,
    pub detail: Option<String>,
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub slot: u8,
    pub url: String,
    pub file_name: String,
}

/// Canonical persisted tender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tender {
    pub id: Uuid,
    pub tender_number: String,
    pub notice_order: Option<String>,
    pub notice_kind: Option<String>,
    pub renotice: Option<bool>,
    pub title: String,
    pub body: Option<String>,
    pub agency_name: Option<String>,
    pub demand_agency_name: Option<String>,
    pub region: Option<String>,
    pub classification: Classification,
    pub product_code: Option<String>,
    pub budget: Budget,
    pub timeline: TenderTimeline,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub detail_url: Option<String>,
    pub status: TenderStatus,
    pub status_source: StatusSource,
    pub favorite: bool,
    pub unsuitable: bool,
    pub attachments: Vec<AttachmentRef>,
    pub raw_fields: BTreeMap<String, String>,
    pub metadata: JsonMap<String, JsonValue>,
    pub collected_at: DateTime<Utc>,
}

impl Tender {
    pub fn id_for(tender_number: &str) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("tender:{}", tender_number.trim()).as_bytes(),
        )
    }

    /// Empty record for `tender_number`; the mapper fills everything else.
    pub fn new(tender_number: impl Into<String>, collected_at: DateTime<Utc>) -> Self {
        let tender_number = tender_number.into();
        Self {
            id: Self::id_for(&tender_number),
            tender_number,
            notice_order: None,
            notice_kind: None,
            renotice: None,
            title: String::new(),
            body: None,
            agency_name: None,
            demand_agency_name: None,
            region: None,
            classification: Classification::default(),
            product_code: None,
            budget: Budget::default(),
            timeline: TenderTimeline::default(),
            start_date: None,
            end_date: None,
            detail_url: None,
            status: TenderStatus::Active,
            status_source: StatusSource::Auto,
            favorite: false,
            unsuitable: false,
            attachments: Vec::new(),
            raw_fields: BTreeMap::new(),
            metadata: JsonMap::new(),
            collected_at,
        }
    }

    pub fn is_cancellation_notice(&self) -> bool {
        self.notice_kind
            .as_deref()
            .is_some_and(|kind| kind.contains("취소") || kind.to_ascii_lowercase().contains("cancel"))
    }

    /// Status the timeline implies for `today`.
    pub fn derived_status(&self, today: NaiveDate) -> TenderStatus {
        if self.is_cancellation_notice() {
            return TenderStatus::Cancelled;
        }
        derive_status(&self.timeline, today)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_is_allocated_plus_vat() {
        let budget = Budget::from_components(Some(1_000_000), Some(100_000), Some(1_250_000));
        assert_eq!(budget.total, Some(1_100_000));
        assert_eq!(budget.allocated, Some(1_000_000));
        assert_eq!(budget.assigned, Some(1_250_000));
    }

    #[test]
    fn assigned_budget_only_counts_after_vat_is_subtracted() {
        let budget = Budget::from_components(None, Some(100_000), Some(1_100_000));
        assert_eq!(budget.allocated, Some(1_000_000));
        assert_eq!(budget.total, Some(1_100_000));

        let without_vat = Budget::from_components(None, None, Some(1_100_000));
        assert_eq!(without_vat.allocated, None);
        assert_eq!(without_vat.total, None);
    }

    #[test]
    fn status_round_trips_through_its_string_form() {
        for status in TenderStatus::ALL {
            assert_eq!(status.as_str().parse::<TenderStatus>(), Ok(status));
        }
        assert!("archived".parse::<TenderStatus>().is_err());
    }

    #[test]
    fn id_is_stable_for_a_tender_number() {
        assert_eq!(Tender::id_for("R25BK00000001"), Tender::id_for(" R25BK00000001 "));
        assert_ne!(Tender::id_for("R25BK00000001"), Tender::id_for("R25BK00000002"));
    }

    #[test]
    fn cancellation_notice_overrides_timeline() {
        let today = NaiveDate::from_ymd_opt(2025, 9, 2).unwrap();
        let mut tender = Tender::new("R25BK00000001", Utc::now());
        assert_eq!(tender.derived_status(today), TenderStatus::Active);
        tender.notice_kind = Some("취소공고".to_string());
        assert_eq!(tender.derived_status(today), TenderStatus::Cancelled);
    }
}
