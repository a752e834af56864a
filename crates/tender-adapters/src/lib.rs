//! Upstream tender API client and record mapping.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tender_core::Tender;

pub mod api;
pub mod mapper;
mod xml;

pub use api::{ApiClientConfig, ApiError, NaraApiClient, ResultCategory};
pub use mapper::{map_record, MappingError, FIELD_TABLE};

pub const CRATE_NAME: &str = "tender-adapters";

/// One upstream item, before normalization.
pub type RawRecord = JsonValue;

/// Inclusive calendar-day window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub begin: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(begin: NaiveDate, end: NaiveDate) -> Result<Self, ApiError> {
        if begin > end {
            return Err(ApiError::InvalidRequest(format!(
                "date window begins {begin} after it ends {end}"
            )));
        }
        Ok(Self { begin, end })
    }

    /// `days_back` before `today` through `days_forward` after it, clamped
    /// to the representable calendar.
    pub fn around(today: NaiveDate, days_back: u32, days_forward: u32) -> Self {
        Self {
            begin: today
                .checked_sub_signed(Duration::days(i64::from(days_back)))
                .unwrap_or(NaiveDate::MIN),
            end: today
                .checked_add_signed(Duration::days(i64::from(days_forward)))
                .unwrap_or(NaiveDate::MAX),
        }
    }

    pub fn parse(begin: &str, end: &str) -> Result<Self, ApiError> {
        let parse = |s: &str| {
            NaiveDate::parse_from_str(s.trim(), "%Y%m%d")
                .or_else(|_| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d"))
                .map_err(|_| ApiError::InvalidRequest(format!("`{s}` is not a YYYYMMDD date")))
        };
        Self::new(parse(begin)?, parse(end)?)
    }

    pub fn days(&self) -> u32 {
        ((self.end - self.begin).num_days() + 1) as u32
    }

    pub fn begin_param(&self) -> String {
        self.begin.format("%Y%m%d").to_string()
    }

    pub fn end_param(&self) -> String {
        self.end.format("%Y%m%d").to_string()
    }

    /// Consecutive sub-windows no longer than `max_days`.
    pub fn split(&self, max_days: u32) -> Vec<DateWindow> {
        let step = i64::from(max_days.max(1));
        let mut out = Vec::new();
        let mut begin = self.begin;
        if begin > self.end {
            return out;
        }
        loop {
            let end = begin
                .checked_add_signed(Duration::days(step - 1))
                .map_or(self.end, |end| end.min(self.end));
            out.push(DateWindow { begin, end });
            match end.succ_opt() {
                Some(next) if next <= self.end => begin = next,
                _ => break,
            }
        }
        out
    }
}

/// Named upstream listing operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListOperation {
    ByDateRange,
    ServiceSearch,
}

impl ListOperation {
    pub const fn path(self) -> &'static str {
        match self {
            ListOperation::ByDateRange => "getBidPblancListInfoServc",
            ListOperation::ServiceSearch => "getBidPblancListInfoServcPPSSrch",
        }
    }
}

/// Narrowing criteria for filtered collection. Sent upstream where the
/// search operation supports them and re-checked on every mapped record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvancedFilter {
    pub region: Option<String>,
    pub industry_code_prefix: Option<String>,
    pub product_code: Option<String>,
}

impl AdvancedFilter {
    pub fn is_empty(&self) -> bool {
        self.region.is_none() && self.industry_code_prefix.is_none() && self.product_code.is_none()
    }

    pub fn native_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(region) = &self.region {
            params.push(("prtcptLmtRgnNm", region.clone()));
        }
        if let Some(product) = &self.product_code {
            params.push(("dtilPrdctClsfcNo", product.clone()));
        }
        params
    }

    pub fn matches(&self, tender: &Tender) -> bool {
        if let Some(region) = &self.region {
            let wanted = region.trim().to_lowercase();
            let found = tender
                .region
                .as_deref()
                .is_some_and(|r| r.to_lowercase().contains(&wanted));
            if !found {
                return false;
            }
        }

        if let Some(prefix) = &self.industry_code_prefix {
            let prefix = prefix.trim();
            let candidates = [
                tender.classification.code.as_deref(),
                tender.raw_fields.get("indstrytyCd").map(String::as_str),
            ];
            if !candidates
                .into_iter()
                .flatten()
                .any(|code| code.starts_with(prefix))
            {
                return false;
            }
        }

        if let Some(product) = &self.product_code {
            if tender.product_code.as_deref().map(str::trim) != Some(product.trim()) {
                return false;
            }
        }

        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub operation: ListOperation,
    pub window: DateWindow,
    pub inquiry_division: String,
    pub page_no: u32,
    pub page_size: u32,
    #[serde(default)]
    pub filter: AdvancedFilter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiPage {
    pub result_code: String,
    pub result_message: String,
    pub total_count: u64,
    pub page_no: u32,
    pub items: Vec<RawRecord>,
}

/// Anything that can serve pages of raw tender records.
#[async_trait]
pub trait TenderSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<ApiPage, ApiError>;
}
