//! Client for the public procurement bid-notice listing service.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tender_core::normalize_value;
use tender_storage::{
    retry_with_backoff, FetchError, HttpFetcher, ResponseArchive, RetryDisposition, Retryable,
};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

use crate::xml;
use crate::{ApiPage, PageRequest, TenderSource};

pub const DEFAULT_BASE_URL: &str = "https://apis.data.go.kr/1230000/ad/BidPublicInfoService";

/// Upstream result codes grouped by what a caller can do about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCategory {
    Success,
    NoData,
    ServiceUnavailable,
    MalformedRequest,
    Unauthorized,
    RoutingNotFound,
    OutOfRange,
    QuotaExceeded,
}

impl ResultCategory {
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "00" | "0" | "INFO-000" => ResultCategory::Success,
            "03" | "INFO-200" => ResultCategory::NoData,
            "06" | "08" | "10" | "11" => ResultCategory::MalformedRequest,
            "07" => ResultCategory::OutOfRange,
            "12" => ResultCategory::RoutingNotFound,
            "20" | "21" | "30" | "31" | "32" => ResultCategory::Unauthorized,
            "22" => ResultCategory::QuotaExceeded,
            _ => ResultCategory::ServiceUnavailable,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ResultCategory::Success | ResultCategory::NoData)
    }

    pub fn disposition(self) -> RetryDisposition {
        match self {
            ResultCategory::ServiceUnavailable => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("upstream result {code} ({category:?}): {message}")]
    Upstream {
        code: String,
        message: String,
        category: ResultCategory,
    },
    #[error("undecodable upstream response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn upstream_code(&self) -> Option<&str> {
        match self {
            ApiError::Upstream { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl Retryable for ApiError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            ApiError::Transport(err) => err.disposition(),
            ApiError::Upstream { category, .. } => category.disposition(),
            ApiError::InvalidRequest(_) | ApiError::Decode(_) => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    /// Decoded service key; it is URL-encoded on the way out.
    pub service_key: String,
    pub max_page_size: u32,
    pub max_window_days: u32,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            service_key: String::new(),
            max_page_size: 999,
            max_window_days: 31,
        }
    }
}

pub struct NaraApiClient {
    http: Arc<HttpFetcher>,
    config: ApiClientConfig,
    archive: Option<ResponseArchive>,
}

impl NaraApiClient {
    pub fn new(http: Arc<HttpFetcher>, config: ApiClientConfig) -> Self {
        Self {
            http,
            config,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: ResponseArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn validate(&self, request: &PageRequest) -> Result<(), ApiError> {
        if request.page_no < 1 {
            return Err(ApiError::InvalidRequest("page number starts at 1".into()));
        }
        if request.page_size < 1 || request.page_size > self.config.max_page_size {
            return Err(ApiError::InvalidRequest(format!(
                "page size {} outside 1..={}",
                request.page_size, self.config.max_page_size
            )));
        }
        if request.window.begin > request.window.end {
            return Err(ApiError::InvalidRequest("date window is inverted".into()));
        }
        if request.window.days() > self.config.max_window_days {
            return Err(ApiError::InvalidRequest(format!(
                "date window of {} days exceeds the {}-day limit",
                request.window.days(),
                self.config.max_window_days
            )));
        }
        if request.inquiry_division.trim().is_empty() {
            return Err(ApiError::InvalidRequest("inquiry division is required".into()));
        }
        Ok(())
    }

    pub fn endpoint(&self, request: &PageRequest) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            request.operation.path()
        )
    }

    pub fn query(&self, request: &PageRequest) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("serviceKey", self.config.service_key.clone()),
            ("pageNo", request.page_no.to_string()),
            ("numOfRows", request.page_size.to_string()),
            ("inqryDiv", request.inquiry_division.trim().to_string()),
            ("inqryBgnDt", request.window.begin_param()),
            ("inqryEndDt", request.window.end_param()),
            ("type", "json".to_string()),
        ];
        if request.operation == crate::ListOperation::ServiceSearch {
            query.extend(request.filter.native_params());
        }
        query
    }

    async fn archive_page(&self, request: &PageRequest, body: &[u8]) {
        let Some(archive) = &self.archive else {
            return;
        };
        if let Err(err) = archive
            .store_page(Utc::now(), request.operation.path(), body)
            .await
        {
            warn!(error = %err, "failed to archive raw page");
        }
    }
}

#[async_trait]
impl TenderSource for NaraApiClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<ApiPage, ApiError> {
        self.validate(request)?;
        let url = self.endpoint(request);
        let query = self.query(request);
        let span = info_span!(
            "upstream_fetch",
            operation = request.operation.path(),
            page = request.page_no,
            begin = %request.window.begin,
            end = %request.window.end,
        );

        let (url, query) = (&url, &query);
        retry_with_backoff(self.http.backoff(), move |attempt| async move {
            if attempt > 0 {
                tracing::info!(attempt, "retrying page");
            }
            let resp = self.http.get_once(url, query).await.map_err(transport_error)?;
            let page = parse_page(&resp.body)?;
            self.archive_page(request, &resp.body).await;
            Ok(page)
        })
        .instrument(span)
        .await
    }
}

/// The gateway answers an unknown operation path with a bare 404.
fn transport_error(err: FetchError) -> ApiError {
    match err {
        FetchError::HttpStatus { status: 404, url } => ApiError::Upstream {
            code: "404".to_string(),
            message: format!("no such operation: {url}"),
            category: ResultCategory::RoutingNotFound,
        },
        other => ApiError::Transport(other),
    }
}

/// Decode one response body into a page, turning non-success result codes
/// into typed errors.
pub fn parse_page(body: &[u8]) -> Result<ApiPage, ApiError> {
    let text = String::from_utf8_lossy(body);
    if xml::looks_like_xml(&text) {
        let envelope = xml::read_envelope(&text);
        let code = envelope
            .result_code
            .ok_or_else(|| ApiError::Decode("xml response without a result code".into()))?;
        let message = envelope.result_message.unwrap_or_default();
        check_result(&code, &message)?;
        return Ok(ApiPage {
            result_code: code,
            result_message: message,
            total_count: envelope.total_count.unwrap_or(envelope.items.len() as u64),
            page_no: 0,
            items: envelope.items,
        });
    }

    let root: JsonValue = serde_json::from_slice(body)
        .map_err(|err| ApiError::Decode(format!("invalid json: {err}")))?;
    let response = root
        .get("response")
        .or_else(|| {
            root.as_object()?
                .values()
                .find(|v| v.get("header").is_some())
        })
        .ok_or_else(|| ApiError::Decode("missing response envelope".into()))?;

    let header = response
        .get("header")
        .ok_or_else(|| ApiError::Decode("missing response header".into()))?;
    let code = header
        .get("resultCode")
        .and_then(normalize_value)
        .ok_or_else(|| ApiError::Decode("missing result code".into()))?;
    let message = header
        .get("resultMsg")
        .and_then(normalize_value)
        .unwrap_or_default();
    check_result(&code, &message)?;

    let body = response.get("body").unwrap_or(&JsonValue::Null);
    let items = extract_items(body.get("items").unwrap_or(&JsonValue::Null));
    let total_count = body
        .get("totalCount")
        .and_then(normalize_value)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(items.len() as u64);
    let page_no = body
        .get("pageNo")
        .and_then(normalize_value)
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(0);

    Ok(ApiPage {
        result_code: code,
        result_message: message,
        total_count,
        page_no,
        items,
    })
}

fn check_result(code: &str, message: &str) -> Result<(), ApiError> {
    let category = ResultCategory::from_code(code);
    if category.is_success() {
        Ok(())
    } else {
        Err(ApiError::Upstream {
            code: code.trim().to_string(),
            message: message.trim().to_string(),
            category,
        })
    }
}

/// `items` shows up as a list, as `{ "item": list | object }`, or as `""`.
fn extract_items(items: &JsonValue) -> Vec<JsonValue> {
    match items {
        JsonValue::Array(list) => list.clone(),
        JsonValue::Object(map) => match map.get("item") {
            Some(JsonValue::Array(list)) => list.clone(),
            Some(single @ JsonValue::Object(_)) => vec![single.clone()],
            Some(_) | None => Vec::new(),
        },
        _ => Vec::new(),
    }
}
