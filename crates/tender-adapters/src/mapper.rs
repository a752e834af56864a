//! Raw upstream record to [`Tender`].
//!
//! First-class columns are driven by [`FIELD_TABLE`]; every other field is
//! kept in the raw-field bag (scalars) or the metadata map (structured
//! values), so nothing upstream sends is silently dropped.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use tender_core::normalize::structured_value;
use tender_core::{
    normalize_text, normalize_value, parse_flag, parse_money, parse_timestamp, AttachmentRef,
    Budget, Tender,
};
use thiserror::Error;
use tracing::debug;

pub const TENDER_NUMBER_KEY: &str = "bidNtceNo";
pub const ATTACHMENT_SLOTS: u8 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("record has no tender number (`{TENDER_NUMBER_KEY}`)")]
    MissingTenderNumber,
    #[error("record is not an object but {0}")]
    NotAnObject(&'static str),
}

/// Target attribute of a mapped upstream field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    TenderNumber,
    NoticeOrder,
    NoticeKind,
    Renotice,
    Title,
    AgencyName,
    DemandAgencyName,
    Region,
    ClassLarge,
    ClassMid,
    ClassDetail,
    ClassCode,
    ProductCode,
    AllocatedBudget,
    Vat,
    AssignedBudget,
    NoticeAt,
    BidBeginAt,
    BidCloseAt,
    OpeningAt,
    RebidOpeningAt,
    RegisteredAt,
    ChangedAt,
    DetailUrl,
    AttachmentUrl(u8),
    AttachmentName(u8),
}

/// How the normalized string is coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Money,
    Timestamp,
    Flag,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub key: &'static str,
    pub column: Column,
    pub kind: FieldKind,
}

const fn field(key: &'static str, column: Column, kind: FieldKind) -> FieldSpec {
    FieldSpec { key, column, kind }
}

use Column as C;
use FieldKind as K;

pub static FIELD_TABLE: &[FieldSpec] = &[
    field("bidNtceNo", C::TenderNumber, K::Text),
    field("bidNtceOrd", C::NoticeOrder, K::Text),
    field("ntceKindNm", C::NoticeKind, K::Text),
    field("reNtceYn", C::Renotice, K::Flag),
    field("bidNtceNm", C::Title, K::Text),
    field("ntceInsttNm", C::AgencyName, K::Text),
    field("dminsttNm", C::DemandAgencyName, K::Text),
    field("prtcptLmtRgnNm", C::Region, K::Text),
    field("pubPrcrmntLrgClsfcNm", C::ClassLarge, K::Text),
    field("pubPrcrmntMidClsfcNm", C::ClassMid, K::Text),
    field("pubPrcrmntClsfcNm", C::ClassDetail, K::Text),
    field("pubPrcrmntClsfcNo", C::ClassCode, K::Text),
    field("dtilPrdctClsfcNo", C::ProductCode, K::Text),
    field("presmptPrce", C::AllocatedBudget, K::Money),
    field("VAT", C::Vat, K::Money),
    field("asignBdgtAmt", C::AssignedBudget, K::Money),
    field("bidNtceDt", C::NoticeAt, K::Timestamp),
    field("bidBeginDt", C::BidBeginAt, K::Timestamp),
    field("bidClseDt", C::BidCloseAt, K::Timestamp),
    field("opengDt", C::OpeningAt, K::Timestamp),
    field("rbidOpengDt", C::RebidOpeningAt, K::Timestamp),
    field("rgstDt", C::RegisteredAt, K::Timestamp),
    field("chgDt", C::ChangedAt, K::Timestamp),
    field("bidNtceDtlUrl", C::DetailUrl, K::Text),
    field("ntceSpecDocUrl1", C::AttachmentUrl(1), K::Text),
    field("ntceSpecDocUrl2", C::AttachmentUrl(2), K::Text),
    field("ntceSpecDocUrl3", C::AttachmentUrl(3), K::Text),
    field("ntceSpecDocUrl4", C::AttachmentUrl(4), K::Text),
    field("ntceSpecDocUrl5", C::AttachmentUrl(5), K::Text),
    field("ntceSpecDocUrl6", C::AttachmentUrl(6), K::Text),
    field("ntceSpecDocUrl7", C::AttachmentUrl(7), K::Text),
    field("ntceSpecDocUrl8", C::AttachmentUrl(8), K::Text),
    field("ntceSpecDocUrl9", C::AttachmentUrl(9), K::Text),
    field("ntceSpecDocUrl10", C::AttachmentUrl(10), K::Text),
    field("ntceSpecFileNm1", C::AttachmentName(1), K::Text),
    field("ntceSpecFileNm2", C::AttachmentName(2), K::Text),
    field("ntceSpecFileNm3", C::AttachmentName(3), K::Text),
    field("ntceSpecFileNm4", C::AttachmentName(4), K::Text),
    field("ntceSpecFileNm5", C::AttachmentName(5), K::Text),
    field("ntceSpecFileNm6", C::AttachmentName(6), K::Text),
    field("ntceSpecFileNm7", C::AttachmentName(7), K::Text),
    field("ntceSpecFileNm8", C::AttachmentName(8), K::Text),
    field("ntceSpecFileNm9", C::AttachmentName(9), K::Text),
    field("ntceSpecFileNm10", C::AttachmentName(10), K::Text),
];

/// Raw-bag fields that make up the free-text body, with their labels.
pub static BODY_FIELDS: &[(&str, &str)] = &[
    ("srvceDivNm", "용역구분"),
    ("bidMethdNm", "입찰방식"),
    ("cntrctCnclsMthdNm", "계약체결방법"),
    ("sucsfbidMthdNm", "낙찰방법"),
    ("opengPlce", "개찰장소"),
    ("ntceInsttOfclNm", "담당자"),
    ("ntceInsttOfclTelNo", "연락처"),
    ("purchsObjPrdctList", "구매대상물품"),
];

fn field_index() -> &'static HashMap<&'static str, &'static FieldSpec> {
    static INDEX: OnceLock<HashMap<&'static str, &'static FieldSpec>> = OnceLock::new();
    INDEX.get_or_init(|| FIELD_TABLE.iter().map(|spec| (spec.key, spec)).collect())
}

pub fn field_spec(key: &str) -> Option<&'static FieldSpec> {
    field_index().get(key).copied()
}

enum Coerced {
    Text(String),
    Money(i64),
    Timestamp(NaiveDateTime),
    Flag(bool),
}

fn coerce(kind: FieldKind, text: &str) -> Option<Coerced> {
    match kind {
        FieldKind::Text => Some(Coerced::Text(text.to_string())),
        FieldKind::Money => parse_money(text).map(Coerced::Money),
        FieldKind::Timestamp => parse_timestamp(text).map(Coerced::Timestamp),
        FieldKind::Flag => parse_flag(text).map(Coerced::Flag),
    }
}

#[derive(Default)]
struct Staging {
    allocated: Option<i64>,
    vat: Option<i64>,
    assigned: Option<i64>,
    attachment_urls: [Option<String>; ATTACHMENT_SLOTS as usize],
    attachment_names: [Option<String>; ATTACHMENT_SLOTS as usize],
}

fn assign(tender: &mut Tender, staging: &mut Staging, column: Column, value: Coerced) {
    use Coerced::*;
    match (column, value) {
        (C::TenderNumber, _) => {}
        (C::NoticeOrder, Text(v)) => tender.notice_order = Some(v),
        (C::NoticeKind, Text(v)) => tender.notice_kind = Some(v),
        (C::Renotice, Flag(v)) => tender.renotice = Some(v),
        (C::Title, Text(v)) => tender.title = v,
        (C::AgencyName, Text(v)) => tender.agency_name = Some(v),
        (C::DemandAgencyName, Text(v)) => tender.demand_agency_name = Some(v),
        (C::Region, Text(v)) => tender.region = Some(v),
        (C::ClassLarge, Text(v)) => tender.classification.large = Some(v),
        (C::ClassMid, Text(v)) => tender.classification.mid = Some(v),
        (C::ClassDetail, Text(v)) => tender.classification.detail = Some(v),
        (C::ClassCode, Text(v)) => tender.classification.code = Some(v),
        (C::ProductCode, Text(v)) => tender.product_code = Some(v),
        (C::AllocatedBudget, Money(v)) => staging.allocated = Some(v),
        (C::Vat, Money(v)) => staging.vat = Some(v),
        (C::AssignedBudget, Money(v)) => staging.assigned = Some(v),
        (C::NoticeAt, Timestamp(v)) => tender.timeline.notice_at = Some(v),
        (C::BidBeginAt, Timestamp(v)) => tender.timeline.bid_begin_at = Some(v),
        (C::BidCloseAt, Timestamp(v)) => tender.timeline.bid_close_at = Some(v),
        (C::OpeningAt, Timestamp(v)) => tender.timeline.opening_at = Some(v),
        (C::RebidOpeningAt, Timestamp(v)) => tender.timeline.rebid_opening_at = Some(v),
        (C::RegisteredAt, Timestamp(v)) => tender.timeline.registered_at = Some(v),
        (C::ChangedAt, Timestamp(v)) => tender.timeline.changed_at = Some(v),
        (C::DetailUrl, Text(v)) => tender.detail_url = Some(v),
        (C::AttachmentUrl(slot), Text(v)) => {
            if let Some(cell) = staging.attachment_urls.get_mut(usize::from(slot) - 1) {
                *cell = Some(v);
            }
        }
        (C::AttachmentName(slot), Text(v)) => {
            if let Some(cell) = staging.attachment_names.get_mut(usize::from(slot) - 1) {
                *cell = Some(v);
            }
        }
        (column, _) => debug!(?column, "field kind does not match column"),
    }
}

/// Map one raw record. `status` is left at its default; the collector
/// derives it against the current day.
pub fn map_record(raw: &JsonValue, collected_at: DateTime<Utc>) -> Result<Tender, MappingError> {
    let record = raw.as_object().ok_or(MappingError::NotAnObject(json_kind(raw)))?;
    let tender_number = record
        .get(TENDER_NUMBER_KEY)
        .and_then(normalize_text)
        .ok_or(MappingError::MissingTenderNumber)?;

    let mut tender = Tender::new(tender_number, collected_at);
    let mut staging = Staging::default();

    for (key, value) in record {
        if let Some(spec) = field_spec(key) {
            let Some(text) = normalize_text(value) else {
                continue;
            };
            match coerce(spec.kind, &text) {
                Some(coerced) => assign(&mut tender, &mut staging, spec.column, coerced),
                None => {
                    debug!(key = %key, value = %text, "unparseable value kept in raw fields");
                    tender.raw_fields.insert(key.clone(), text);
                }
            }
            continue;
        }

        if let Some(structured) = structured_value(value) {
            tender.metadata.insert(key.clone(), structured);
        } else if let Some(text) = normalize_value(value) {
            tender.raw_fields.insert(key.clone(), text);
        }
    }

    tender.budget = Budget::from_components(staging.allocated, staging.vat, staging.assigned);
    tender.attachments = staging
        .attachment_urls
        .into_iter()
        .zip(staging.attachment_names)
        .enumerate()
        .filter_map(|(idx, pair)| match pair {
            (Some(url), Some(file_name)) => Some(AttachmentRef {
                slot: idx as u8 + 1,
                url,
                file_name,
            }),
            _ => None,
        })
        .collect();
    tender.start_date = tender.timeline.start_date();
    tender.end_date = tender.timeline.end_date();
    tender.body = compose_body(&tender);

    Ok(tender)
}

fn compose_body(tender: &Tender) -> Option<String> {
    let lines: Vec<String> = BODY_FIELDS
        .iter()
        .filter_map(|(key, label)| {
            tender
                .raw_fields
                .get(*key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(|v| format!("{label}: {v}"))
        })
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::collections::HashSet;
    use tender_core::TenderStatus;

    fn sample() -> JsonValue {
        json!({
            "bidNtceNo": ["R25BK00000001"],
            "bidNtceOrd": "000",
            "ntceKindNm": "등록공고",
            "reNtceYn": "N",
            "bidNtceNm": "청사 시설관리 용역",
            "ntceInsttNm": "조달청 서울지방조달청",
            "dminsttNm": "서울특별시 종로구",
            "prtcptLmtRgnNm": "서울특별시",
            "pubPrcrmntLrgClsfcNm": "일반용역",
            "pubPrcrmntMidClsfcNm": "시설관리",
            "pubPrcrmntClsfcNm": "건물관리",
            "pubPrcrmntClsfcNo": "72101501",
            "presmptPrce": "1000000",
            "VAT": "100000",
            "asignBdgtAmt": "1250000",
            "bidNtceDt": "2025-09-01 09:00:00",
            "bidBeginDt": "2025-09-01 10:00:00",
            "bidClseDt": "2025-09-10 18:00:00",
            "opengDt": "2025-09-11 11:00:00",
            "rbidOpengDt": "",
            "bidNtceDtlUrl": "https:\\/\\/www.g2b.go.kr\\/link?no=R25BK00000001",
            "ntceSpecDocUrl1": "[\"https:\\/\\/files.g2b.go.kr\\/1.hwp\"]",
            "ntceSpecFileNm1": "과업지시서.hwp",
            "ntceSpecDocUrl2": "https://files.g2b.go.kr/2.pdf",
            "ntceSpecFileNm2": "",
            "ntceSpecDocUrl3": [],
            "ntceSpecFileNm3": "orphan-name.pdf",
            "ntceSpecDocUrl4": "https://files.g2b.go.kr/4.zip",
            "ntceSpecFileNm4": ["도면.zip"],
            "bidMethdNm": "전자입찰",
            "cntrctCnclsMthdNm": "제한경쟁",
            "ntceInsttOfclNm": "홍길동",
            "cmmnSpldmdCorpRgnLmtYn": "N",
            "prtcptPsblRgnNm": ["서울", "경기"],
            "rgnLmtInfo": "{\"codes\":[\"11\",\"41\"]}",
            "untyNtceNo": null
        })
    }

    #[test]
    fn table_keys_are_unique_and_cover_every_attachment_slot() {
        let keys: HashSet<_> = FIELD_TABLE.iter().map(|s| s.key).collect();
        assert_eq!(keys.len(), FIELD_TABLE.len());
        for slot in 1..=ATTACHMENT_SLOTS {
            assert!(FIELD_TABLE.iter().any(|s| s.column == Column::AttachmentUrl(slot)));
            assert!(FIELD_TABLE.iter().any(|s| s.column == Column::AttachmentName(slot)));
        }
        assert_eq!(field_spec(TENDER_NUMBER_KEY).unwrap().column, Column::TenderNumber);
    }

    #[test]
    fn maps_first_class_columns() {
        let tender = map_record(&sample(), Utc::now()).unwrap();

        assert_eq!(tender.tender_number, "R25BK00000001");
        assert_eq!(tender.id, Tender::id_for("R25BK00000001"));
        assert_eq!(tender.title, "청사 시설관리 용역");
        assert_eq!(tender.notice_order.as_deref(), Some("000"));
        assert_eq!(tender.renotice, Some(false));
        assert_eq!(tender.agency_name.as_deref(), Some("조달청 서울지방조달청"));
        assert_eq!(tender.region.as_deref(), Some("서울특별시"));
        assert_eq!(tender.classification.large.as_deref(), Some("일반용역"));
        assert_eq!(tender.classification.mid.as_deref(), Some("시설관리"));
        assert_eq!(tender.classification.detail.as_deref(), Some("건물관리"));
        assert_eq!(tender.classification.code.as_deref(), Some("72101501"));
        assert_eq!(
            tender.detail_url.as_deref(),
            Some("https://www.g2b.go.kr/link?no=R25BK00000001")
        );
        assert_eq!(tender.start_date, NaiveDate::from_ymd_opt(2025, 9, 1));
        assert_eq!(tender.end_date, NaiveDate::from_ymd_opt(2025, 9, 10));
        assert_eq!(tender.timeline.rebid_opening_at, None);
        assert_eq!(tender.status, TenderStatus::Active);
    }

    #[test]
    fn total_budget_is_recomputed_not_copied() {
        let tender = map_record(&sample(), Utc::now()).unwrap();
        assert_eq!(tender.budget.allocated, Some(1_000_000));
        assert_eq!(tender.budget.vat, Some(100_000));
        assert_eq!(tender.budget.assigned, Some(1_250_000));
        assert_eq!(tender.budget.total, Some(1_100_000));
    }

    #[test]
    fn attachments_skip_half_empty_pairs() {
        let tender = map_record(&sample(), Utc::now()).unwrap();
        assert_eq!(
            tender.attachments,
            vec![
                AttachmentRef {
                    slot: 1,
                    url: "https://files.g2b.go.kr/1.hwp".into(),
                    file_name: "과업지시서.hwp".into(),
                },
                AttachmentRef {
                    slot: 4,
                    url: "https://files.g2b.go.kr/4.zip".into(),
                    file_name: "도면.zip".into(),
                },
            ]
        );
    }

    #[test]
    fn unmapped_fields_land_in_raw_bag_or_metadata() {
        let tender = map_record(&sample(), Utc::now()).unwrap();
        assert_eq!(
            tender.raw_fields.get("cmmnSpldmdCorpRgnLmtYn").map(String::as_str),
            Some("N")
        );
        assert_eq!(tender.metadata.get("prtcptPsblRgnNm"), Some(&json!(["서울", "경기"])));
        assert_eq!(tender.metadata.get("rgnLmtInfo"), Some(&json!({"codes": ["11", "41"]})));
        assert!(!tender.raw_fields.contains_key("untyNtceNo"));
        assert!(!tender.raw_fields.contains_key("bidNtceNm"));
        assert!(!tender.raw_fields.contains_key(TENDER_NUMBER_KEY));
    }

    #[test]
    fn body_is_composed_from_descriptive_fields() {
        let tender = map_record(&sample(), Utc::now()).unwrap();
        let body = tender.body.unwrap();
        assert!(body.contains("입찰방식: 전자입찰"));
        assert!(body.contains("계약체결방법: 제한경쟁"));
        assert!(body.contains("담당자: 홍길동"));
    }

    #[test]
    fn unparseable_typed_values_are_not_lost() {
        let mut raw = sample();
        raw["bidClseDt"] = json!("추후공고");
        let tender = map_record(&raw, Utc::now()).unwrap();
        assert_eq!(tender.timeline.bid_close_at, None);
        assert_eq!(tender.raw_fields.get("bidClseDt").map(String::as_str), Some("추후공고"));
    }

    #[test]
    fn missing_or_blank_tender_number_is_rejected() {
        let mut raw = sample();
        raw.as_object_mut().unwrap().remove("bidNtceNo");
        assert_eq!(map_record(&raw, Utc::now()), Err(MappingError::MissingTenderNumber));

        raw["bidNtceNo"] = json!([]);
        assert_eq!(map_record(&raw, Utc::now()), Err(MappingError::MissingTenderNumber));

        raw["bidNtceNo"] = json!("   ");
        assert_eq!(map_record(&raw, Utc::now()), Err(MappingError::MissingTenderNumber));
    }

    #[test]
    fn non_objects_are_rejected() {
        assert_eq!(
            map_record(&json!("R25BK00000001"), Utc::now()),
            Err(MappingError::NotAnObject("a string"))
        );
    }

    #[test]
    fn tender_number_matches_normalized_raw_value() {
        for raw_number in [json!("R25BK1"), json!(["R25BK2"]), json!("[\"R25BK3\"]"), json!(20250001)] {
            let expected = normalize_text(&raw_number).unwrap();
            let tender = map_record(&json!({ "bidNtceNo": raw_number }), Utc::now()).unwrap();
            assert_eq!(tender.tender_number, expected);
        }
    }
}
