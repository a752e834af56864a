//! Reader for the flat XML envelopes upstream sends: the gateway error
//! envelope, and list responses when JSON output is not honoured. Items are
//! one level deep, so leaf elements are all that is needed.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map as JsonMap, Value as JsonValue};

#[derive(Debug, Default, PartialEq)]
pub(crate) struct XmlEnvelope {
    pub result_code: Option<String>,
    pub result_message: Option<String>,
    pub total_count: Option<u64>,
    pub items: Vec<JsonValue>,
}

fn item_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<item>(.*?)</item>").expect("static regex"))
}

fn leaf_element() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?s)<([A-Za-z_][A-Za-z0-9_]*)>((?:[^<]|<!\[CDATA\[.*?\]\]>)*)</([A-Za-z_][A-Za-z0-9_]*)>",
        )
        .expect("static regex")
    })
}

fn empty_element() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([A-Za-z_][A-Za-z0-9_]*)\s*/>").expect("static regex"))
}

pub(crate) fn looks_like_xml(body: &str) -> bool {
    body.trim_start_matches('\u{feff}').trim_start().starts_with('<')
}

pub(crate) fn read_envelope(body: &str) -> XmlEnvelope {
    let header_scope = item_block().replace_all(body, "");
    let header = leaf_map(&header_scope);

    let pick = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| header.get(*key).and_then(JsonValue::as_str))
            .map(str::to_string)
    };

    XmlEnvelope {
        result_code: pick(&["resultCode", "returnReasonCode"]),
        result_message: pick(&["resultMsg", "returnAuthMsg", "errMsg"]),
        total_count: pick(&["totalCount"]).and_then(|v| v.trim().parse().ok()),
        items: item_block()
            .captures_iter(body)
            .map(|cap| JsonValue::Object(leaf_map(&cap[1])))
            .collect(),
    }
}

fn leaf_map(fragment: &str) -> JsonMap<String, JsonValue> {
    let mut out = JsonMap::new();
    for cap in leaf_element().captures_iter(fragment) {
        if cap[1] != cap[3] {
            continue;
        }
        out.insert(cap[1].to_string(), JsonValue::String(text_content(&cap[2])));
    }
    for cap in empty_element().captures_iter(fragment) {
        out.entry(cap[1].to_string())
            .or_insert_with(|| JsonValue::String(String::new()));
    }
    out
}

fn text_content(raw: &str) -> String {
    if let Some(inner) = raw
        .trim()
        .strip_prefix("<![CDATA[")
        .and_then(|rest| rest.strip_suffix("]]>"))
    {
        return inner.to_string();
    }
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gateway_error_envelope() {
        let body = r#"<OpenAPI_ServiceResponse>
            <cmmMsgHeader>
                <errMsg>SERVICE ERROR</errMsg>
                <returnAuthMsg>SERVICE_KEY_IS_NOT_REGISTERED_ERROR</returnAuthMsg>
                <returnReasonCode>30</returnReasonCode>
            </cmmMsgHeader>
        </OpenAPI_ServiceResponse>"#;
        assert!(looks_like_xml(body));
        let env = read_envelope(body);
        assert_eq!(env.result_code.as_deref(), Some("30"));
        assert_eq!(
            env.result_message.as_deref(),
            Some("SERVICE_KEY_IS_NOT_REGISTERED_ERROR")
        );
        assert!(env.items.is_empty());
    }

    #[test]
    fn list_envelope_with_items() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
        <response>
          <header><resultCode>00</resultCode><resultMsg>정상</resultMsg></header>
          <body>
            <items>
              <item><bidNtceNo>R25BK00000001</bidNtceNo><bidNtceNm>청사 &amp; 부지 관리</bidNtceNm><VAT/></item>
              <item><bidNtceNo>R25BK00000002</bidNtceNo><bidNtceNm><![CDATA[<용역>]]></bidNtceNm></item>
            </items>
            <numOfRows>10</numOfRows><pageNo>1</pageNo><totalCount>2</totalCount>
          </body>
        </response>"#;
        let env = read_envelope(body);
        assert_eq!(env.result_code.as_deref(), Some("00"));
        assert_eq!(env.total_count, Some(2));
        assert_eq!(env.items.len(), 2);
        assert_eq!(
            env.items[0],
            json!({"bidNtceNo": "R25BK00000001", "bidNtceNm": "청사 & 부지 관리", "VAT": ""})
        );
        assert_eq!(env.items[1]["bidNtceNm"], json!("<용역>"));
    }

    #[test]
    fn json_is_not_xml() {
        assert!(!looks_like_xml(r#"{"response":{}}"#));
    }
}
