//! Typed payloads and request URLs for the ads platform's Graph-style API.

use adpulse_core::DateRange;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// API error codes that signal throttling rather than a bad request.
pub const RATE_LIMIT_CODES: &[i64] = &[4, 17, 32, 613, 80004];

pub const ENTITY_PAGE_SIZE: u32 = 100;
pub const INSIGHTS_PAGE_SIZE: u32 = 500;

const AD_FIELDS: &str =
    "id,name,status,effective_status,campaign{name},adset{name},creative{thumbnail_url,video_id}";
const INSIGHT_FIELDS: &str = "ad_id,ad_name,spend,impressions,clicks,ctr,cpm,cpc,frequency,\
actions,action_values,purchase_roas,cost_per_action_type";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GraphPage<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub paging: Option<Paging>,
}

impl<T> GraphPage<T> {
    pub fn next_url(&self) -> Option<&str> {
        self.paging
            .as_ref()
            .and_then(|p| p.next.as_deref())
            .filter(|next| !next.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GraphErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub code: i64,
    #[serde(default)]
    pub error_subcode: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("api error {code}: {message}")]
    Api {
        code: i64,
        subcode: Option<i64>,
        message: String,
    },
    #[error("rate limited, gave up after {retries} retries: {message}")]
    RateLimitExhausted { retries: usize, message: String },
    #[error("http status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("cancelled")]
    Cancelled,
}

impl GraphError {
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Api { code, .. } => RATE_LIMIT_CODES.contains(code),
            Self::Http { status, .. } => *status == StatusCode::TOO_MANY_REQUESTS.as_u16(),
            _ => false,
        }
    }
}

impl From<adpulse_storage::FetchError> for GraphError {
    fn from(err: adpulse_storage::FetchError) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

fn snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    text.chars().take(200).collect()
}

/// Decode a response body into a page, an API error, or a decode failure.
///
/// An `error` object wins over the HTTP status; a non-success status
/// without one is reported as an HTTP error.
pub fn decode_page<T: DeserializeOwned>(
    status: StatusCode,
    body: &[u8],
) -> Result<GraphPage<T>, GraphError> {
    let value: JsonValue = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) if !status.is_success() => {
            return Err(GraphError::Http {
                status: status.as_u16(),
                body: snippet(body),
            })
        }
        Err(err) => return Err(GraphError::Decode(err.to_string())),
    };

    if let Some(error) = value.get("error") {
        let error: GraphErrorBody = serde_json::from_value(error.clone())
            .map_err(|err| GraphError::Decode(format!("error envelope: {err}")))?;
        return Err(GraphError::Api {
            code: error.code,
            subcode: error.error_subcode,
            message: error.message,
        });
    }

    if !status.is_success() {
        return Err(GraphError::Http {
            status: status.as_u16(),
            body: snippet(body),
        });
    }

    serde_json::from_value(value).map_err(|err| GraphError::Decode(err.to_string()))
}

/// Numeric field that may arrive as a JSON number or a numeric string.
/// Unparseable strings become zero.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LooseNumber(pub f64);

impl<'de> Deserialize<'de> for LooseNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) if n.is_finite() => LooseNumber(n),
            Raw::Number(_) => LooseNumber(0.0),
            Raw::Text(s) => LooseNumber(
                s.trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|n| n.is_finite())
                    .unwrap_or(0.0),
            ),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NamedRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct CreativeRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub video_id: Option<String>,
}

/// One ad from the entity-listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AdRow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub effective_status: Option<String>,
    #[serde(default)]
    pub campaign: Option<NamedRef>,
    #[serde(default)]
    pub adset: Option<NamedRef>,
    #[serde(default)]
    pub creative: Option<CreativeRef>,
}

impl AdRow {
    /// Effective status when present, since it reflects parent pauses.
    pub fn display_status(&self) -> Option<String> {
        self.effective_status.clone().or_else(|| self.status.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActionValue {
    #[serde(default)]
    pub action_type: Option<String>,
    #[serde(default)]
    pub value: Option<LooseNumber>,
}

/// One row from the insights endpoint, aggregate or per day.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct InsightRow {
    #[serde(default)]
    pub ad_id: Option<String>,
    #[serde(default)]
    pub ad_name: Option<String>,
    #[serde(default)]
    pub date_start: Option<String>,
    #[serde(default)]
    pub date_stop: Option<String>,
    #[serde(default)]
    pub spend: Option<LooseNumber>,
    #[serde(default)]
    pub impressions: Option<LooseNumber>,
    #[serde(default)]
    pub clicks: Option<LooseNumber>,
    #[serde(default)]
    pub ctr: Option<LooseNumber>,
    #[serde(default)]
    pub cpm: Option<LooseNumber>,
    #[serde(default)]
    pub cpc: Option<LooseNumber>,
    #[serde(default)]
    pub frequency: Option<LooseNumber>,
    #[serde(default)]
    pub actions: Option<Vec<ActionValue>>,
    #[serde(default)]
    pub action_values: Option<Vec<ActionValue>>,
    #[serde(default)]
    pub purchase_roas: Option<Vec<ActionValue>>,
    #[serde(default)]
    pub cost_per_action_type: Option<Vec<ActionValue>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsightsWindow {
    /// One row per ad over the ad's whole lifetime.
    Lifetime,
    /// One row per ad per day inside the range.
    Daily(DateRange),
}

/// Builds first-page URLs; later pages come from `paging.next`.
#[derive(Debug, Clone)]
pub struct GraphEndpoints {
    base: String,
}

impl GraphEndpoints {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn account_path(&self, platform_account_id: &str, edge: &str) -> String {
        let id = platform_account_id
            .trim()
            .trim_start_matches("act_");
        format!("{}/act_{id}/{edge}", self.base)
    }

    pub fn ads_url(&self, platform_account_id: &str) -> Result<String, GraphError> {
        let limit = ENTITY_PAGE_SIZE.to_string();
        Url::parse_with_params(
            &self.account_path(platform_account_id, "ads"),
            &[("fields", AD_FIELDS), ("limit", limit.as_str())],
        )
        .map(String::from)
        .map_err(|err| GraphError::Transport(format!("invalid api url: {err}")))
    }

    pub fn insights_url(
        &self,
        platform_account_id: &str,
        window: InsightsWindow,
    ) -> Result<String, GraphError> {
        let limit = INSIGHTS_PAGE_SIZE.to_string();
        let mut params = vec![
            ("level", "ad".to_string()),
            ("fields", INSIGHT_FIELDS.to_string()),
            ("limit", limit),
        ];
        match window {
            InsightsWindow::Lifetime => params.push(("date_preset", "maximum".to_string())),
            InsightsWindow::Daily(range) => {
                params.push((
                    "time_range",
                    serde_json::json!({
                        "since": range.since.format("%Y-%m-%d").to_string(),
                        "until": range.until.format("%Y-%m-%d").to_string(),
                    })
                    .to_string(),
                ));
                params.push(("time_increment", "1".to_string()));
            }
        }
        Url::parse_with_params(&self.account_path(platform_account_id, "insights"), &params)
            .map(String::from)
            .map_err(|err| GraphError::Transport(format!("invalid api url: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn decodes_data_page_with_next_cursor() {
        let body = br#"{"data":[{"id":"1","name":"A"}],"paging":{"cursors":{"after":"x"},"next":"https://api.test/next"}}"#;
        let page: GraphPage<AdRow> = decode_page(StatusCode::OK, body).unwrap();
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.next_url(), Some("https://api.test/next"));
    }

    #[test]
    fn error_envelope_is_typed_and_rate_limit_detected() {
        let body = br#"{"error":{"message":"User request limit reached","type":"OAuthException","code":17,"error_subcode":2446079}}"#;
        let err = decode_page::<AdRow>(StatusCode::BAD_REQUEST, body).unwrap_err();
        assert_eq!(
            err,
            GraphError::Api {
                code: 17,
                subcode: Some(2446079),
                message: "User request limit reached".into()
            }
        );
        assert!(err.is_rate_limited());

        let invalid = br#"{"error":{"message":"Invalid parameter","code":100}}"#;
        assert!(!decode_page::<AdRow>(StatusCode::BAD_REQUEST, invalid)
            .unwrap_err()
            .is_rate_limited());
    }

    #[test]
    fn body_without_data_is_a_decode_error() {
        let err = decode_page::<AdRow>(StatusCode::OK, br#"{"unexpected":true}"#).unwrap_err();
        assert!(matches!(err, GraphError::Decode(_)));
        let err = decode_page::<AdRow>(StatusCode::BAD_GATEWAY, b"<html>oops</html>").unwrap_err();
        assert!(matches!(err, GraphError::Http { status: 502, .. }));
    }

    #[test]
    fn action_entry_without_type_keeps_the_page() {
        let body = br#"{"data":[
            {"ad_id":"1","spend":"10","actions":[{"value":"3"}]},
            {"ad_id":"2","spend":"5"}
        ]}"#;
        let page: GraphPage<InsightRow> = decode_page(StatusCode::OK, body).unwrap();
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.data[1].ad_id.as_deref(), Some("2"));
        let actions = page.data[0].actions.as_deref().unwrap();
        assert_eq!(actions[0].action_type, None);
    }

    #[test]
    fn loose_numbers_accept_strings_and_zero_garbage() {
        let row: InsightRow = serde_json::from_str(
            r#"{"spend":"12.50","impressions":1000,"clicks":"n/a","ctr":null}"#,
        )
        .unwrap();
        assert_eq!(row.spend, Some(LooseNumber(12.5)));
        assert_eq!(row.impressions, Some(LooseNumber(1000.0)));
        assert_eq!(row.clicks, Some(LooseNumber(0.0)));
        assert_eq!(row.ctr, None);
    }

    #[test]
    fn urls_normalize_account_prefix_and_encode_time_range() {
        let endpoints = GraphEndpoints::new("https://graph.test/v19.0/");
        let ads = endpoints.ads_url("act_123").unwrap();
        assert!(ads.starts_with("https://graph.test/v19.0/act_123/ads?"));
        assert!(ads.contains("limit=100"));

        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
        )
        .unwrap();
        let daily = endpoints.insights_url("123", InsightsWindow::Daily(range)).unwrap();
        let url = Url::parse(&daily).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("time_increment".into(), "1".into())));
        assert!(pairs.contains(&(
            "time_range".into(),
            r#"{"since":"2026-03-01","until":"2026-03-14"}"#.into()
        )));
        assert!(pairs.contains(&("level".into(), "ad".into())));
    }
}
