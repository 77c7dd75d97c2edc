//! Graph API insights request and response shapes.

use bizmetrics_core::{DateRange, MetricRecord, MetricsError, Page, RequestParams, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::NAME;

/// Aggregation level used when the caller names none.
pub(crate) const DEFAULT_LEVEL: &str = "campaign";

/// Rows requested per page unless configured otherwise.
pub(crate) const DEFAULT_PAGE_SIZE: u32 = 500;

/// Numeric insight fields requested by default.
pub(crate) const METRIC_FIELDS: &[&str] = &[
    "impressions",
    "reach",
    "clicks",
    "ctr",
    "cpc",
    "cpm",
    "spend",
    "frequency",
];

/// Action types counted as conversions.
const CONVERSION_ACTIONS: &[&str] = &[
    "purchase",
    "lead",
    "complete_registration",
    "offsite_conversion.fb_pixel_purchase",
    "offsite_conversion.fb_pixel_lead",
];

/// Graph error codes signalling throttling or a temporary outage.
const TRANSIENT_ERROR_CODES: &[i64] = &[1, 2, 4, 17, 32, 341, 613, 80004];

/// Graph error code for an invalid or expired access token.
const INVALID_TOKEN_CODE: i64 = 190;

/// Dimension fields reported at each aggregation level.
pub(crate) fn dimension_fields(level: &str) -> Option<&'static [&'static str]> {
    match level {
        "account" => Some(&["account_id", "account_name"]),
        "campaign" => Some(&["campaign_id", "campaign_name", "objective"]),
        "adset" => Some(&[
            "campaign_id",
            "campaign_name",
            "objective",
            "adset_id",
            "adset_name",
        ]),
        "ad" => Some(&[
            "campaign_id",
            "campaign_name",
            "objective",
            "adset_id",
            "adset_name",
            "ad_id",
            "ad_name",
        ]),
        _ => None,
    }
}

/// Query of a first-page insights call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InsightsQuery {
    pub(crate) level: String,
    pub(crate) dimensions: &'static [&'static str],
    pub(crate) metrics: Vec<String>,
    pub(crate) since: NaiveDate,
    pub(crate) until: NaiveDate,
    pub(crate) limit: u32,
}

impl InsightsQuery {
    /// Builds the query for `range`, rejecting unknown levels.
    ///
    /// `level` selects the aggregation level and `metrics` (comma list)
    /// narrows the numeric fields.
    pub(crate) fn build(range: DateRange, params: &RequestParams, page_size: u32) -> Result<Self> {
        let level = params.get("level").unwrap_or(DEFAULT_LEVEL).to_lowercase();
        let dimensions = dimension_fields(&level).ok_or_else(|| {
            MetricsError::data(NAME, format!("unsupported insights level {level:?}"))
        })?;

        let metrics = params
            .list("metrics")
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| METRIC_FIELDS.iter().map(ToString::to_string).collect());

        Ok(Self {
            level,
            dimensions,
            metrics,
            since: range.start(),
            until: range.end(),
            limit: page_size.max(1),
        })
    }

    /// Query string pairs, excluding the access token.
    pub(crate) fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut fields: Vec<&str> = self.dimensions.to_vec();
        fields.extend(self.metrics.iter().map(String::as_str));
        fields.push("actions");

        vec![
            ("level", self.level.clone()),
            (
                "time_range",
                serde_json::json!({
                    "since": self.since.to_string(),
                    "until": self.until.to_string(),
                })
                .to_string(),
            ),
            ("time_increment", "1".to_string()),
            ("fields", fields.join(",")),
            ("limit", self.limit.to_string()),
        ]
    }
}

/// One page of the insights edge.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct InsightsResponse {
    pub(crate) data: Vec<Map<String, Value>>,
    pub(crate) paging: Option<Paging>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Paging {
    pub(crate) next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
}

/// Classifies a failed Graph call from its status and body.
pub(crate) fn classify_error(status: u16, body: &str) -> MetricsError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope { error }) => {
            let reason = format!("Graph error {}: {}", error.code, error.message);
            if error.code == INVALID_TOKEN_CODE {
                MetricsError::auth(NAME, reason)
            } else if TRANSIENT_ERROR_CODES.contains(&error.code) {
                MetricsError::unavailable(NAME, reason)
            } else {
                MetricsError::from_http_status(NAME, status, &reason)
            }
        }
        Err(_) => {
            let snippet: String = body.chars().take(200).collect();
            MetricsError::from_http_status(NAME, status, &snippet)
        }
    }
}

impl InsightsResponse {
    /// Normalizes the page; the cursor is the `paging.next` URL.
    pub(crate) fn into_page(self, dimensions: &[&str]) -> Result<Page<MetricRecord, String>> {
        let records = self
            .data
            .iter()
            .map(|row| normalize_row(row, dimensions))
            .collect::<Result<Vec<_>>>()?;

        let next = self
            .paging
            .and_then(|p| p.next)
            .filter(|n| !n.is_empty() && !records.is_empty());
        Ok(match next {
            Some(next) => Page::more(records, next),
            None => Page::last(records),
        })
    }
}

/// Maps one insights row into a record.
pub(crate) fn normalize_row(row: &Map<String, Value>, dimensions: &[&str]) -> Result<MetricRecord> {
    let raw_date = row
        .get("date_start")
        .and_then(Value::as_str)
        .ok_or_else(|| MetricsError::data(NAME, "insights row without date_start"))?;
    let date = NaiveDate::parse_from_str(raw_date, "%Y-%m-%d")
        .map_err(|e| MetricsError::data(NAME, format!("bad date {raw_date:?}: {e}")))?;

    let mut record = MetricRecord::new(NAME, date);
    for field in dimensions {
        match row.get(*field) {
            Some(Value::String(s)) => record = record.with_dimension(*field, s.clone()),
            Some(Value::Number(n)) => record = record.with_dimension(*field, n.to_string()),
            _ => {}
        }
    }

    for (field, value) in row {
        if field == "actions" || field.starts_with("date_") || dimensions.contains(&field.as_str())
        {
            continue;
        }
        if let Some(parsed) = number(field, value)? {
            record = record.with_metric(field.clone(), parsed);
        }
    }

    if let Some(Value::Array(actions)) = row.get("actions") {
        let mut conversions = 0.0;
        for action in actions {
            let kind = action.get("action_type").and_then(Value::as_str);
            if kind.is_some_and(|k| CONVERSION_ACTIONS.contains(&k)) {
                conversions += number("actions.value", action.get("value").unwrap_or(&Value::Null))?
                    .unwrap_or_default();
            }
        }
        record = record.with_metric("conversions", conversions);
        if let Some(spend) = record.metric("spend").filter(|_| conversions > 0.0) {
            record = record.with_metric("cost_per_conversion", round2(spend / conversions));
        }
    }

    Ok(record)
}

/// Parses a Graph numeric field; the API encodes most numbers as strings.
fn number(field: &str, value: &Value) -> Result<Option<f64>> {
    match value {
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => s.parse().map(Some).map_err(|_| {
            MetricsError::data(NAME, format!("field {field} has non-numeric value {s:?}"))
        }),
        // Nulls and nested breakdowns are not part of the record model
        _ => Ok(None),
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
