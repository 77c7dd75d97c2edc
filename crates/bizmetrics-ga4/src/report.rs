//! `runReport` request and response shapes.

use bizmetrics_core::{DateRange, MetricRecord, MetricsError, Page, RequestParams, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::NAME;

/// Dimension carrying the row's calendar day.
pub(crate) const DATE_DIMENSION: &str = "date";

/// Metrics requested when the caller names none.
pub(crate) const DEFAULT_METRICS: &[&str] = &[
    "sessions",
    "activeUsers",
    "screenPageViews",
    "bounceRate",
    "averageSessionDuration",
];

/// Revenue metrics are reported net of refunds and go negative on refund-heavy days.
pub(crate) const SIGNED_METRICS: &[&str] = &["totalRevenue", "purchaseRevenue"];

/// Rows requested per page unless configured otherwise.
pub(crate) const DEFAULT_PAGE_SIZE: u32 = 10_000;

/// Body of a `properties/{id}:runReport` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReportRequest {
    pub(crate) date_ranges: Vec<WireDateRange>,
    pub(crate) dimensions: Vec<Named>,
    pub(crate) metrics: Vec<Named>,
    pub(crate) limit: u32,
    pub(crate) offset: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireDateRange {
    pub(crate) start_date: String,
    pub(crate) end_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Named {
    pub(crate) name: String,
}

impl Named {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl ReportRequest {
    /// Builds the first-page request for `range`.
    ///
    /// `metrics` and `dimensions` params are comma lists; the `date` dimension is
    /// always requested first.
    pub(crate) fn build(range: DateRange, params: &RequestParams, page_size: u32) -> Self {
        let metrics = params
            .list("metrics")
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_METRICS.iter().map(ToString::to_string).collect());

        let mut dimensions = vec![Named::new(DATE_DIMENSION)];
        dimensions.extend(
            params
                .list("dimensions")
                .unwrap_or_default()
                .iter()
                .filter(|d| d.as_str() != DATE_DIMENSION)
                .map(|d| Named::new(d)),
        );

        Self {
            date_ranges: vec![WireDateRange {
                start_date: range.start().to_string(),
                end_date: range.end().to_string(),
            }],
            dimensions,
            metrics: metrics.iter().map(|m| Named::new(m)).collect(),
            limit: page_size.max(1),
            offset: 0,
        }
    }

    /// The same request starting at `offset`.
    pub(crate) fn at_offset(&self, offset: u64) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }
}

/// Parsed `runReport` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct ReportResponse {
    pub(crate) dimension_headers: Vec<Named>,
    pub(crate) metric_headers: Vec<Named>,
    pub(crate) rows: Vec<ReportRow>,
    pub(crate) row_count: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct ReportRow {
    pub(crate) dimension_values: Vec<Value>,
    pub(crate) metric_values: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Value {
    pub(crate) value: String,
}

/// Error envelope returned alongside non-success statuses.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

/// Extracts a readable message from an error response body.
pub(crate) fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) if envelope.error.status.is_empty() => envelope.error.message,
        Ok(envelope) => format!("{}: {}", envelope.error.status, envelope.error.message),
        Err(_) => body.chars().take(200).collect(),
    }
}

impl ReportResponse {
    /// Normalizes the page and works out the offset of the next one.
    pub(crate) fn into_page(self, offset: u64) -> Result<Page<MetricRecord, u64>> {
        let received = self.rows.len() as u64;
        let row_count = self.row_count;
        let records = self.normalize()?;

        let next = offset + received;
        Ok(if received > 0 && next < row_count {
            Page::more(records, next)
        } else {
            Page::last(records)
        })
    }

    /// Maps rows into records.
    pub(crate) fn normalize(&self) -> Result<Vec<MetricRecord>> {
        if self.rows.is_empty() {
            return Ok(Vec::new());
        }
        let date_index = self
            .dimension_headers
            .iter()
            .position(|h| h.name == DATE_DIMENSION)
            .ok_or_else(|| MetricsError::data(NAME, "response has no date dimension"))?;

        self.rows
            .iter()
            .map(|row| self.normalize_row(row, date_index))
            .collect()
    }

    fn normalize_row(&self, row: &ReportRow, date_index: usize) -> Result<MetricRecord> {
        if row.dimension_values.len() != self.dimension_headers.len()
            || row.metric_values.len() != self.metric_headers.len()
        {
            return Err(MetricsError::data(
                NAME,
                "row width does not match response headers",
            ));
        }

        let raw_date = &row.dimension_values[date_index].value;
        let date = NaiveDate::parse_from_str(raw_date, "%Y%m%d")
            .map_err(|e| MetricsError::data(NAME, format!("bad date {raw_date:?}: {e}")))?;

        let mut record = MetricRecord::new(NAME, date);
        for (header, value) in self.dimension_headers.iter().zip(&row.dimension_values) {
            if header.name != DATE_DIMENSION {
                record = record.with_dimension(header.name.clone(), value.value.clone());
            }
        }
        for (header, value) in self.metric_headers.iter().zip(&row.metric_values) {
            let parsed: f64 = value.value.parse().map_err(|_| {
                MetricsError::data(
                    NAME,
                    format!("metric {} has non-numeric value {:?}", header.name, value.value),
                )
            })?;
            record = record.with_metric(header.name.clone(), parsed);
        }
        Ok(record)
    }
}
