//! Core data types for normalized business metrics.
//!
//! - [`DateRange`] - Inclusive calendar-day range of a fetch request
//! - [`MetricRecord`] - One normalized observation produced by a connector

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{MetricsError, Result};

/// Inclusive range of calendar days.
///
/// Construction through [`DateRange::new`] guarantees `start <= end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDateRange")]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

#[derive(Deserialize)]
struct RawDateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<RawDateRange> for DateRange {
    type Error = MetricsError;

    fn try_from(raw: RawDateRange) -> Result<Self> {
        Self::new(raw.start, raw.end)
    }
}

impl DateRange {
    /// Creates a range, failing with [`MetricsError::InvalidRange`] if `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(MetricsError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// First day of the range.
    #[must_use]
    pub const fn start(&self) -> NaiveDate {
        self.start
    }

    /// Last day of the range.
    #[must_use]
    pub const fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of days covered, counting both ends.
    #[must_use]
    pub fn days(&self) -> u64 {
        // start <= end, so the difference is never negative
        (self.end - self.start).num_days().unsigned_abs() + 1
    }

    /// Returns true if `date` falls inside the range.
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Iterates over every day of the range in order.
    pub fn iter_days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    /// Returns true if the range reaches further back than `max_days` before `today`.
    #[must_use]
    pub fn exceeds_lookback(&self, today: NaiveDate, max_days: u64) -> bool {
        match today.checked_sub_days(Days::new(max_days)) {
            Some(earliest) => self.start < earliest,
            None => false,
        }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// One normalized metric observation.
///
/// Dimensions and metrics are kept in sorted maps so that two records with the
/// same content compare and serialize identically regardless of how they were
/// built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Name of the connector that produced the record.
    pub source: String,
    /// Calendar day of the observation.
    pub date: NaiveDate,
    /// Categorical breakdown (campaign name, channel, ...).
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    /// Numeric values (impressions, clicks, cost, sessions, ...).
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl MetricRecord {
    /// Creates a record with no dimensions or metrics.
    #[must_use]
    pub fn new(source: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            source: source.into(),
            date,
            dimensions: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// Adds a dimension value.
    #[must_use]
    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    /// Adds a metric value.
    #[must_use]
    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    /// Returns a metric value by name.
    #[must_use]
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }

    /// Verifies the record belongs to `connector`, lies inside `range`, and carries
    /// only finite values. Values must be non-negative except for the metrics
    /// named in `signed`.
    pub fn check(&self, connector: &str, range: &DateRange, signed: &[&str]) -> Result<()> {
        if self.source != connector {
            return Err(MetricsError::data(
                connector,
                format!("record attributed to {}", self.source),
            ));
        }
        if !range.contains(self.date) {
            return Err(MetricsError::SourceData {
                connector: connector.to_string(),
                reason: format!("record dated {} outside requested range", self.date),
                range: Some(*range),
            });
        }
        for (name, value) in &self.metrics {
            if !value.is_finite() || (*value < 0.0 && !signed.contains(&name.as_str())) {
                return Err(MetricsError::data(
                    connector,
                    format!("metric {name} on {} has invalid value {value}", self.date),
                ));
            }
        }
        Ok(())
    }
}
