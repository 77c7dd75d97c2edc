//! Connector trait for fetching metrics from a data source.
//!
//! A [`Connector`] knows how to get data for a date range and normalize it into
//! [`MetricRecord`]s. It never caches; deciding when to call it belongs to the
//! orchestrator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

use crate::{
    error::{MetricsError, Result},
    fingerprint::RequestParams,
    types::{DateRange, MetricRecord},
};

/// Whether a connector talks to a live upstream or generates synthetic data.
///
/// Decided once, when the connector is built from its configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorMode {
    /// Synthetic data, no credentials required.
    Demo,
    /// Real upstream API calls with configured credentials.
    Live,
}

impl fmt::Display for ConnectorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Demo => f.write_str("demo"),
            Self::Live => f.write_str("live"),
        }
    }
}

/// A source of normalized metric records.
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Stable identifier used for registration, fingerprints and record `source`
    /// (e.g., "meta-ads").
    fn name(&self) -> &str;

    /// Returns a description of this connector.
    fn description(&self) -> &str;

    /// Demo or live, fixed at construction.
    fn mode(&self) -> ConnectorMode;

    /// Metric names this connector can produce.
    fn available_metrics(&self) -> &[&'static str];

    /// Dimension names this connector can break metrics down by.
    fn available_dimensions(&self) -> &[&'static str] {
        &[]
    }

    /// How many days back from today the upstream accepts requests for.
    fn max_lookback_days(&self) -> Option<u64> {
        None
    }

    /// Metrics whose values may legitimately be negative (refunds, adjustments).
    fn signed_metrics(&self) -> &[&'static str] {
        &[]
    }

    /// Checks that the configured credentials are accepted upstream.
    async fn validate_credentials(&self) -> Result<()>;

    /// Fetches every record for `range`, accumulating paginated responses before
    /// returning.
    ///
    /// Records are ordered by date. Fails with [`MetricsError::SourceUnavailable`],
    /// [`MetricsError::SourceAuth`] or [`MetricsError::SourceData`].
    async fn fetch(&self, range: DateRange, params: &RequestParams) -> Result<Vec<MetricRecord>>;
}

/// Rejects `range` if it reaches further back than `max_days` before `today`.
///
/// Connectors call this before building a request so an invalid range never
/// reaches the upstream API.
pub fn check_lookback(
    connector: &str,
    range: DateRange,
    today: chrono::NaiveDate,
    max_days: u64,
) -> Result<()> {
    if range.exceeds_lookback(today, max_days) {
        return Err(MetricsError::SourceData {
            connector: connector.to_string(),
            reason: format!("range {range} exceeds the maximum lookback of {max_days} days"),
            range: Some(range),
        });
    }
    Ok(())
}
