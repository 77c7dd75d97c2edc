#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/bizmetrics/bizmetrics/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Demo connector.
//!
//! # Usage
//!
//! ```rust,ignore
//! use bizmetrics_demo::DemoConnector;
//! use bizmetrics_core::{Connector, DateRange, RequestParams};
//! use chrono::NaiveDate;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let demo = DemoConnector::new();
//!     let range = DateRange::new(
//!         NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
//!         NaiveDate::from_ymd_opt(2024, 12, 3).unwrap(),
//!     )?;
//!     let records = demo.fetch(range, &RequestParams::new()).await?;
//!     assert_eq!(records.len(), 3);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use bizmetrics_core::{
    Connector, ConnectorConfig, ConnectorMode, DateRange, MetricRecord, RequestParams, Result,
};
use chrono::{Datelike, NaiveDate};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::sync::Arc;
use tracing::debug;

/// Connector name used for registration and record attribution.
pub const NAME: &str = "demo";

/// Metrics produced for every day.
const METRICS: &[&str] = &[
    "sessions",
    "page_views",
    "bounce_rate",
    "avg_session_duration",
    "conversions",
    "revenue",
];

/// Synthetic business metrics, one record per day.
///
/// Never fails and needs no configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct DemoConnector;

impl DemoConnector {
    /// Create a new demo connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the record for one day.
    fn record_for(day: NaiveDate) -> MetricRecord {
        let mut rng = StdRng::seed_from_u64(u64::from(day.num_days_from_ce().unsigned_abs()));

        MetricRecord::new(NAME, day)
            .with_metric("sessions", f64::from(rng.gen_range(1000u32..=5000)))
            .with_metric("page_views", f64::from(rng.gen_range(3000u32..=15000)))
            .with_metric("bounce_rate", round2(rng.gen_range(30.0..70.0)))
            .with_metric("avg_session_duration", round2(rng.gen_range(60.0..300.0)))
            .with_metric("conversions", f64::from(rng.gen_range(10u32..=100)))
            .with_metric("revenue", round2(rng.gen_range(500.0..5000.0)))
    }
}

/// Builds a demo connector; the configuration is ignored.
pub fn connector(_config: &ConnectorConfig) -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(DemoConnector::new()))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[async_trait]
impl Connector for DemoConnector {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Demo connector with sample business metrics data"
    }

    fn mode(&self) -> ConnectorMode {
        ConnectorMode::Demo
    }

    fn available_metrics(&self) -> &[&'static str] {
        METRICS
    }

    async fn validate_credentials(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, range: DateRange, _params: &RequestParams) -> Result<Vec<MetricRecord>> {
        debug!(%range, "Generating demo records");
        Ok(range.iter_days().map(Self::record_for).collect())
    }
}
