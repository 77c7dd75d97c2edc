//! Credential-less GA4 sample generator.

use async_trait::async_trait;
use bizmetrics_core::{
    Connector, ConnectorMode, DateRange, MetricRecord, MetricsError, RequestParams, Result,
};
use chrono::{Datelike, NaiveDate, Weekday};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::debug;

use crate::{AVAILABLE_DIMENSIONS, NAME};

/// Metrics the sample generator produces.
const SAMPLE_METRICS: &[&str] = &[
    "sessions",
    "activeUsers",
    "screenPageViews",
    "bounceRate",
    "averageSessionDuration",
    "newUsers",
    "engagedSessions",
    "engagementRate",
    "eventsPerSession",
];

/// Typical weekday session volume.
const BASE_SESSIONS: f64 = 1400.0;

/// Weekend traffic relative to weekdays.
const WEEKEND_FACTOR: f64 = 0.6;

/// Keeps sample days distinct from other connectors' generators.
const SEED_SALT: u64 = 0x6761_3400;

/// GA4-shaped synthetic traffic, used when no property is configured.
///
/// One record per day; weekends carry less traffic than weekdays. The
/// `metrics` param narrows the output to the named metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ga4SampleConnector;

impl Ga4SampleConnector {
    /// Create a new sample connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn record_for(day: NaiveDate) -> MetricRecord {
        let seed = SEED_SALT ^ u64::from(day.num_days_from_ce().unsigned_abs());
        let mut rng = StdRng::seed_from_u64(seed);

        let weekend = matches!(day.weekday(), Weekday::Sat | Weekday::Sun);
        let factor = if weekend { WEEKEND_FACTOR } else { 1.0 };

        let sessions = (BASE_SESSIONS * factor * rng.gen_range(0.8..1.2)).trunc();
        let active_users = (sessions * rng.gen_range(0.7..0.9)).trunc();
        let page_views = (sessions * rng.gen_range(2.5..4.5)).trunc();

        MetricRecord::new(NAME, day)
            .with_metric("sessions", sessions)
            .with_metric("activeUsers", active_users)
            .with_metric("screenPageViews", page_views)
            .with_metric("bounceRate", round_to(rng.gen_range(35.0..65.0), 2))
            .with_metric(
                "averageSessionDuration",
                round_to(rng.gen_range(90.0..240.0), 2),
            )
            .with_metric(
                "newUsers",
                (active_users * rng.gen_range(0.3..0.5)).trunc(),
            )
            .with_metric(
                "engagedSessions",
                (sessions * rng.gen_range(0.4..0.7)).trunc(),
            )
            .with_metric("engagementRate", round_to(rng.gen_range(0.4..0.7), 4))
            .with_metric("eventsPerSession", round_to(rng.gen_range(5.0..15.0), 2))
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

#[async_trait]
impl Connector for Ga4SampleConnector {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Google Analytics 4 sample data (no property configured)"
    }

    fn mode(&self) -> ConnectorMode {
        ConnectorMode::Demo
    }

    fn available_metrics(&self) -> &[&'static str] {
        SAMPLE_METRICS
    }

    fn available_dimensions(&self) -> &[&'static str] {
        AVAILABLE_DIMENSIONS
    }

    async fn validate_credentials(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, range: DateRange, params: &RequestParams) -> Result<Vec<MetricRecord>> {
        debug!(%range, "Generating GA4 sample records");
        let requested = params.list("metrics").filter(|m| !m.is_empty());

        if let Some(requested) = &requested {
            if !requested.iter().any(|m| SAMPLE_METRICS.contains(&m.as_str())) {
                return Err(MetricsError::data(
                    NAME,
                    format!("none of the requested metrics are available: {}", requested.join(",")),
                ));
            }
        }

        Ok(range
            .iter_days()
            .map(Self::record_for)
            .map(|mut record| {
                if let Some(requested) = &requested {
                    record.metrics.retain(|name, _| requested.contains(name));
                }
                record
            })
            .collect())
    }
}
