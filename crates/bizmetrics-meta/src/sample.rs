//! Credential-less Meta Ads sample generator.

use async_trait::async_trait;
use bizmetrics_core::{
    Connector, ConnectorMode, DateRange, MetricRecord, RequestParams, Result,
};
use chrono::{Datelike, NaiveDate};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::debug;

use crate::insights::round2;
use crate::{AVAILABLE_DIMENSIONS, NAME};

/// Metrics the sample generator produces.
const SAMPLE_METRICS: &[&str] = &[
    "impressions",
    "reach",
    "clicks",
    "ctr",
    "cpc",
    "cpm",
    "spend",
    "conversions",
    "cost_per_conversion",
    "frequency",
];

/// Keeps sample days distinct from other connectors' generators.
const SEED_SALT: u64 = 0x6d65_7461_0000;

/// A fixed sample campaign.
#[derive(Debug, Clone, Copy)]
struct Campaign {
    id: &'static str,
    name: &'static str,
    objective: &'static str,
}

const CAMPAIGNS: &[Campaign] = &[
    Campaign {
        id: "camp_001",
        name: "Brand Awareness Q4",
        objective: "BRAND_AWARENESS",
    },
    Campaign {
        id: "camp_002",
        name: "Lead Generation",
        objective: "LEAD_GENERATION",
    },
    Campaign {
        id: "camp_003",
        name: "Website Traffic",
        objective: "LINK_CLICKS",
    },
    Campaign {
        id: "camp_004",
        name: "Conversions - Purchase",
        objective: "CONVERSIONS",
    },
];

/// Meta-shaped synthetic campaign performance, used when no ad account is
/// configured.
///
/// Four campaigns per day, each with performance typical of its objective.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetaSampleConnector;

impl MetaSampleConnector {
    /// Create a new sample connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn record_for(day: NaiveDate, index: usize, campaign: &Campaign) -> MetricRecord {
        let seed = SEED_SALT
            ^ (u64::from(day.num_days_from_ce().unsigned_abs()) << 3)
            ^ index as u64;
        let mut rng = StdRng::seed_from_u64(seed);

        let (impressions, cpm, ctr) = match campaign.objective {
            "BRAND_AWARENESS" => (
                rng.gen_range(50_000u32..=150_000),
                rng.gen_range(3.0..8.0),
                rng.gen_range(0.5..1.5),
            ),
            "LEAD_GENERATION" => (
                rng.gen_range(10_000u32..=50_000),
                rng.gen_range(8.0..15.0),
                rng.gen_range(1.0..3.0),
            ),
            "CONVERSIONS" => (
                rng.gen_range(5_000u32..=30_000),
                rng.gen_range(12.0..25.0),
                rng.gen_range(1.5..4.0),
            ),
            _ => (
                rng.gen_range(20_000u32..=80_000),
                rng.gen_range(5.0..12.0),
                rng.gen_range(1.0..2.5),
            ),
        };
        let impressions = f64::from(impressions);

        let clicks = (impressions * ctr / 100.0).trunc();
        let spend = round2(impressions / 1000.0 * cpm);
        let conversions = (clicks * rng.gen_range(0.01..0.08)).trunc();

        MetricRecord::new(NAME, day)
            .with_dimension("campaign_id", campaign.id)
            .with_dimension("campaign_name", campaign.name)
            .with_dimension("objective", campaign.objective)
            .with_metric("impressions", impressions)
            .with_metric("reach", (impressions * rng.gen_range(0.6..0.9)).trunc())
            .with_metric("clicks", clicks)
            .with_metric("ctr", round2(ctr))
            .with_metric("cpc", round2(spend / clicks.max(1.0)))
            .with_metric("cpm", round2(cpm))
            .with_metric("spend", spend)
            .with_metric("conversions", conversions)
            .with_metric("cost_per_conversion", round2(spend / conversions.max(1.0)))
            .with_metric("frequency", round2(rng.gen_range(1.1..2.5)))
    }
}

#[async_trait]
impl Connector for MetaSampleConnector {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Meta Ads sample data (no ad account configured)"
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

    async fn fetch(&self, range: DateRange, _params: &RequestParams) -> Result<Vec<MetricRecord>> {
        debug!(%range, "Generating Meta Ads sample records");
        Ok(range
            .iter_days()
            .flat_map(|day| {
                CAMPAIGNS
                    .iter()
                    .enumerate()
                    .map(move |(index, campaign)| Self::record_for(day, index, campaign))
            })
            .collect())
    }
}
