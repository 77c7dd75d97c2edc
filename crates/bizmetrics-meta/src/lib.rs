#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/bizmetrics/bizmetrics/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Meta (Facebook/Instagram) Marketing API connector.
//!
//! # Usage
//!
//! ```rust,ignore
//! use bizmetrics_core::{ConnectorConfig, DateRange, RequestParams};
//! use chrono::NaiveDate;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConnectorConfig::new()
//!         .with_credential("access_token", "EAAB...")
//!         .with_credential("ad_account_id", "act_123456789");
//!     let meta = bizmetrics_meta::connector(&config)?;
//!
//!     let range = DateRange::new(
//!         NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
//!         NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
//!     )?;
//!     let params = RequestParams::new().with("level", "adset");
//!     let records = meta.fetch(range, &params).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use bizmetrics_core::{
    Connector, ConnectorConfig, ConnectorMode, DateRange, MetricRecord, MetricsError,
    RequestParams, Result, check_lookback, collect_pages,
};
use chrono::Utc;
use reqwest::Client;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

mod insights;
/// Credential-less sample generator.
pub mod sample;

use insights::{DEFAULT_PAGE_SIZE, InsightsQuery, InsightsResponse};
pub use sample::MetaSampleConnector;

/// Connector name used for registration and record attribution.
pub const NAME: &str = "meta-ads";

/// Graph API base URL, pinned to a version.
const GRAPH_BASE_URL: &str = "https://graph.facebook.com/v19.0";

/// Insights are retained for 37 months.
pub const MAX_LOOKBACK_DAYS: u64 = 1_125;

/// Upper bound on insight pages for one fetch.
const MAX_PAGES: usize = 1_000;

/// Credentials required for live mode.
pub const REQUIRED_CREDENTIALS: &[&str] = &["access_token", "ad_account_id"];

/// Metrics available from the insights edge.
const AVAILABLE_METRICS: &[&str] = &[
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
    "video_views",
    "video_p25_watched",
    "video_p50_watched",
    "video_p75_watched",
    "video_p100_watched",
];

/// Dimensions reported across aggregation levels.
const AVAILABLE_DIMENSIONS: &[&str] = &[
    "account_id",
    "account_name",
    "campaign_id",
    "campaign_name",
    "objective",
    "adset_id",
    "adset_name",
    "ad_id",
    "ad_name",
];

/// Builds the Meta Ads connector for `config`.
///
/// Returns the live connector when `access_token` and `ad_account_id` are both
/// set, and the sample generator otherwise.
///
/// # Errors
/// Returns an error if the HTTP client cannot be created.
pub fn connector(config: &ConnectorConfig) -> Result<Arc<dyn Connector>> {
    if config.has_credentials(REQUIRED_CREDENTIALS) {
        Ok(Arc::new(MetaAdsConnector::from_config(config)?))
    } else {
        debug!("No Meta Ads credentials configured, using sample data");
        Ok(Arc::new(MetaSampleConnector::new()))
    }
}

/// Live Meta Ads connector.
///
/// Reads the `act_{id}/insights` edge with one row per day and follows
/// `paging.next` until the last page.
#[derive(Clone)]
pub struct MetaAdsConnector {
    client: Client,
    base_url: String,
    ad_account_id: String,
    access_token: String,
    page_size: u32,
}

impl fmt::Debug for MetaAdsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaAdsConnector")
            .field("base_url", &self.base_url)
            .field("ad_account_id", &self.ad_account_id)
            .field("access_token", &"[REDACTED]")
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl MetaAdsConnector {
    /// Create a live connector from configured credentials.
    ///
    /// The ad account id is accepted with or without its `act_` prefix.
    ///
    /// # Errors
    /// Returns [`MetricsError::SourceAuth`] if a required credential is missing,
    /// or [`MetricsError::Config`] if the HTTP client cannot be created.
    pub fn from_config(config: &ConnectorConfig) -> Result<Self> {
        let credential = |key: &str| {
            config
                .credential(key)
                .ok_or_else(|| MetricsError::auth(NAME, format!("missing credential {key}")))
        };

        let account = credential("ad_account_id")?;
        let ad_account_id = if account.starts_with("act_") {
            account.to_string()
        } else {
            format!("act_{account}")
        };

        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| MetricsError::Config(format!("Meta HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| GRAPH_BASE_URL.to_string()),
            ad_account_id,
            access_token: credential("access_token")?.to_string(),
            page_size: config.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        })
    }

    /// Insights edge of the configured ad account.
    fn insights_url(&self) -> String {
        format!(
            "{}/{}/insights",
            self.base_url.trim_end_matches('/'),
            self.ad_account_id
        )
    }

    /// Fetches one insights page: the first from `query`, later ones from the
    /// `next` URL the previous page returned.
    async fn get_page(
        &self,
        query: &InsightsQuery,
        next: Option<String>,
    ) -> Result<InsightsResponse> {
        let token = [("access_token", self.access_token.as_str())];
        let request = match next {
            // Graph cursors normally carry the token already
            Some(url) if url.contains("access_token=") => self.client.get(url),
            Some(url) => self.client.get(url).query(&token),
            None => {
                debug!(level = %query.level, "Meta insights request");
                self.client
                    .get(self.insights_url())
                    .query(&query.pairs())
                    .query(&token)
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| MetricsError::unavailable(NAME, e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| MetricsError::unavailable(NAME, e.to_string()))?;

        if !status.is_success() {
            return Err(insights::classify_error(status.as_u16(), &text));
        }

        serde_json::from_str(&text).map_err(|e| MetricsError::data(NAME, e.to_string()))
    }
}

#[async_trait]
impl Connector for MetaAdsConnector {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Meta (Facebook/Instagram) Marketing API connector"
    }

    fn mode(&self) -> ConnectorMode {
        ConnectorMode::Live
    }

    fn available_metrics(&self) -> &[&'static str] {
        AVAILABLE_METRICS
    }

    fn available_dimensions(&self) -> &[&'static str] {
        AVAILABLE_DIMENSIONS
    }

    fn max_lookback_days(&self) -> Option<u64> {
        Some(MAX_LOOKBACK_DAYS)
    }

    async fn validate_credentials(&self) -> Result<()> {
        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.ad_account_id
        );
        let response = self
            .client
            .get(url)
            .query(&[("fields", "id"), ("access_token", self.access_token.as_str())])
            .send()
            .await
            .map_err(|e| MetricsError::unavailable(NAME, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(insights::classify_error(status.as_u16(), &text));
        }
        info!(ad_account_id = %self.ad_account_id, "Meta Ads credentials accepted");
        Ok(())
    }

    async fn fetch(&self, range: DateRange, params: &RequestParams) -> Result<Vec<MetricRecord>> {
        check_lookback(NAME, range, Utc::now().date_naive(), MAX_LOOKBACK_DAYS)?;

        let query = InsightsQuery::build(range, params, self.page_size)?;
        let dimensions = query.dimensions;
        let query = &query;
        let mut records = collect_pages(NAME, MAX_PAGES, move |next: Option<String>| async move {
            self.get_page(query, next).await?.into_page(dimensions)
        })
        .await?;

        records.sort_by_key(|r| r.date);
        debug!(%range, count = records.len(), "Fetched Meta Ads insights");
        Ok(records)
    }
}
