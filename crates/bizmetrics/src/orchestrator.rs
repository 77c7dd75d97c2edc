//! Fetch orchestration: cache lookup, connector calls and stale fallback.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use tracing::{debug, info, instrument, warn};

use bizmetrics_core::{
    CacheEntry, CacheStats, CacheStore, Connector, ConnectorMode, DateRange, FetchFingerprint,
    MetricRecord, MetricsError, RequestParams, Result, Settings, TtlPolicy,
};

/// How a single fetch treats the cache and connector failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Fail with [`MetricsError::FetchFailed`] instead of answering with stale data.
    pub strict: bool,
    /// Skip the cache lookup. Fresh records are still written through.
    pub bypass_cache: bool,
}

impl FetchPolicy {
    /// Policy that never falls back to stale data.
    #[must_use]
    pub const fn strict() -> Self {
        Self {
            strict: true,
            bypass_cache: false,
        }
    }

    /// Policy that always calls the connector.
    #[must_use]
    pub const fn bypass_cache() -> Self {
        Self {
            strict: false,
            bypass_cache: true,
        }
    }
}

/// Raised alongside stale records when the connector could not be reached.
#[derive(Debug)]
pub struct StaleDataWarning {
    /// Connector that failed.
    pub connector: String,
    /// Request the stale records answer.
    pub fingerprint: FetchFingerprint,
    /// When the stale records were fetched.
    pub fetched_at: DateTime<Utc>,
    /// TTL the entry was stored with.
    pub ttl: Duration,
    /// Age of the records when they were served.
    pub age: TimeDelta,
    /// The connector failure that forced the fallback.
    pub cause: MetricsError,
}

impl fmt::Display for StaleDataWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "serving stale {} data fetched at {} ({}h old): {}",
            self.connector,
            self.fetched_at.to_rfc3339(),
            self.age.num_hours(),
            self.cause
        )
    }
}

/// Where the records of a [`FetchOutcome`] came from.
#[derive(Debug)]
pub enum FetchStatus {
    /// A fresh cache entry answered the request.
    CacheHit,
    /// The connector was called and the result written through.
    Fetched,
    /// The connector failed and an expired entry answered instead.
    Stale(StaleDataWarning),
}

/// Records returned by [`FetchOrchestrator::fetch_metrics`].
#[derive(Debug)]
pub struct FetchOutcome {
    /// The records, in connector order.
    pub records: Vec<MetricRecord>,
    /// When the records were fetched from the connector.
    pub fetched_at: DateTime<Utc>,
    /// Cache hit, fresh fetch or stale fallback.
    pub status: FetchStatus,
}

impl FetchOutcome {
    fn from_entry(entry: CacheEntry, status: FetchStatus) -> Self {
        Self {
            records: entry.records,
            fetched_at: entry.fetched_at,
            status,
        }
    }

    /// Returns true if no connector call was made.
    #[must_use]
    pub const fn is_cache_hit(&self) -> bool {
        matches!(self.status, FetchStatus::CacheHit)
    }

    /// The stale-data warning, if the records are a fallback.
    #[must_use]
    pub fn warning(&self) -> Option<&StaleDataWarning> {
        match &self.status {
            FetchStatus::Stale(warning) => Some(warning),
            _ => None,
        }
    }
}

/// Summary of a registered connector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectorInfo {
    /// Registration name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Whether records are synthetic.
    pub mode: ConnectorMode,
    /// Metrics the connector can produce.
    pub metrics: Vec<&'static str>,
}

/// Returns true while an entry fetched at `fetched_at` is within `ttl` at `now`.
///
/// An entry is fresh up to and including the instant its TTL elapses.
#[must_use]
pub fn is_fresh(fetched_at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    TimeDelta::from_std(ttl)
        .ok()
        .is_none_or(|ttl| now.signed_duration_since(fetched_at) <= ttl)
}

/// Coordinates connectors and the cache store.
///
/// Every fetch goes through the store first; connectors are only called on a
/// miss, an expired entry or an explicit bypass. If a connector is unavailable
/// and an older entry exists, the older records are served with a
/// [`StaleDataWarning`] unless the policy is strict.
///
/// # Example
///
/// ```rust,ignore
/// use bizmetrics::{FetchOrchestrator, InMemoryCacheStore, DemoConnector, RequestParams};
/// use chrono::NaiveDate;
/// use std::sync::Arc;
///
/// let orchestrator = FetchOrchestrator::builder(Arc::new(InMemoryCacheStore::new()))
///     .register(Arc::new(DemoConnector::new()))
///     .build();
///
/// let outcome = orchestrator.fetch_metrics(
///     "demo",
///     NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
///     NaiveDate::from_ymd_opt(2024, 12, 3).unwrap(),
///     &RequestParams::new(),
/// ).await?;
/// assert_eq!(outcome.records.len(), 3);
/// ```
pub struct FetchOrchestrator {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
    store: Arc<dyn CacheStore>,
    ttl: TtlPolicy,
}

impl fmt::Debug for FetchOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOrchestrator")
            .field("connectors", &self.connectors.keys().collect::<Vec<_>>())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Builder for [`FetchOrchestrator`].
pub struct FetchOrchestratorBuilder {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
    store: Arc<dyn CacheStore>,
    ttl: TtlPolicy,
}

impl fmt::Debug for FetchOrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOrchestratorBuilder")
            .field("connectors", &self.connectors.keys().collect::<Vec<_>>())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl FetchOrchestratorBuilder {
    /// Sets the TTL policy for entries written by this orchestrator.
    #[must_use]
    pub fn ttl_policy(mut self, ttl: TtlPolicy) -> Self {
        self.ttl = ttl;
        self
    }

    /// Registers a connector under its own name, replacing any previous one.
    #[must_use]
    pub fn register(mut self, connector: Arc<dyn Connector>) -> Self {
        debug!(
            connector = connector.name(),
            mode = ?connector.mode(),
            "Registered connector"
        );
        self.connectors
            .insert(connector.name().to_string(), connector);
        self
    }

    /// Finishes the orchestrator.
    #[must_use]
    pub fn build(self) -> FetchOrchestrator {
        FetchOrchestrator {
            connectors: self.connectors,
            store: self.store,
            ttl: self.ttl,
        }
    }
}

impl FetchOrchestrator {
    /// Starts a builder over `store` with the default TTL policy.
    #[must_use]
    pub fn builder(store: Arc<dyn CacheStore>) -> FetchOrchestratorBuilder {
        FetchOrchestratorBuilder {
            connectors: BTreeMap::new(),
            store,
            ttl: TtlPolicy::default(),
        }
    }

    /// Registers the built-in connectors configured in `settings`.
    ///
    /// Connectors without credentials come up in demo mode.
    ///
    /// # Errors
    /// Returns an error if a connector cannot be constructed.
    pub fn from_settings(settings: &Settings, store: Arc<dyn CacheStore>) -> Result<Self> {
        let builder = Self::builder(store)
            .ttl_policy(settings.ttl_policy())
            .register(bizmetrics_demo::connector(
                &settings.connector(bizmetrics_demo::NAME),
            )?);

        #[cfg(feature = "ga4")]
        let builder = builder.register(bizmetrics_ga4::connector(
            &settings.connector(bizmetrics_ga4::NAME),
        )?);

        #[cfg(feature = "meta")]
        let builder = builder.register(bizmetrics_meta::connector(
            &settings.connector(bizmetrics_meta::NAME),
        )?);

        Ok(builder.build())
    }

    /// Opens the SQLite cache at `settings.cache_path` and registers the
    /// built-in connectors.
    ///
    /// # Errors
    /// Returns an error if the cache cannot be opened or a connector cannot be
    /// constructed.
    #[cfg(feature = "cache-sqlite")]
    pub fn open(settings: &Settings) -> Result<Self> {
        let store = bizmetrics_cache::SqliteCacheStore::with_busy_timeout(
            &settings.cache_path,
            settings.busy_timeout(),
        )?;
        info!(path = %settings.cache_path.display(), "Opened metrics cache");
        Self::from_settings(settings, Arc::new(store))
    }

    /// Fetches metrics with the default policy.
    ///
    /// # Errors
    /// See [`fetch_metrics_with`](Self::fetch_metrics_with).
    pub async fn fetch_metrics(
        &self,
        connector: &str,
        start: NaiveDate,
        end: NaiveDate,
        params: &RequestParams,
    ) -> Result<FetchOutcome> {
        self.fetch_metrics_with(connector, start, end, params, FetchPolicy::default())
            .await
    }

    /// Fetches metrics for `connector` over `start..=end`.
    ///
    /// # Errors
    /// Returns [`MetricsError::InvalidRange`] if `start > end`,
    /// [`MetricsError::UnknownConnector`] if nothing is registered under
    /// `connector`, and [`MetricsError::FetchFailed`] if the connector fails and
    /// no stale fallback applies.
    #[instrument(skip(self, params))]
    pub async fn fetch_metrics_with(
        &self,
        connector: &str,
        start: NaiveDate,
        end: NaiveDate,
        params: &RequestParams,
        policy: FetchPolicy,
    ) -> Result<FetchOutcome> {
        let range = DateRange::new(start, end)?;
        let source = self
            .connectors
            .get(connector)
            .ok_or_else(|| MetricsError::UnknownConnector(connector.to_string()))?;
        let fingerprint = FetchFingerprint::compute(connector, range, params);

        let cached = if policy.bypass_cache {
            None
        } else {
            self.lookup(&fingerprint).await
        };

        let stale = match cached {
            Some(entry) if is_fresh(entry.fetched_at, entry.ttl, Utc::now()) => {
                debug!(%fingerprint, count = entry.records.len(), "Cache hit");
                return Ok(FetchOutcome::from_entry(entry, FetchStatus::CacheHit));
            }
            Some(entry) => {
                debug!(%fingerprint, fetched_at = %entry.fetched_at, "Cache entry expired");
                Some(entry)
            }
            None => {
                debug!(%fingerprint, "Cache miss");
                None
            }
        };

        match Self::fetch_checked(source.as_ref(), range, params).await {
            Ok(records) => {
                let fetched_at = Utc::now();
                let ttl = self.ttl.ttl_for(connector);
                if let Err(e) = self.store.put(&fingerprint, &records, fetched_at, ttl).await {
                    warn!(connector, error = %e, "Failed to cache fetched records");
                }
                debug!(%fingerprint, count = records.len(), "Fetched from connector");
                Ok(FetchOutcome {
                    records,
                    fetched_at,
                    status: FetchStatus::Fetched,
                })
            }
            Err(cause) => self.fall_back(fingerprint, stale, cause, policy).await,
        }
    }

    /// Reads the cache, treating unreadable entries as absent.
    async fn lookup(&self, fingerprint: &FetchFingerprint) -> Option<CacheEntry> {
        match self.store.get(fingerprint).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(%fingerprint, error = %e, "Cache read failed, refetching");
                None
            }
        }
    }

    /// Calls the connector and rejects records that break the record invariants.
    async fn fetch_checked(
        source: &dyn Connector,
        range: DateRange,
        params: &RequestParams,
    ) -> Result<Vec<MetricRecord>> {
        let records = source.fetch(range, params).await?;
        let signed = source.signed_metrics();
        for record in &records {
            record.check(source.name(), &range, signed)?;
        }
        Ok(records)
    }

    async fn fall_back(
        &self,
        fingerprint: FetchFingerprint,
        stale: Option<CacheEntry>,
        cause: MetricsError,
        policy: FetchPolicy,
    ) -> Result<FetchOutcome> {
        let connector = fingerprint.connector().to_string();
        if policy.strict || !cause.allows_stale_fallback() {
            return Err(MetricsError::FetchFailed {
                connector,
                cause: Box::new(cause),
            });
        }

        // A bypassed lookup still allows a fallback
        let stale = match stale {
            Some(entry) => Some(entry),
            None if policy.bypass_cache => self.lookup(&fingerprint).await,
            None => None,
        };
        let Some(entry) = stale else {
            return Err(MetricsError::FetchFailed {
                connector,
                cause: Box::new(cause),
            });
        };

        let now = Utc::now();
        if is_fresh(entry.fetched_at, entry.ttl, now) {
            debug!(%fingerprint, cause = %cause, "Bypassed entry is still fresh");
            return Ok(FetchOutcome::from_entry(entry, FetchStatus::CacheHit));
        }

        let warning = StaleDataWarning {
            connector,
            fingerprint,
            fetched_at: entry.fetched_at,
            ttl: entry.ttl,
            age: entry.age(now),
            cause,
        };
        warn!(
            connector = %warning.connector,
            fingerprint = %warning.fingerprint,
            age_secs = warning.age.num_seconds(),
            cause = %warning.cause,
            "Serving stale cached records"
        );
        Ok(FetchOutcome::from_entry(entry, FetchStatus::Stale(warning)))
    }

    /// The registered connectors, ordered by name.
    #[must_use]
    pub fn connectors(&self) -> Vec<ConnectorInfo> {
        self.connectors
            .iter()
            .map(|(name, connector)| ConnectorInfo {
                name: name.clone(),
                description: connector.description().to_string(),
                mode: connector.mode(),
                metrics: connector.available_metrics().to_vec(),
            })
            .collect()
    }

    /// Looks up a registered connector.
    #[must_use]
    pub fn connector(&self, name: &str) -> Option<&Arc<dyn Connector>> {
        self.connectors.get(name)
    }

    /// The cache store backing this orchestrator.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Cache statistics.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn stats(&self) -> Result<CacheStats> {
        self.store.stats().await
    }

    /// Deletes cached entries, all or those of one connector.
    ///
    /// # Errors
    /// Returns an error if the store cannot be written.
    pub async fn clear(&self, connector: Option<&str>) -> Result<usize> {
        let removed = self.store.clear(connector).await?;
        info!(connector = connector.unwrap_or("*"), removed, "Cleared cache");
        Ok(removed)
    }

    /// Deletes entries whose TTL has elapsed.
    ///
    /// # Errors
    /// Returns an error if the store cannot be written.
    pub async fn purge_expired(&self) -> Result<usize> {
        let removed = self.store.purge_expired(Utc::now()).await?;
        info!(removed, "Purged expired cache entries");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bizmetrics_cache::InMemoryCacheStore;
    #[cfg(feature = "cache-sqlite")]
    use bizmetrics_cache::SqliteCacheStore;
    use std::error::Error as _;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy, Debug)]
    enum Failure {
        Unavailable,
        Auth,
        OutOfRange,
    }

    /// Connector that counts calls and fails on demand.
    #[derive(Debug, Default)]
    struct ScriptedConnector {
        calls: AtomicUsize,
        failure: Mutex<Option<Failure>>,
    }

    impl ScriptedConnector {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn fail_with(&self, failure: Option<Failure>) {
            *self.failure.lock().unwrap() = failure;
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        fn name(&self) -> &str {
            "scripted"
        }

        fn description(&self) -> &str {
            "Scripted test connector"
        }

        fn mode(&self) -> ConnectorMode {
            ConnectorMode::Demo
        }

        fn available_metrics(&self) -> &[&'static str] {
            &["visits"]
        }

        async fn validate_credentials(&self) -> Result<()> {
            Ok(())
        }

        async fn fetch(&self, range: DateRange, _params: &RequestParams) -> Result<Vec<MetricRecord>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let failure = *self.failure.lock().unwrap();
            match failure {
                Some(Failure::Unavailable) => Err(MetricsError::unavailable("scripted", "timeout")),
                Some(Failure::Auth) => Err(MetricsError::auth("scripted", "token revoked")),
                Some(Failure::OutOfRange) => Ok(vec![
                    MetricRecord::new("scripted", range.end().succ_opt().unwrap())
                        .with_metric("visits", 1.0),
                ]),
                None => Ok(range
                    .iter_days()
                    .map(|day| MetricRecord::new("scripted", day).with_metric("visits", call as f64))
                    .collect()),
            }
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, day).unwrap()
    }

    fn setup(store: Arc<dyn CacheStore>) -> (Arc<ScriptedConnector>, FetchOrchestrator) {
        let connector = Arc::new(ScriptedConnector::default());
        let orchestrator = FetchOrchestrator::builder(store)
            .register(connector.clone())
            .build();
        (connector, orchestrator)
    }

    fn fingerprint(start: u32, end: u32) -> FetchFingerprint {
        let range = DateRange::new(date(start), date(end)).unwrap();
        FetchFingerprint::compute("scripted", range, &RequestParams::new())
    }

    /// Stores an entry fetched two days ago with a one hour TTL.
    async fn seed_expired(store: &dyn CacheStore) -> Vec<MetricRecord> {
        let records = vec![MetricRecord::new("scripted", date(1)).with_metric("visits", 7.0)];
        store
            .put(
                &fingerprint(1, 1),
                &records,
                Utc::now() - TimeDelta::days(2),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();
        records
    }

    /// Store whose reads always fail and whose writes can be made to fail.
    struct FlakyStore {
        inner: InMemoryCacheStore,
        corrupt_reads: bool,
        failing_writes: bool,
    }

    #[async_trait]
    impl CacheStore for FlakyStore {
        async fn get(&self, fingerprint: &FetchFingerprint) -> Result<Option<CacheEntry>> {
            if self.corrupt_reads {
                return Err(MetricsError::StoreCorrupt {
                    fingerprint: fingerprint.digest().to_string(),
                    reason: "expected value at line 1 column 1".into(),
                });
            }
            self.inner.get(fingerprint).await
        }

        async fn put(
            &self,
            fingerprint: &FetchFingerprint,
            records: &[MetricRecord],
            fetched_at: DateTime<Utc>,
            ttl: Duration,
        ) -> Result<()> {
            if self.failing_writes {
                return Err(MetricsError::Store("database is locked".into()));
            }
            self.inner.put(fingerprint, records, fetched_at, ttl).await
        }

        async fn stats(&self) -> Result<CacheStats> {
            self.inner.stats().await
        }

        async fn clear(&self, connector: Option<&str>) -> Result<usize> {
            self.inner.clear(connector).await
        }

        async fn entries(&self, connector: Option<&str>) -> Result<Vec<CacheEntry>> {
            self.inner.entries(connector).await
        }

        async fn latest(&self, connector: &str) -> Result<Option<CacheEntry>> {
            self.inner.latest(connector).await
        }

        async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
            self.inner.purge_expired(now).await
        }
    }

    #[test]
    fn test_freshness_boundary() {
        let fetched_at = Utc::now();
        let ttl = Duration::from_secs(3600);
        let edge = fetched_at + TimeDelta::seconds(3600);

        assert!(is_fresh(fetched_at, ttl, fetched_at));
        assert!(is_fresh(fetched_at, ttl, edge - TimeDelta::seconds(1)));
        assert!(is_fresh(fetched_at, ttl, edge));
        assert!(!is_fresh(fetched_at, ttl, edge + TimeDelta::seconds(1)));
    }

    #[tokio::test]
    async fn test_second_fetch_within_ttl_hits_cache() {
        let (connector, orchestrator) = setup(Arc::new(InMemoryCacheStore::new()));
        let params = RequestParams::new();

        let first = orchestrator
            .fetch_metrics("scripted", date(1), date(3), &params)
            .await
            .unwrap();
        let second = orchestrator
            .fetch_metrics("scripted", date(1), date(3), &params)
            .await
            .unwrap();

        assert!(matches!(first.status, FetchStatus::Fetched));
        assert!(second.is_cache_hit());
        assert_eq!(first.records, second.records);
        assert_eq!(second.records.len(), 3);
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn test_distinct_params_are_cached_separately() {
        let (connector, orchestrator) = setup(Arc::new(InMemoryCacheStore::new()));
        orchestrator
            .fetch_metrics("scripted", date(1), date(1), &RequestParams::new())
            .await
            .unwrap();
        orchestrator
            .fetch_metrics(
                "scripted",
                date(1),
                date(1),
                &RequestParams::new().with("level", "adset"),
            )
            .await
            .unwrap();
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_range_rejected_without_calls() {
        let (connector, orchestrator) = setup(Arc::new(InMemoryCacheStore::new()));
        let result = orchestrator
            .fetch_metrics("scripted", date(5), date(1), &RequestParams::new())
            .await;
        assert!(matches!(result, Err(MetricsError::InvalidRange { .. })));
        assert_eq!(connector.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_connector() {
        let (_, orchestrator) = setup(Arc::new(InMemoryCacheStore::new()));
        let result = orchestrator
            .fetch_metrics("hubspot", date(1), date(1), &RequestParams::new())
            .await;
        assert!(matches!(result, Err(MetricsError::UnknownConnector(name)) if name == "hubspot"));
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let store = Arc::new(InMemoryCacheStore::new());
        seed_expired(store.as_ref()).await;
        let (connector, orchestrator) = setup(store.clone());

        let outcome = orchestrator
            .fetch_metrics("scripted", date(1), date(1), &RequestParams::new())
            .await
            .unwrap();

        assert!(matches!(outcome.status, FetchStatus::Fetched));
        assert_eq!(outcome.records[0].metric("visits"), Some(1.0));
        assert_eq!(connector.calls(), 1);

        let entry = store.get(&fingerprint(1, 1)).await.unwrap().unwrap();
        assert_eq!(entry.fetched_at, outcome.fetched_at);
        assert_eq!(entry.ttl, TtlPolicy::default().default_ttl());
    }

    #[tokio::test]
    async fn test_unavailable_source_serves_stale_records() {
        let store = Arc::new(InMemoryCacheStore::new());
        let stored = seed_expired(store.as_ref()).await;
        let (connector, orchestrator) = setup(store);
        connector.fail_with(Some(Failure::Unavailable));

        let outcome = orchestrator
            .fetch_metrics("scripted", date(1), date(1), &RequestParams::new())
            .await
            .unwrap();

        assert_eq!(outcome.records, stored);
        let warning = outcome.warning().expect("stale warning");
        assert_eq!(warning.connector, "scripted");
        assert_eq!(warning.fingerprint, fingerprint(1, 1));
        assert_eq!(warning.ttl, Duration::from_secs(3600));
        assert!(warning.age >= TimeDelta::days(2));
        assert!(matches!(warning.cause, MetricsError::SourceUnavailable { .. }));
        assert!(warning.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn test_strict_policy_propagates_failure() {
        let store = Arc::new(InMemoryCacheStore::new());
        seed_expired(store.as_ref()).await;
        let (connector, orchestrator) = setup(store);
        connector.fail_with(Some(Failure::Unavailable));

        let err = orchestrator
            .fetch_metrics_with(
                "scripted",
                date(1),
                date(1),
                &RequestParams::new(),
                FetchPolicy::strict(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MetricsError::FetchFailed { ref connector, .. } if connector == "scripted"));
        let cause = err.source().map(ToString::to_string).unwrap_or_default();
        assert!(cause.contains("timeout"));
    }

    #[tokio::test]
    async fn test_auth_failure_never_falls_back() {
        let store = Arc::new(InMemoryCacheStore::new());
        seed_expired(store.as_ref()).await;
        let (connector, orchestrator) = setup(store);
        connector.fail_with(Some(Failure::Auth));

        match orchestrator
            .fetch_metrics("scripted", date(1), date(1), &RequestParams::new())
            .await
        {
            Err(MetricsError::FetchFailed { cause, .. }) => {
                assert!(matches!(*cause, MetricsError::SourceAuth { .. }));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unavailable_without_entry_fails() {
        let (connector, orchestrator) = setup(Arc::new(InMemoryCacheStore::new()));
        connector.fail_with(Some(Failure::Unavailable));

        let result = orchestrator
            .fetch_metrics("scripted", date(1), date(1), &RequestParams::new())
            .await;
        assert!(matches!(result, Err(MetricsError::FetchFailed { .. })));
    }

    #[tokio::test]
    async fn test_invalid_records_are_not_cached() {
        let store = Arc::new(InMemoryCacheStore::new());
        let (connector, orchestrator) = setup(store.clone());
        connector.fail_with(Some(Failure::OutOfRange));

        match orchestrator
            .fetch_metrics("scripted", date(1), date(2), &RequestParams::new())
            .await
        {
            Err(MetricsError::FetchFailed { cause, .. }) => {
                assert!(matches!(*cause, MetricsError::SourceData { .. }));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(store.stats().await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_bypass_cache_still_writes_through() {
        let store = Arc::new(InMemoryCacheStore::new());
        let (connector, orchestrator) = setup(store.clone());
        let params = RequestParams::new();

        orchestrator
            .fetch_metrics("scripted", date(1), date(1), &params)
            .await
            .unwrap();
        let bypassed = orchestrator
            .fetch_metrics_with("scripted", date(1), date(1), &params, FetchPolicy::bypass_cache())
            .await
            .unwrap();

        assert!(matches!(bypassed.status, FetchStatus::Fetched));
        assert_eq!(connector.calls(), 2);
        let entry = store.get(&fingerprint(1, 1)).await.unwrap().unwrap();
        assert_eq!(entry.records, bypassed.records);
    }

    #[tokio::test]
    async fn test_bypassed_fresh_entry_is_a_cache_hit() {
        let store = Arc::new(InMemoryCacheStore::new());
        let (connector, orchestrator) = setup(store);
        let params = RequestParams::new();

        let fetched = orchestrator
            .fetch_metrics("scripted", date(1), date(1), &params)
            .await
            .unwrap();
        connector.fail_with(Some(Failure::Unavailable));

        let outcome = orchestrator
            .fetch_metrics_with("scripted", date(1), date(1), &params, FetchPolicy::bypass_cache())
            .await
            .unwrap();

        assert_eq!(connector.calls(), 2);
        assert!(outcome.is_cache_hit());
        assert!(outcome.warning().is_none());
        assert_eq!(outcome.records, fetched.records);
        assert_eq!(outcome.fetched_at, fetched.fetched_at);
    }

    #[tokio::test]
    async fn test_ttl_override_applies_per_connector() {
        let store = Arc::new(InMemoryCacheStore::new());
        let connector = Arc::new(ScriptedConnector::default());
        let orchestrator = FetchOrchestrator::builder(store.clone())
            .ttl_policy(
                TtlPolicy::new(Duration::from_secs(86_400))
                    .with_override("scripted", Duration::from_secs(600)),
            )
            .register(connector)
            .register(Arc::new(bizmetrics_demo::DemoConnector::new()))
            .build();
        let params = RequestParams::new();

        orchestrator
            .fetch_metrics("scripted", date(1), date(1), &params)
            .await
            .unwrap();
        orchestrator
            .fetch_metrics("demo", date(1), date(1), &params)
            .await
            .unwrap();

        let scripted = store.latest("scripted").await.unwrap().unwrap();
        let demo = store.latest("demo").await.unwrap().unwrap();
        assert_eq!(scripted.ttl, Duration::from_secs(600));
        assert_eq!(demo.ttl, Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn test_corrupt_entry_treated_as_miss() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryCacheStore::new(),
            corrupt_reads: true,
            failing_writes: false,
        });
        let (connector, orchestrator) = setup(store);
        let params = RequestParams::new();

        for _ in 0..2 {
            let outcome = orchestrator
                .fetch_metrics("scripted", date(1), date(2), &params)
                .await
                .unwrap();
            assert_eq!(outcome.records.len(), 2);
        }
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_write_through_still_returns_records() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryCacheStore::new(),
            corrupt_reads: false,
            failing_writes: true,
        });
        let (_, orchestrator) = setup(store.clone());

        let outcome = orchestrator
            .fetch_metrics("scripted", date(1), date(3), &RequestParams::new())
            .await
            .unwrap();
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(store.stats().await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_clear_then_fetch_calls_connector() {
        let (connector, orchestrator) = setup(Arc::new(InMemoryCacheStore::new()));
        let params = RequestParams::new();

        orchestrator
            .fetch_metrics("scripted", date(1), date(1), &params)
            .await
            .unwrap();
        assert_eq!(orchestrator.clear(Some("scripted")).await.unwrap(), 1);
        assert_eq!(orchestrator.stats().await.unwrap().entry_count, 0);
        assert!(
            orchestrator
                .store()
                .get(&fingerprint(1, 1))
                .await
                .unwrap()
                .is_none()
        );

        orchestrator
            .fetch_metrics("scripted", date(1), date(1), &params)
            .await
            .unwrap();
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test]
    async fn test_purge_expired_passes_through() {
        let store = Arc::new(InMemoryCacheStore::new());
        seed_expired(store.as_ref()).await;
        let (_, orchestrator) = setup(store);
        orchestrator
            .fetch_metrics("scripted", date(2), date(2), &RequestParams::new())
            .await
            .unwrap();

        assert_eq!(orchestrator.purge_expired().await.unwrap(), 1);
        assert_eq!(orchestrator.stats().await.unwrap().entry_count, 1);
    }

    #[cfg(all(feature = "ga4", feature = "meta"))]
    #[tokio::test]
    async fn test_from_settings_registers_builtin_connectors() {
        let settings = Settings::from_toml_str(
            r#"
            default_ttl_secs = 7200

            [connectors.meta-ads]
            ttl_secs = 600
            "#,
        )
        .unwrap();
        let orchestrator =
            FetchOrchestrator::from_settings(&settings, Arc::new(InMemoryCacheStore::new()))
                .unwrap();

        let infos = orchestrator.connectors();
        let names: Vec<_> = infos.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["demo", "google-analytics", "meta-ads"]);
        assert!(infos.iter().all(|c| c.mode == ConnectorMode::Demo));
        assert!(infos[0].metrics.contains(&"sessions"));
        assert_eq!(orchestrator.ttl.ttl_for("meta-ads"), Duration::from_secs(600));
        assert_eq!(orchestrator.ttl.ttl_for("demo"), Duration::from_secs(7200));
    }

    #[cfg(feature = "cache-sqlite")]
    #[tokio::test]
    async fn test_demo_fetch_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cache_path: dir.path().join("cache").join("bizmetrics.db"),
            ..Settings::default()
        };

        let first = FetchOrchestrator::open(&settings).unwrap();
        let fetched = first
            .fetch_metrics("demo", date(1), date(3), &RequestParams::new())
            .await
            .unwrap();
        assert!(matches!(fetched.status, FetchStatus::Fetched));
        assert_eq!(fetched.records.len(), 3);
        drop(first);

        let second = FetchOrchestrator::open(&settings).unwrap();
        let cached = second
            .fetch_metrics("demo", date(1), date(3), &RequestParams::new())
            .await
            .unwrap();
        assert!(cached.is_cache_hit());
        assert_eq!(cached.records, fetched.records);
    }

    #[cfg(feature = "cache-sqlite")]
    #[tokio::test]
    async fn test_sqlite_stale_fallback() {
        let store = Arc::new(SqliteCacheStore::in_memory().unwrap());
        let stored = seed_expired(store.as_ref()).await;
        let (connector, orchestrator) = setup(store);
        connector.fail_with(Some(Failure::Unavailable));

        let outcome = orchestrator
            .fetch_metrics_with(
                "scripted",
                date(1),
                date(1),
                &RequestParams::new(),
                FetchPolicy::bypass_cache(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.records, stored);
        assert!(outcome.warning().is_some());
    }
}
