//! No-op cache store.

use async_trait::async_trait;
use bizmetrics_core::{
    CacheEntry, CacheStats, CacheStore, FetchFingerprint, MetricRecord, Result,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::trace;

/// A store that doesn't keep anything.
///
/// Every `get` is a miss and every `put` succeeds without effect. Useful for
/// disabling caching or exercising the always-fetch path.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCacheStore;

impl NoopCacheStore {
    /// Create a new no-op store.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CacheStore for NoopCacheStore {
    async fn get(&self, _fingerprint: &FetchFingerprint) -> Result<Option<CacheEntry>> {
        trace!("NoopCacheStore: get called, returning None");
        Ok(None)
    }

    async fn put(
        &self,
        _fingerprint: &FetchFingerprint,
        _records: &[MetricRecord],
        _fetched_at: DateTime<Utc>,
        _ttl: Duration,
    ) -> Result<()> {
        trace!("NoopCacheStore: put called, doing nothing");
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats::default())
    }

    async fn clear(&self, _connector: Option<&str>) -> Result<usize> {
        trace!("NoopCacheStore: clear called, returning 0");
        Ok(0)
    }

    async fn entries(&self, _connector: Option<&str>) -> Result<Vec<CacheEntry>> {
        Ok(Vec::new())
    }

    async fn latest(&self, _connector: &str) -> Result<Option<CacheEntry>> {
        Ok(None)
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }
}
