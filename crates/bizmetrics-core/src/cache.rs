//! Cache store trait for persisting fetched record sets.
//!
//! This module defines the [`CacheStore`] trait, the narrow repository interface
//! the orchestrator and exporters use, along with [`CacheEntry`] and
//! [`CacheStats`]. Stores never judge freshness; they hand back what was
//! persisted together with its `fetched_at` and `ttl`.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    error::{MetricsError, Result},
    fingerprint::FetchFingerprint,
    types::MetricRecord,
};

/// One cached result set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request the records answer.
    pub fingerprint: FetchFingerprint,
    /// Records in the order the connector returned them.
    pub records: Vec<MetricRecord>,
    /// When the records were fetched from the connector.
    pub fetched_at: DateTime<Utc>,
    /// How long the entry counts as fresh.
    pub ttl: Duration,
}

impl CacheEntry {
    /// Time elapsed between `fetched_at` and `now`.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now.signed_duration_since(self.fetched_at)
    }

    /// Moment after which the entry is no longer fresh.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.fetched_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Per-connector slice of [`CacheStats`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorStats {
    /// Connector name.
    pub connector: String,
    /// Number of cached entries for the connector.
    pub entry_count: u64,
    /// Records across those entries.
    pub record_count: u64,
    /// Most recent fetch among those entries.
    pub last_fetched_at: Option<DateTime<Utc>>,
}

/// Read-only aggregate over the whole store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of entries.
    pub entry_count: u64,
    /// Size of the serialized records.
    pub total_bytes: u64,
    /// Oldest `fetched_at` in the store.
    pub oldest_fetched_at: Option<DateTime<Utc>>,
    /// Breakdown by connector, sorted by connector name.
    pub connectors: Vec<ConnectorStats>,
}

/// Rejects record sets a store could not read back unchanged.
///
/// Stores that keep records refuse non-finite metric values, which JSON cannot represent.
///
/// # Errors
/// Returns [`MetricsError::Store`] naming the first offending metric.
pub fn ensure_storable(fingerprint: &FetchFingerprint, records: &[MetricRecord]) -> Result<()> {
    let offending = records.iter().find_map(|record| {
        record
            .metrics
            .iter()
            .find(|(_, value)| !value.is_finite())
            .map(|(name, value)| (record.date, name, *value))
    });
    match offending {
        Some((date, name, value)) => Err(MetricsError::Store(format!(
            "refusing to cache {fingerprint}: metric {name} on {date} is {value}"
        ))),
        None => Ok(()),
    }
}

/// Durable key-value store of fetch results.
///
/// Implementations can store data in various backends (SQLite, in-memory, etc.)
/// so long as `put` replaces an entry atomically: a concurrent `get` sees either
/// the old or the new entry in full.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Retrieves the entry for a fingerprint.
    ///
    /// Returns `Ok(None)` if nothing is cached, and
    /// [`MetricsError::StoreCorrupt`](crate::MetricsError::StoreCorrupt) if the
    /// persisted records cannot be read back.
    async fn get(&self, fingerprint: &FetchFingerprint) -> Result<Option<CacheEntry>>;

    /// Stores records for a fingerprint, overwriting any previous entry.
    async fn put(
        &self,
        fingerprint: &FetchFingerprint,
        records: &[MetricRecord],
        fetched_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<()>;

    /// Aggregates entry counts, sizes and ages.
    async fn stats(&self) -> Result<CacheStats>;

    /// Deletes every entry, or only those for `connector`.
    ///
    /// Returns the number of entries removed. Clearing an empty store succeeds.
    async fn clear(&self, connector: Option<&str>) -> Result<usize>;

    /// Lists entries, optionally for one connector, ordered by connector and
    /// start date. Unreadable entries are skipped.
    async fn entries(&self, connector: Option<&str>) -> Result<Vec<CacheEntry>>;

    /// Returns the most recently fetched entry for a connector, whatever its age.
    async fn latest(&self, connector: &str) -> Result<Option<CacheEntry>>;

    /// Deletes entries whose own TTL has elapsed at `now`.
    ///
    /// Returns the number of entries removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}
