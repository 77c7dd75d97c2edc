//! In-memory cache store.

use async_trait::async_trait;
use bizmetrics_core::{
    CacheEntry, CacheStats, CacheStore, ConnectorStats, FetchFingerprint, MetricRecord, Result,
    ensure_storable,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Simple in-memory store for testing and short-lived tools.
///
/// Entries are kept in a `RwLock`-protected `HashMap` keyed by fingerprint
/// digest and are lost when the store is dropped. Records are cloned on get and
/// put, and a `put` swaps the whole entry under the write lock.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryCacheStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    #[instrument(skip(self), fields(fingerprint = %fingerprint))]
    async fn get(&self, fingerprint: &FetchFingerprint) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read().await;
        let entry = entries.get(fingerprint.digest()).cloned();
        debug!(hit = entry.is_some(), "Memory cache lookup");
        Ok(entry)
    }

    #[instrument(skip(self, records), fields(fingerprint = %fingerprint, count = records.len()))]
    async fn put(
        &self,
        fingerprint: &FetchFingerprint,
        records: &[MetricRecord],
        fetched_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<()> {
        ensure_storable(fingerprint, records)?;
        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            records: records.to_vec(),
            fetched_at,
            ttl,
        };
        self.entries
            .write()
            .await
            .insert(fingerprint.digest().to_string(), entry);
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats> {
        let entries = self.entries.read().await;

        let mut by_connector: BTreeMap<&str, ConnectorStats> = BTreeMap::new();
        let mut total_bytes = 0u64;
        for entry in entries.values() {
            // Same measure the SQLite store reports: serialized record size
            total_bytes += serde_json::to_vec(&entry.records)
                .map(|b| b.len() as u64)
                .unwrap_or_default();

            let name = entry.fingerprint.connector();
            let slot = by_connector
                .entry(name)
                .or_insert_with(|| ConnectorStats {
                    connector: name.to_string(),
                    entry_count: 0,
                    record_count: 0,
                    last_fetched_at: None,
                });
            slot.entry_count += 1;
            slot.record_count += entry.records.len() as u64;
            slot.last_fetched_at = slot.last_fetched_at.max(Some(entry.fetched_at));
        }

        Ok(CacheStats {
            entry_count: entries.len() as u64,
            total_bytes,
            oldest_fetched_at: entries.values().map(|e| e.fetched_at).min(),
            connectors: by_connector.into_values().collect(),
        })
    }

    async fn clear(&self, connector: Option<&str>) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        match connector {
            Some(name) => entries.retain(|_, e| e.fingerprint.connector() != name),
            None => entries.clear(),
        }
        Ok(before - entries.len())
    }

    async fn entries(&self, connector: Option<&str>) -> Result<Vec<CacheEntry>> {
        let entries = self.entries.read().await;
        let mut listed: Vec<CacheEntry> = entries
            .values()
            .filter(|e| connector.is_none_or(|name| e.fingerprint.connector() == name))
            .cloned()
            .collect();
        listed.sort_by(|a, b| {
            let key = |e: &CacheEntry| {
                let range = e.fingerprint.range();
                (
                    e.fingerprint.connector().to_string(),
                    range.start(),
                    range.end(),
                    e.fingerprint.digest().to_string(),
                )
            };
            key(a).cmp(&key(b))
        });
        Ok(listed)
    }

    async fn latest(&self, connector: &str) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|e| e.fingerprint.connector() == connector)
            .max_by_key(|e| e.fetched_at)
            .cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| now <= e.expires_at());
        Ok(before - entries.len())
    }
}
