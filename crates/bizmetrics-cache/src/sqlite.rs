//! SQLite-based cache store.

use async_trait::async_trait;
use bizmetrics_core::{
    CacheEntry, CacheStats, CacheStore, ConnectorStats, DateRange, FetchFingerprint,
    MetricRecord, MetricsError, RequestParams, Result, config::DEFAULT_BUSY_TIMEOUT_MS,
    ensure_storable,
};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{
    Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter,
};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Columns read back for every entry, in [`RawEntry::from_row`] order.
const ENTRY_COLUMNS: &str = "fingerprint, connector, start_date, end_date, params_json, \
                             records_json, fetched_at, ttl_ns";

/// SQLite-based cache store.
///
/// Entries persist across process restarts and the same database file can be
/// opened by several processes at once. The database runs in WAL mode so
/// readers never block on a writer, and every `put` is a single `IMMEDIATE`
/// transaction so writers to the same fingerprint are serialized by SQLite's
/// own locking.
#[derive(Debug)]
pub struct SqliteCacheStore {
    conn: Mutex<Connection>,
}

impl SqliteCacheStore {
    /// Open (or create) a cache database at the given path.
    ///
    /// Parent directories are created as needed.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or schema creation fails.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_busy_timeout(path, Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
    }

    /// Open a cache database, waiting up to `busy_timeout` for other processes'
    /// locks.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or schema creation fails.
    pub fn with_busy_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| MetricsError::Store(format!("{}: {e}", parent.display())))?;
        }

        let conn = Connection::open(path).map_err(store_err)?;
        conn.busy_timeout(busy_timeout).map_err(store_err)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(store_err)?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened SQLite cache");

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite store.
    ///
    /// Useful for testing; data is lost when the store is dropped.
    ///
    /// # Errors
    /// Returns an error if schema creation fails.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| MetricsError::Store(e.to_string()))
    }

    /// Initialize the database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS fetch_cache (
                fingerprint TEXT PRIMARY KEY,
                connector TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                params_json TEXT NOT NULL,
                records_json TEXT NOT NULL,
                record_count INTEGER NOT NULL,
                fetched_at TEXT NOT NULL,
                ttl_ns INTEGER NOT NULL
            )",
            [],
        )
        .map_err(store_err)?;

        // Databases written before TTLs were kept in nanoseconds
        let legacy_ttl: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('fetch_cache') WHERE name = 'ttl_ms'",
                [],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        if legacy_ttl {
            conn.execute_batch(
                "BEGIN IMMEDIATE;
                 ALTER TABLE fetch_cache RENAME COLUMN ttl_ms TO ttl_ns;
                 UPDATE fetch_cache SET ttl_ns = ttl_ns * 1000000;
                 COMMIT;",
            )
            .map_err(store_err)?;
            debug!("Migrated cache TTLs to nanoseconds");
        }

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_fetch_cache_connector
             ON fetch_cache(connector)",
            [],
        )
        .map_err(store_err)?;

        debug!("SQLite cache schema initialized");
        Ok(())
    }

    /// Reads raw rows matching an optional connector filter.
    fn select(
        conn: &Connection,
        connector: Option<&str>,
        order_by: &str,
    ) -> Result<Vec<RawEntry>> {
        let filter = if connector.is_some() {
            "WHERE connector = ?1"
        } else {
            ""
        };
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM fetch_cache {filter} ORDER BY {order_by}");
        let mut stmt = conn.prepare(&sql).map_err(store_err)?;
        let rows = stmt
            .query_map(params_from_iter(connector), RawEntry::from_row)
            .map_err(store_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    #[instrument(skip(self), fields(fingerprint = %fingerprint))]
    async fn get(&self, fingerprint: &FetchFingerprint) -> Result<Option<CacheEntry>> {
        let conn = self.lock()?;

        let raw = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM fetch_cache WHERE fingerprint = ?1"),
                params![fingerprint.digest()],
                RawEntry::from_row,
            )
            .optional()
            .map_err(store_err)?;

        match raw {
            Some(raw) => {
                let entry = raw.decode()?;
                debug!(records = entry.records.len(), "Found cached entry");
                Ok(Some(entry))
            }
            None => {
                debug!("No cached entry found");
                Ok(None)
            }
        }
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
        let records_json =
            serde_json::to_string(records).map_err(|e| MetricsError::Store(e.to_string()))?;
        let params_json = serde_json::to_string(fingerprint.params())
            .map_err(|e| MetricsError::Store(e.to_string()))?;
        let range = fingerprint.range();
        let ttl_ns = i64::try_from(ttl.as_nanos()).unwrap_or(i64::MAX);
        let record_count = i64::try_from(records.len()).unwrap_or(i64::MAX);

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_err)?;

        tx.execute(
            "INSERT INTO fetch_cache
             (fingerprint, connector, start_date, end_date, params_json,
              records_json, record_count, fetched_at, ttl_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(fingerprint) DO UPDATE SET
                connector = excluded.connector,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                params_json = excluded.params_json,
                records_json = excluded.records_json,
                record_count = excluded.record_count,
                fetched_at = excluded.fetched_at,
                ttl_ns = excluded.ttl_ns",
            params![
                fingerprint.digest(),
                fingerprint.connector(),
                range.start().to_string(),
                range.end().to_string(),
                params_json,
                records_json,
                record_count,
                format_timestamp(fetched_at),
                ttl_ns
            ],
        )
        .map_err(store_err)?;

        tx.commit().map_err(store_err)?;
        debug!("Cached {} records", records.len());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stats(&self) -> Result<CacheStats> {
        let conn = self.lock()?;

        let (entry_count, total_bytes, oldest) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(LENGTH(CAST(records_json AS BLOB))), 0),
                        MIN(fetched_at)
                 FROM fetch_cache",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .map_err(store_err)?;

        let mut stmt = conn
            .prepare(
                "SELECT connector, COUNT(*), COALESCE(SUM(record_count), 0), MAX(fetched_at)
                 FROM fetch_cache
                 GROUP BY connector
                 ORDER BY connector",
            )
            .map_err(store_err)?;
        let connectors = stmt
            .query_map([], |row| {
                Ok(ConnectorStats {
                    connector: row.get(0)?,
                    entry_count: u64::try_from(row.get::<_, i64>(1)?).unwrap_or_default(),
                    record_count: u64::try_from(row.get::<_, i64>(2)?).unwrap_or_default(),
                    last_fetched_at: row
                        .get::<_, Option<String>>(3)?
                        .and_then(|s| parse_timestamp(&s).ok()),
                })
            })
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;

        Ok(CacheStats {
            entry_count: u64::try_from(entry_count).unwrap_or_default(),
            total_bytes: u64::try_from(total_bytes).unwrap_or_default(),
            oldest_fetched_at: oldest.and_then(|s| parse_timestamp(&s).ok()),
            connectors,
        })
    }

    #[instrument(skip(self))]
    async fn clear(&self, connector: Option<&str>) -> Result<usize> {
        let conn = self.lock()?;

        let deleted = match connector {
            Some(name) => conn
                .execute("DELETE FROM fetch_cache WHERE connector = ?1", params![name])
                .map_err(store_err)?,
            None => conn
                .execute("DELETE FROM fetch_cache", [])
                .map_err(store_err)?,
        };

        debug!("Cleared {} cache entries", deleted);
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn entries(&self, connector: Option<&str>) -> Result<Vec<CacheEntry>> {
        let conn = self.lock()?;
        let rows = Self::select(&conn, connector, "connector, start_date, end_date, fingerprint")?;
        Ok(decode_readable(rows))
    }

    #[instrument(skip(self))]
    async fn latest(&self, connector: &str) -> Result<Option<CacheEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM fetch_cache WHERE connector = ?1 \
                 ORDER BY fetched_at DESC"
            ))
            .map_err(store_err)?;
        let mut rows = stmt.query(params![connector]).map_err(store_err)?;

        // Stop at the newest readable row
        while let Some(row) = rows.next().map_err(store_err)? {
            match RawEntry::from_row(row).map_err(store_err)?.decode() {
                Ok(entry) => return Ok(Some(entry)),
                Err(e) => warn!(error = %e, "Skipping unreadable cache entry"),
            }
        }
        Ok(None)
    }

    #[instrument(skip(self))]
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_err)?;

        let expired: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT fingerprint, fetched_at, ttl_ns FROM fetch_cache")
                .map_err(store_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(store_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(store_err)?;

            rows.into_iter()
                .filter(|(_, fetched_at, ttl_ns)| match parse_timestamp(fetched_at) {
                    Ok(fetched_at) => {
                        let ttl = chrono::TimeDelta::nanoseconds(*ttl_ns);
                        fetched_at
                            .checked_add_signed(ttl)
                            .is_some_and(|expires_at| now > expires_at)
                    }
                    // unreadable timestamps can never be judged fresh again
                    Err(_) => true,
                })
                .map(|(fingerprint, _, _)| fingerprint)
                .collect()
        };

        for fingerprint in &expired {
            tx.execute(
                "DELETE FROM fetch_cache WHERE fingerprint = ?1",
                params![fingerprint],
            )
            .map_err(store_err)?;
        }
        tx.commit().map_err(store_err)?;

        if !expired.is_empty() {
            debug!("Purged {} expired cache entries", expired.len());
        }
        Ok(expired.len())
    }
}

/// A persisted row before deserialization.
struct RawEntry {
    fingerprint: String,
    connector: String,
    start_date: String,
    end_date: String,
    params_json: String,
    records_json: String,
    fetched_at: String,
    ttl_ns: i64,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            fingerprint: row.get(0)?,
            connector: row.get(1)?,
            start_date: row.get(2)?,
            end_date: row.get(3)?,
            params_json: row.get(4)?,
            records_json: row.get(5)?,
            fetched_at: row.get(6)?,
            ttl_ns: row.get(7)?,
        })
    }

    /// Rebuilds the entry; any unreadable field marks the entry corrupt.
    fn decode(self) -> Result<CacheEntry> {
        let corrupt = |reason: String| MetricsError::StoreCorrupt {
            fingerprint: self.fingerprint.clone(),
            reason,
        };

        let start = NaiveDate::parse_from_str(&self.start_date, "%Y-%m-%d")
            .map_err(|e| corrupt(format!("start_date: {e}")))?;
        let end = NaiveDate::parse_from_str(&self.end_date, "%Y-%m-%d")
            .map_err(|e| corrupt(format!("end_date: {e}")))?;
        let range = DateRange::new(start, end).map_err(|e| corrupt(e.to_string()))?;
        let params: RequestParams = serde_json::from_str(&self.params_json)
            .map_err(|e| corrupt(format!("params: {e}")))?;
        let records: Vec<MetricRecord> = serde_json::from_str(&self.records_json)
            .map_err(|e| corrupt(format!("records: {e}")))?;
        let fetched_at =
            parse_timestamp(&self.fetched_at).map_err(|e| corrupt(format!("fetched_at: {e}")))?;
        let ttl = Duration::from_nanos(u64::try_from(self.ttl_ns).unwrap_or_default());

        Ok(CacheEntry {
            fingerprint: FetchFingerprint::from_parts(
                self.connector,
                range,
                params,
                self.fingerprint,
            ),
            records,
            fetched_at,
            ttl,
        })
    }
}

/// Decodes rows, logging and dropping the ones that are corrupt.
fn decode_readable(rows: Vec<RawEntry>) -> Vec<CacheEntry> {
    rows.into_iter()
        .filter_map(|raw| match raw.decode() {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable cache entry");
                None
            }
        })
        .collect()
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

fn store_err(e: rusqlite::Error) -> MetricsError {
    MetricsError::Store(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::sync::Arc;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, d).unwrap()
    }

    fn fingerprint(connector: &str, start: u32, end: u32) -> FetchFingerprint {
        let range = DateRange::new(day(start), day(end)).unwrap();
        FetchFingerprint::compute(connector, range, &RequestParams::new())
    }

    fn records(connector: &str, start: u32, end: u32) -> Vec<MetricRecord> {
        (start..=end)
            .map(|d| {
                MetricRecord::new(connector, day(d))
                    .with_dimension("campaign", "Brand Awareness Q4")
                    .with_metric("impressions", f64::from(d) * 1000.0)
                    .with_metric("ctr", 1.25)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sqlite_store_initialization() {
        let store = SqliteCacheStore::in_memory();
        assert!(store.is_ok());
    }

    #[tokio::test]
    async fn test_round_trip_preserves_records_and_fetched_at() {
        let store = SqliteCacheStore::in_memory().unwrap();
        let fp = fingerprint("meta-ads", 1, 3);

        // Initially no data
        assert!(store.get(&fp).await.unwrap().is_none());

        let stored = records("meta-ads", 1, 3);
        let fetched_at = Utc::now();
        let ttl = Duration::from_secs(3600);
        store.put(&fp, &stored, fetched_at, ttl).await.unwrap();

        let entry = store.get(&fp).await.unwrap().unwrap();
        assert_eq!(entry.records, stored);
        assert_eq!(entry.fetched_at, fetched_at);
        assert_eq!(entry.ttl, ttl);
        assert_eq!(entry.fingerprint, fp);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = SqliteCacheStore::in_memory().unwrap();
        let fp = fingerprint("demo", 1, 3);
        let ttl = Duration::from_secs(60);

        store
            .put(&fp, &records("demo", 1, 3), Utc::now(), ttl)
            .await
            .unwrap();
        let newer = records("demo", 2, 2);
        store.put(&fp, &newer, Utc::now(), ttl).await.unwrap();

        let entry = store.get(&fp).await.unwrap().unwrap();
        assert_eq!(entry.records, newer);
        assert_eq!(store.stats().await.unwrap().entry_count, 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let store = SqliteCacheStore::in_memory().unwrap();
        let empty = store.stats().await.unwrap();
        assert_eq!(empty.entry_count, 0);
        assert_eq!(empty.total_bytes, 0);
        assert!(empty.oldest_fetched_at.is_none());

        let older = Utc::now() - TimeDelta::hours(2);
        let newer = Utc::now();
        let ttl = Duration::from_secs(60);
        store
            .put(&fingerprint("demo", 1, 3), &records("demo", 1, 3), older, ttl)
            .await
            .unwrap();
        store
            .put(&fingerprint("demo", 4, 4), &records("demo", 4, 4), newer, ttl)
            .await
            .unwrap();
        store
            .put(
                &fingerprint("meta-ads", 1, 2),
                &records("meta-ads", 1, 2),
                newer,
                ttl,
            )
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.entry_count, 3);
        assert!(stats.total_bytes > 0);
        assert_eq!(stats.oldest_fetched_at, Some(older));
        assert_eq!(stats.connectors.len(), 2);
        assert_eq!(stats.connectors[0].connector, "demo");
        assert_eq!(stats.connectors[0].entry_count, 2);
        assert_eq!(stats.connectors[0].record_count, 4);
        assert_eq!(stats.connectors[0].last_fetched_at, Some(newer));
        assert_eq!(stats.connectors[1].connector, "meta-ads");
        assert_eq!(stats.connectors[1].record_count, 2);
    }

    #[tokio::test]
    async fn test_clear_all_and_filtered() {
        let store = SqliteCacheStore::in_memory().unwrap();
        let ttl = Duration::from_secs(60);

        // Clearing an empty store succeeds
        assert_eq!(store.clear(None).await.unwrap(), 0);

        let demo = fingerprint("demo", 1, 3);
        let meta = fingerprint("meta-ads", 1, 3);
        store
            .put(&demo, &records("demo", 1, 3), Utc::now(), ttl)
            .await
            .unwrap();
        store
            .put(&meta, &records("meta-ads", 1, 3), Utc::now(), ttl)
            .await
            .unwrap();

        assert_eq!(store.clear(Some("demo")).await.unwrap(), 1);
        assert!(store.get(&demo).await.unwrap().is_none());
        assert!(store.get(&meta).await.unwrap().is_some());

        assert_eq!(store.clear(None).await.unwrap(), 1);
        assert!(store.get(&meta).await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().entry_count, 0);

        // Idempotent
        assert_eq!(store.clear(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_entries_and_latest() {
        let store = SqliteCacheStore::in_memory().unwrap();
        let ttl = Duration::from_secs(60);
        let now = Utc::now();

        store
            .put(
                &fingerprint("meta-ads", 1, 1),
                &records("meta-ads", 1, 1),
                now - TimeDelta::days(3),
                ttl,
            )
            .await
            .unwrap();
        store
            .put(
                &fingerprint("demo", 5, 6),
                &records("demo", 5, 6),
                now - TimeDelta::days(2),
                ttl,
            )
            .await
            .unwrap();
        store
            .put(&fingerprint("demo", 1, 2), &records("demo", 1, 2), now, ttl)
            .await
            .unwrap();

        let all = store.entries(None).await.unwrap();
        let order: Vec<_> = all
            .iter()
            .map(|e| (e.fingerprint.connector().to_string(), e.fingerprint.range().start()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("demo".to_string(), day(1)),
                ("demo".to_string(), day(5)),
                ("meta-ads".to_string(), day(1)),
            ]
        );

        let demo_only = store.entries(Some("demo")).await.unwrap();
        assert_eq!(demo_only.len(), 2);

        // latest ignores age
        let latest = store.latest("meta-ads").await.unwrap().unwrap();
        assert_eq!(latest.fingerprint, fingerprint("meta-ads", 1, 1));
        let latest_demo = store.latest("demo").await.unwrap().unwrap();
        assert_eq!(latest_demo.fingerprint, fingerprint("demo", 1, 2));

        assert!(store.latest("google-analytics").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_isolated() {
        let store = SqliteCacheStore::in_memory().unwrap();
        let ttl = Duration::from_secs(60);
        let bad = fingerprint("demo", 1, 1);
        let good = fingerprint("demo", 2, 2);
        store
            .put(&bad, &records("demo", 1, 1), Utc::now(), ttl)
            .await
            .unwrap();
        store
            .put(&good, &records("demo", 2, 2), Utc::now(), ttl)
            .await
            .unwrap();

        store
            .lock()
            .unwrap()
            .execute(
                "UPDATE fetch_cache SET records_json = '{not json' WHERE fingerprint = ?1",
                params![bad.digest()],
            )
            .unwrap();

        assert!(matches!(
            store.get(&bad).await,
            Err(MetricsError::StoreCorrupt { .. })
        ));
        assert!(store.get(&good).await.unwrap().is_some());
        assert_eq!(store.entries(None).await.unwrap().len(), 1);

        // A fresh write replaces the corrupt row
        store
            .put(&bad, &records("demo", 1, 1), Utc::now(), ttl)
            .await
            .unwrap();
        assert!(store.get(&bad).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_latest_skips_newer_corrupt_entry() {
        let store = SqliteCacheStore::in_memory().unwrap();
        let ttl = Duration::from_secs(60);
        let now = Utc::now();
        let older = fingerprint("demo", 1, 1);
        let newer = fingerprint("demo", 2, 2);
        store
            .put(&older, &records("demo", 1, 1), now - TimeDelta::hours(1), ttl)
            .await
            .unwrap();
        store
            .put(&newer, &records("demo", 2, 2), now, ttl)
            .await
            .unwrap();

        store
            .lock()
            .unwrap()
            .execute(
                "UPDATE fetch_cache SET records_json = '[' WHERE fingerprint = ?1",
                params![newer.digest()],
            )
            .unwrap();

        let latest = store.latest("demo").await.unwrap().unwrap();
        assert_eq!(latest.fingerprint, older);
    }

    #[tokio::test]
    async fn test_non_finite_metrics_rejected() {
        let store = SqliteCacheStore::in_memory().unwrap();
        let fp = fingerprint("demo", 1, 1);
        let stored = vec![MetricRecord::new("demo", day(1)).with_metric("roas", f64::INFINITY)];

        let result = store
            .put(&fp, &stored, Utc::now(), Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(MetricsError::Store(_))));
        assert!(store.get(&fp).await.unwrap().is_none());
        assert_eq!(store.entries(None).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_sub_millisecond_ttl_round_trips() {
        let store = SqliteCacheStore::in_memory().unwrap();
        let fp = fingerprint("demo", 1, 1);
        let ttl = Duration::new(5, 123);
        store
            .put(&fp, &records("demo", 1, 1), Utc::now(), ttl)
            .await
            .unwrap();

        let entry = store.get(&fp).await.unwrap().unwrap();
        assert_eq!(entry.ttl, ttl);
    }

    #[tokio::test]
    async fn test_legacy_millisecond_ttls_are_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        let fp = fingerprint("demo", 1, 1);
        {
            let store = SqliteCacheStore::new(&path).unwrap();
            store
                .put(&fp, &records("demo", 1, 1), Utc::now(), Duration::from_secs(60))
                .await
                .unwrap();
            let conn = store.lock().unwrap();
            conn.execute_batch(
                "ALTER TABLE fetch_cache RENAME COLUMN ttl_ns TO ttl_ms;
                 UPDATE fetch_cache SET ttl_ms = 60000;",
            )
            .unwrap();
        }

        let reopened = SqliteCacheStore::new(&path).unwrap();
        let entry = reopened.get(&fp).await.unwrap().unwrap();
        assert_eq!(entry.ttl, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = SqliteCacheStore::in_memory().unwrap();
        let now = Utc::now();
        let ttl = Duration::from_secs(3600);
        let expired = fingerprint("demo", 1, 1);
        let fresh = fingerprint("demo", 2, 2);

        store
            .put(&expired, &records("demo", 1, 1), now - TimeDelta::hours(2), ttl)
            .await
            .unwrap();
        store
            .put(&fresh, &records("demo", 2, 2), now - TimeDelta::minutes(5), ttl)
            .await
            .unwrap();

        assert_eq!(store.purge_expired(now).await.unwrap(), 1);
        assert!(store.get(&expired).await.unwrap().is_none());
        assert!(store.get(&fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bizmetrics.db");
        let fp = fingerprint("google-analytics", 1, 3);
        let stored = records("google-analytics", 1, 3);
        let fetched_at = Utc::now() - TimeDelta::hours(30);
        let ttl = Duration::from_secs(86_400);

        {
            let store = SqliteCacheStore::new(&path).unwrap();
            store.put(&fp, &stored, fetched_at, ttl).await.unwrap();
        }

        let reopened = SqliteCacheStore::new(&path).unwrap();
        let entry = reopened.get(&fp).await.unwrap().unwrap();
        assert_eq!(entry.records, stored);
        assert_eq!(entry.fetched_at, fetched_at);
        assert_eq!(entry.ttl, ttl);
        // enough to rebuild the staleness decision
        assert!(entry.age(Utc::now()) > TimeDelta::from_std(entry.ttl).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_on_shared_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        // Two handles stand in for two processes sharing the file
        let first = Arc::new(SqliteCacheStore::new(&path).unwrap());
        let second = Arc::new(SqliteCacheStore::new(&path).unwrap());
        let fp = fingerprint("meta-ads", 1, 10);
        let ttl = Duration::from_secs(60);

        let mut handles = Vec::new();
        for writer in 0..8u32 {
            let store = if writer % 2 == 0 {
                Arc::clone(&first)
            } else {
                Arc::clone(&second)
            };
            let fp = fp.clone();
            handles.push(tokio::spawn(async move {
                let batch: Vec<_> = (1..=1 + writer)
                    .map(|d| {
                        MetricRecord::new("meta-ads", day(d))
                            .with_dimension("writer", writer.to_string())
                    })
                    .collect();
                for _ in 0..5 {
                    store.put(&fp, &batch, Utc::now(), ttl).await?;
                    if let Some(entry) = store.get(&fp).await? {
                        let tag = entry.records[0].dimensions["writer"].clone();
                        assert!(entry.records.iter().all(|r| r.dimensions["writer"] == tag));
                    }
                }
                Ok::<_, MetricsError>(())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let entry = second.get(&fp).await.unwrap().unwrap();
        let writer: usize = entry.records[0].dimensions["writer"].parse().unwrap();
        assert_eq!(entry.records.len(), writer + 1);
        assert_eq!(first.stats().await.unwrap().entry_count, 1);
    }
}
