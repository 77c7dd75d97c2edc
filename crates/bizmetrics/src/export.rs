//! Read-only access to cached records for exporters.
//!
//! Nothing here calls a connector: exports see exactly what the cache holds.

use std::collections::BTreeSet;

use chrono::Datelike;
use polars::prelude::*;
use tracing::debug;

use bizmetrics_core::{CacheStore, MetricRecord, MetricsError, Result};

/// `NaiveDate::num_days_from_ce` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// All cached records, optionally for one connector, ordered by source then date.
///
/// Records from overlapping entries are returned as stored.
///
/// # Errors
/// Returns an error if the store cannot be read.
pub async fn cached_records(
    store: &dyn CacheStore,
    connector: Option<&str>,
) -> Result<Vec<MetricRecord>> {
    let entries = store.entries(connector).await?;
    let mut records: Vec<MetricRecord> = entries
        .into_iter()
        .flat_map(|entry| entry.records)
        .collect();
    records.sort_by(|a, b| a.source.cmp(&b.source).then(a.date.cmp(&b.date)));

    debug!(
        connector = connector.unwrap_or("*"),
        count = records.len(),
        "Collected cached records"
    );
    Ok(records)
}

/// Records of the most recently fetched entry for `connector`, whatever its age.
///
/// Returns an empty list if nothing is cached for the connector.
///
/// # Errors
/// Returns an error if the store cannot be read.
pub async fn latest_records(store: &dyn CacheStore, connector: &str) -> Result<Vec<MetricRecord>> {
    Ok(store
        .latest(connector)
        .await?
        .map(|entry| entry.records)
        .unwrap_or_default())
}

/// Builds a frame with one row per record.
///
/// Columns are `source`, `date`, then one string column per dimension key and
/// one `f64` column per metric key, each group sorted by name. Records lacking
/// a key get a null in that column.
///
/// # Errors
/// Returns [`MetricsError::Export`] if polars rejects the columns.
pub fn records_to_frame(records: &[MetricRecord]) -> Result<DataFrame> {
    let dimension_keys: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.dimensions.keys().map(String::as_str))
        .collect();
    let metric_keys: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.metrics.keys().map(String::as_str))
        .collect();

    let sources: Vec<&str> = records.iter().map(|r| r.source.as_str()).collect();
    let dates: Vec<i32> = records
        .iter()
        .map(|r| r.date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
        .collect();

    let mut columns = vec![
        Column::new("source".into(), sources),
        Column::new("date".into(), dates),
    ];
    for key in &dimension_keys {
        let values: Vec<Option<&str>> = records
            .iter()
            .map(|r| r.dimensions.get(*key).map(String::as_str))
            .collect();
        columns.push(Column::new((*key).into(), values));
    }
    for key in &metric_keys {
        let values: Vec<Option<f64>> = records.iter().map(|r| r.metric(key)).collect();
        columns.push(Column::new((*key).into(), values));
    }

    let df = DataFrame::new(columns).map_err(|e| MetricsError::Export(e.to_string()))?;

    df.lazy()
        .with_column(col("date").cast(DataType::Date))
        .collect()
        .map_err(|e| MetricsError::Export(e.to_string()))
}
