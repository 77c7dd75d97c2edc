//! Error types for metrics operations.
//!
//! This module defines [`MetricsError`] which covers every failure that can occur
//! when validating a request, fetching from a connector, or reading and writing
//! the cache store.

use chrono::NaiveDate;
use thiserror::Error;

use crate::types::DateRange;

/// Errors that can occur during metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The requested range starts after it ends.
    #[error("Invalid date range: {start} is after {end}")]
    InvalidRange {
        /// Requested start date.
        start: NaiveDate,
        /// Requested end date.
        end: NaiveDate,
    },

    /// The upstream system could not be reached (network failure, timeout,
    /// rate limit, server error).
    #[error("Source {connector} unavailable: {reason}")]
    SourceUnavailable {
        /// Connector that failed.
        connector: String,
        /// Description of the failure.
        reason: String,
    },

    /// Credentials are missing or were rejected by the upstream system.
    #[error("Authentication failed for source {connector}: {reason}")]
    SourceAuth {
        /// Connector that failed.
        connector: String,
        /// Description of the failure.
        reason: String,
    },

    /// The upstream response could not be mapped into the record model, or the
    /// request itself was rejected before being sent.
    #[error("Data error from source {connector}: {reason}")]
    SourceData {
        /// Connector that failed.
        connector: String,
        /// Description of the failure.
        reason: String,
        /// The rejected range, when the failure concerns the requested dates.
        range: Option<DateRange>,
    },

    /// A persisted cache entry could not be deserialized.
    #[error("Corrupt cache entry {fingerprint}: {reason}")]
    StoreCorrupt {
        /// Digest of the unreadable entry.
        fingerprint: String,
        /// Deserialization failure.
        reason: String,
    },

    /// The storage engine failed (I/O, locking, schema).
    #[error("Cache store error: {0}")]
    Store(String),

    /// A strict fetch failed; the underlying connector error is attached.
    #[error("Fetch from {connector} failed")]
    FetchFailed {
        /// Connector that was asked for data.
        connector: String,
        /// The connector error.
        #[source]
        cause: Box<MetricsError>,
    },

    /// No connector is registered under the requested name.
    #[error("Unknown connector: {0}")]
    UnknownConnector(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cached records could not be assembled into a table.
    #[error("Export error: {0}")]
    Export(String),
}

impl MetricsError {
    /// Creates a [`MetricsError::SourceUnavailable`].
    pub fn unavailable(connector: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            connector: connector.into(),
            reason: reason.into(),
        }
    }

    /// Creates a [`MetricsError::SourceAuth`].
    pub fn auth(connector: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceAuth {
            connector: connector.into(),
            reason: reason.into(),
        }
    }

    /// Creates a [`MetricsError::SourceData`] without range metadata.
    pub fn data(connector: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceData {
            connector: connector.into(),
            reason: reason.into(),
            range: None,
        }
    }

    /// Classifies a non-success upstream HTTP status.
    ///
    /// 401/403 are credential failures, 408/429/5xx are transient outages and
    /// everything else means the request or response did not fit the contract.
    pub fn from_http_status(connector: impl Into<String>, status: u16, body: &str) -> Self {
        let reason = if body.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {body}")
        };
        match status {
            401 | 403 => Self::auth(connector, reason),
            408 | 429 | 500..=599 => Self::unavailable(connector, reason),
            _ => Self::data(connector, reason),
        }
    }

    /// Returns true if the orchestrator may answer this failure with stale data.
    #[must_use]
    pub const fn allows_stale_fallback(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. })
    }
}

/// Result type alias using [`MetricsError`].
pub type Result<T> = std::result::Result<T, MetricsError>;
