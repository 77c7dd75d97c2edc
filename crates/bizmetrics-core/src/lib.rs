#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/bizmetrics/bizmetrics/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Core traits and types for business metrics connectors.
//!
//! This crate provides the foundational abstractions shared by connectors,
//! cache stores and the orchestrator:
//!
//! - [`Connector`](connector::Connector) - Data source contract
//! - [`CacheStore`](cache::CacheStore) - Durable cache abstraction
//! - [`FetchFingerprint`](fingerprint::FetchFingerprint) - Cache key of a fetch request
//! - [`MetricRecord`](types::MetricRecord) - Normalized record shape

/// Cache store trait and entry types.
pub mod cache;
/// Connector configuration, TTL policy and settings.
pub mod config;
/// Connector trait for fetching metrics.
pub mod connector;
/// Error types for metrics operations.
pub mod error;
/// Request fingerprints and parameters.
pub mod fingerprint;
/// Paginated response accumulation.
pub mod pagination;
/// Core data types (DateRange, MetricRecord).
pub mod types;

// Re-export commonly used items at crate root
pub use cache::{CacheEntry, CacheStats, CacheStore, ConnectorStats, ensure_storable};
pub use config::{ConnectorConfig, Settings, TtlPolicy};
pub use connector::{Connector, ConnectorMode, check_lookback};
pub use error::{MetricsError, Result};
pub use fingerprint::{FetchFingerprint, RequestParams};
pub use pagination::{Page, collect_pages};
pub use types::{DateRange, MetricRecord};
