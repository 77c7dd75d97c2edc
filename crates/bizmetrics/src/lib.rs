#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/bizmetrics/bizmetrics/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Unified entry point for bizmetrics.
//!
//! Re-exports the core types, the cache stores and the connectors enabled by
//! features, and provides the [`FetchOrchestrator`] that ties them together.

// Re-export everything from core
pub use bizmetrics_core::*;

// Re-export cache implementations
pub use bizmetrics_cache::{InMemoryCacheStore, NoopCacheStore};

#[cfg(feature = "cache-sqlite")]
pub use bizmetrics_cache::SqliteCacheStore;

// Re-export connectors based on features
pub use bizmetrics_demo::DemoConnector;

#[cfg(feature = "ga4")]
pub use bizmetrics_ga4::{Ga4Connector, Ga4SampleConnector};

#[cfg(feature = "meta")]
pub use bizmetrics_meta::{MetaAdsConnector, MetaSampleConnector};

/// Cached record access for exporters.
pub mod export;
mod orchestrator;

pub use orchestrator::{
    ConnectorInfo, FetchOrchestrator, FetchOrchestratorBuilder, FetchOutcome, FetchPolicy,
    FetchStatus, StaleDataWarning, is_fresh,
};
