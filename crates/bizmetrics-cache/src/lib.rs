#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/bizmetrics/bizmetrics/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Cache store implementations for fetch results.
//!
//! This crate provides implementations of the [`CacheStore`] trait from `bizmetrics-core`:
//!
//! - [`SqliteCacheStore`] - Durable SQLite store safe for concurrent processes (default, requires `sqlite` feature)
//! - [`InMemoryCacheStore`] - Simple in-memory store for testing
//! - [`NoopCacheStore`] - No-op store that doesn't keep anything

/// In-memory cache store.
pub mod memory;
/// No-op cache store.
pub mod noop;

/// SQLite-based cache store.
#[cfg(feature = "sqlite")]
pub mod sqlite;

// Re-export the trait for convenience
pub use bizmetrics_core::CacheStore;

// Re-export implementations
pub use memory::InMemoryCacheStore;
pub use noop::NoopCacheStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCacheStore;
