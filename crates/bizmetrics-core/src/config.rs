//! Configuration types.
//!
//! [`Settings`] is the top-level configuration, usually parsed from TOML:
//!
//! ```toml
//! cache_path = "/var/cache/bizmetrics/bizmetrics.db"
//! default_ttl_secs = 86400
//!
//! [connectors.google-analytics]
//! property_id = "123456789"
//! access_token = "ya29...."
//! ttl_secs = 3600
//!
//! [connectors.meta-ads]
//! access_token = "EAAB..."
//! ad_account_id = "act_123456789"
//! ```
//!
//! Keys of a connector table other than the typed options below are treated as
//! credentials.

use serde::{Deserialize, Deserializer, de};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MetricsError, Result};

/// Default freshness window for cached entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default time to wait on a locked database before giving up.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Default upstream request timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Cache database file name inside the cache directory.
const CACHE_FILE_NAME: &str = "bizmetrics.db";

/// Per-connector settings.
///
/// Built once by the configuration loader and handed to a connector factory by
/// reference; connectors copy what they need.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Freshness override for this connector's entries.
    pub ttl_secs: Option<u64>,
    /// Alternative API endpoint.
    pub base_url: Option<String>,
    /// Upstream request timeout.
    pub timeout_secs: Option<u64>,
    /// Rows requested per page from paginated APIs.
    pub page_size: Option<u32>,
    /// Credential values by name (e.g., `access_token`).
    ///
    /// Numeric and boolean TOML values are kept in their textual form.
    #[serde(flatten, deserialize_with = "scalar_credentials")]
    pub credentials: BTreeMap<String, String>,
}

fn scalar_credentials<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    BTreeMap::<String, toml::Value>::deserialize(deserializer)?
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(de::Error::custom(format!(
                        "credential `{key}` must be a string, number or boolean, found {}",
                        other.type_str()
                    )));
                }
            };
            Ok((key, text))
        })
        .collect()
}

impl fmt::Debug for ConnectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorConfig")
            .field("ttl_secs", &self.ttl_secs)
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("page_size", &self.page_size)
            .field(
                "credentials",
                &self
                    .credentials
                    .keys()
                    .map(|k| (k.as_str(), "[REDACTED]"))
                    .collect::<BTreeMap<_, _>>(),
            )
            .finish()
    }
}

impl ConnectorConfig {
    /// Creates an empty configuration (demo mode for every connector).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a credential.
    #[must_use]
    pub fn with_credential(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.insert(key.into(), value.into());
        self
    }

    /// Sets the TTL override.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = Some(ttl.as_secs());
        self
    }

    /// Sets the API endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Returns a credential if present and non-blank.
    #[must_use]
    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Returns true if every credential in `keys` is present and non-blank.
    #[must_use]
    pub fn has_credentials(&self, keys: &[&str]) -> bool {
        keys.iter().all(|k| self.credential(k).is_some())
    }

    /// Upstream request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    /// TTL override, if configured.
    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

/// Global default TTL with per-connector overrides.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TtlPolicy {
    default: Duration,
    overrides: HashMap<String, Duration>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl TtlPolicy {
    /// Creates a policy applying `default` to every connector.
    #[must_use]
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Overrides the TTL for one connector.
    #[must_use]
    pub fn with_override(mut self, connector: impl Into<String>, ttl: Duration) -> Self {
        self.overrides.insert(connector.into(), ttl);
        self
    }

    /// TTL applied to entries written for `connector`.
    #[must_use]
    pub fn ttl_for(&self, connector: &str) -> Duration {
        self.overrides
            .get(connector)
            .copied()
            .unwrap_or(self.default)
    }

    /// The global default.
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        self.default
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// SQLite cache file.
    pub cache_path: PathBuf,
    /// TTL for connectors without an override.
    pub default_ttl_secs: u64,
    /// How long a writer waits on another process's lock.
    pub busy_timeout_ms: u64,
    /// Connector tables by connector name.
    pub connectors: BTreeMap<String, ConnectorConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            default_ttl_secs: DEFAULT_TTL.as_secs(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            connectors: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Parses settings from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| MetricsError::Config(e.to_string()))
    }

    /// Reads and parses a TOML settings file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MetricsError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Builds the TTL policy from the global default and connector overrides.
    #[must_use]
    pub fn ttl_policy(&self) -> TtlPolicy {
        self.connectors.iter().fold(
            TtlPolicy::new(Duration::from_secs(self.default_ttl_secs)),
            |policy, (name, config)| match config.ttl() {
                Some(ttl) => policy.with_override(name.clone(), ttl),
                None => policy,
            },
        )
    }

    /// Configuration for a connector; empty (demo mode) if none is set.
    #[must_use]
    pub fn connector(&self, name: &str) -> ConnectorConfig {
        self.connectors.get(name).cloned().unwrap_or_default()
    }

    /// Lock wait for the cache database.
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Platform cache directory (`~/.cache/bizmetrics/` on Linux) joined with the
/// database file name.
#[must_use]
pub fn default_cache_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "bizmetrics")
        .map(|dirs| dirs.cache_dir().join(CACHE_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(".bizmetrics").join(CACHE_FILE_NAME))
}
