//! Cache keys for fetch requests.
//!
//! A [`FetchFingerprint`] identifies one logical request: the connector, the date
//! range and the normalized [`RequestParams`]. Two requests with equal
//! fingerprints share a single cache entry.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::DateRange;

/// Version tag mixed into every digest so the canonical encoding can evolve
/// without colliding with entries written by older builds.
const FINGERPRINT_VERSION: &str = "bizmetrics-fp-v1";

/// Normalized connector-specific request parameters.
///
/// Keys are trimmed and lowercased, values are trimmed, and entries with an
/// empty key are dropped. Iteration is always in key order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>")]
pub struct RequestParams(BTreeMap<String, String>);

impl RequestParams {
    /// Creates an empty parameter set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Inserts a parameter, normalizing key and value.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl AsRef<str>) {
        let key = key.as_ref().trim().to_lowercase();
        if key.is_empty() {
            return;
        }
        self.0.insert(key, value.as_ref().trim().to_string());
    }

    /// Builder form of [`RequestParams::insert`].
    #[must_use]
    pub fn with(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.insert(key, value);
        self
    }

    /// Returns a parameter value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_lowercase()).map(String::as_str)
    }

    /// Splits a comma-separated parameter into its non-empty items.
    #[must_use]
    pub fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }

    /// Returns true if no parameters are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the parameters in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for RequestParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

impl From<BTreeMap<String, String>> for RequestParams {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

/// Deterministic identifier of a fetch request.
///
/// Deserialization recomputes the digest and rejects one that does not match.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawFingerprint")]
pub struct FetchFingerprint {
    connector: String,
    range: DateRange,
    params: RequestParams,
    digest: String,
}

#[derive(Deserialize)]
struct RawFingerprint {
    connector: String,
    range: DateRange,
    params: RequestParams,
    digest: String,
}

impl TryFrom<RawFingerprint> for FetchFingerprint {
    type Error = String;

    fn try_from(raw: RawFingerprint) -> Result<Self, Self::Error> {
        let computed = Self::compute(&raw.connector, raw.range, &raw.params);
        if computed.digest != raw.digest {
            return Err(format!("digest {} does not match {computed}", raw.digest));
        }
        Ok(computed)
    }
}

impl FetchFingerprint {
    /// Computes the fingerprint of a request.
    #[must_use]
    pub fn compute(connector: &str, range: DateRange, params: &RequestParams) -> Self {
        let mut hasher = Sha256::new();
        feed(&mut hasher, FINGERPRINT_VERSION);
        feed(&mut hasher, connector);
        feed(&mut hasher, &range.start().to_string());
        feed(&mut hasher, &range.end().to_string());
        for (key, value) in params.iter() {
            feed(&mut hasher, key);
            feed(&mut hasher, value);
        }
        Self {
            connector: connector.to_string(),
            range,
            params: params.clone(),
            digest: hex::encode(hasher.finalize()),
        }
    }

    /// Rebuilds a fingerprint from persisted parts without rehashing.
    #[must_use]
    pub fn from_parts(
        connector: impl Into<String>,
        range: DateRange,
        params: RequestParams,
        digest: impl Into<String>,
    ) -> Self {
        Self {
            connector: connector.into(),
            range,
            params,
            digest: digest.into(),
        }
    }

    /// Connector the request targets.
    #[must_use]
    pub fn connector(&self) -> &str {
        &self.connector
    }

    /// Requested date range.
    #[must_use]
    pub const fn range(&self) -> DateRange {
        self.range
    }

    /// Normalized request parameters.
    #[must_use]
    pub const fn params(&self) -> &RequestParams {
        &self.params
    }

    /// Lowercase hex SHA-256 digest; the store key.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// Length-prefixes each component so adjacent fields can never run together.
fn feed(hasher: &mut Sha256, part: &str) {
    hasher.update((part.len() as u64).to_le_bytes());
    hasher.update(part.as_bytes());
}

impl fmt::Display for FetchFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.digest.get(..12).unwrap_or(&self.digest);
        write!(f, "{}:{}", self.connector, short)
    }
}
