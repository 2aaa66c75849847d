//! Cache key derivation and entry paths.
//!
//! A descriptor is reduced to its identity (method, URL with merged query,
//! headers, payload), serialized to JSON with sorted keys, and hashed with a
//! 32-bit string hash. The decimal hash is the entry's filename stem.
//! Collisions are possible and accepted.

use crate::config::CacheDefaults;
use crate::descriptor::RequestDescriptor;
use crate::error::{CacheError, Result};
use crate::transport::Headers;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

/// The identity of a request, with policy fields dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRequest {
    pub method: String,
    #[serde(serialize_with = "serialize_url")]
    pub url: Url,
    pub headers: Headers,
    pub payload: Value,
}

fn serialize_url<S: Serializer>(url: &Url, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(url.as_str())
}

/// Reduce a descriptor to its canonical identity.
pub fn normalize(descriptor: &RequestDescriptor) -> Result<CanonicalRequest> {
    let raw = descriptor
        .raw_url()
        .ok_or_else(|| CacheError::descriptor("url", "either `url` or `uri` is required"))?;
    let mut url =
        Url::parse(raw).map_err(|e| CacheError::descriptor("url", format!("{}: {}", raw, e)))?;

    if !descriptor.qs.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in &descriptor.qs {
            match value {
                Value::String(s) => pairs.append_pair(name, s),
                other => pairs.append_pair(name, &other.to_string()),
            };
        }
    }

    Ok(CanonicalRequest {
        method: descriptor.method().to_string(),
        url,
        headers: descriptor.headers.clone(),
        payload: descriptor.payload_value(),
    })
}

/// Identifier of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(i32);

impl CacheKey {
    /// Hash the canonical JSON form of a request.
    pub fn derive(canonical: &CanonicalRequest) -> Result<Self> {
        let serialized = serde_json::to_string(canonical).map_err(|e| CacheError::Json {
            message: format!("Failed to serialize request identity: {}", e),
            source: Some(e),
        })?;
        Ok(Self(string_hash(&serialized)))
    }

    pub fn value(&self) -> i32 {
        self.0
    }
}

impl From<i32> for CacheKey {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 31-multiplier hash over UTF-16 code units, wrapping at 32 bits.
pub fn string_hash(input: &str) -> i32 {
    input
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Body and metadata locations of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub key: CacheKey,
    pub body: PathBuf,
    pub meta: PathBuf,
}

impl CachePaths {
    pub fn new(cache_directory: &Path, key: CacheKey) -> Self {
        let body = cache_directory.join(key.to_string());
        let mut meta = body.as_os_str().to_owned();
        meta.push(CacheDefaults::META_SUFFIX);
        Self {
            key,
            body,
            meta: PathBuf::from(meta),
        }
    }

    /// Normalize, hash and locate in one step.
    pub fn derive(cache_directory: &Path, descriptor: &RequestDescriptor) -> Result<Self> {
        let canonical = normalize(descriptor)?;
        Ok(Self::new(cache_directory, CacheKey::derive(&canonical)?))
    }

    pub fn directory(&self) -> Option<&Path> {
        self.body.parent()
    }
}
