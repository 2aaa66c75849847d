//! Caller-supplied request descriptors.
//!
//! A descriptor carries both the identity of an exchange (method, URL, headers,
//! payload) and the cache policy applied to it (`ttl`, `gzipResponse`,
//! `lockOpt`). Only the identity part feeds the cache key.

use crate::lock::LockOptions;
use crate::transport::Headers;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// A single request as submitted by the caller.
///
/// Field names follow the camelCase configuration surface so descriptors can be
/// loaded straight from JSON:
///
/// ```
/// use reqcache_core::RequestDescriptor;
///
/// let descriptor: RequestDescriptor = serde_json::from_value(serde_json::json!({
///     "url": "http://example.test/items",
///     "method": "POST",
///     "json": { "a": 1 },
///     "ttl": 5000,
///     "lockOpt": { "retries": 3 }
/// }))
/// .unwrap();
/// assert_eq!(descriptor.ttl().as_millis(), 5000);
/// assert!(descriptor.gzip_response);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Alias for `url`, consulted only when `url` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// HTTP method; `GET` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    /// Query parameters appended to the URL.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub qs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_data: Option<BTreeMap<String, String>>,
    /// JSON payload, or `true` to only request a parsed JSON response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    /// Freshness window in milliseconds (0 = never fresh).
    #[serde(default)]
    pub ttl: u64,
    /// Store bodies gzip-compressed on disk. Never affects delivered bytes.
    #[serde(default = "default_gzip_response")]
    pub gzip_response: bool,
    #[serde(default)]
    pub lock_opt: LockOptions,
}

fn default_gzip_response() -> bool {
    true
}

impl Default for RequestDescriptor {
    fn default() -> Self {
        Self {
            url: None,
            uri: None,
            method: None,
            headers: Headers::new(),
            qs: BTreeMap::new(),
            body: None,
            form: None,
            form_data: None,
            json: None,
            ttl: 0,
            gzip_response: true,
            lock_opt: LockOptions::default(),
        }
    }
}

/// Outgoing request payload, chosen by precedence body > form > formData > json.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Text(String),
    Form(BTreeMap<String, String>),
    Multipart(BTreeMap<String, String>),
    Json(Value),
}

impl RequestDescriptor {
    /// Create a descriptor for the given method and URL.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            method: Some(method.into()),
            ..Self::default()
        }
    }

    /// Create a `GET` descriptor.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    /// Set the freshness window.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl.as_millis().min(u128::from(u64::MAX)) as u64;
        self
    }

    /// Add a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.qs.insert(name.into(), value.into());
        self
    }

    /// Set a raw text body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set a JSON payload (also requests a parsed JSON response).
    pub fn with_json(mut self, json: Value) -> Self {
        self.json = Some(json);
        self
    }

    /// Enable or disable on-disk compression.
    pub fn with_gzip_response(mut self, enable: bool) -> Self {
        self.gzip_response = enable;
        self
    }

    /// Set lock acquisition options.
    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock_opt = options;
        self
    }

    /// Freshness window as a duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl)
    }

    /// Effective method.
    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or("GET")
    }

    /// Effective URL before query merging (`url`, else `uri`).
    pub fn raw_url(&self) -> Option<&str> {
        self.url.as_deref().or(self.uri.as_deref())
    }

    /// Whether the caller asked for the response body to be parsed as JSON.
    pub fn wants_json(&self) -> bool {
        !matches!(self.json, None | Some(Value::Bool(false)))
    }

    /// The payload as it participates in the cache key.
    pub fn payload_value(&self) -> Value {
        if let Some(body) = &self.body {
            return Value::String(body.clone());
        }
        if let Some(form) = self.form.as_ref().or(self.form_data.as_ref()) {
            return string_map_value(form);
        }
        match &self.json {
            Some(json) => json.clone(),
            None => Value::String(String::new()),
        }
    }

    /// The payload the transport should send.
    pub fn payload(&self) -> Payload {
        if let Some(body) = &self.body {
            Payload::Text(body.clone())
        } else if let Some(form) = &self.form {
            Payload::Form(form.clone())
        } else if let Some(form_data) = &self.form_data {
            Payload::Multipart(form_data.clone())
        } else {
            match &self.json {
                None | Some(Value::Bool(_)) => Payload::Empty,
                Some(json) => Payload::Json(json.clone()),
            }
        }
    }
}

fn string_map_value(map: &BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}
