//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use reqcache_core::{
    CacheError, Headers, LockOptions, RequestCache, Result, RetryPolicy, Transport,
    TransportNotice, TransportNotices, TransportRequest, TransportResponse,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// How a scripted exchange fails, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    None,
    /// Fail before any response head.
    Connect,
    /// Deliver the first chunk, then fail the body stream.
    MidStream,
}

/// What the scripted transport answers with.
#[derive(Debug, Clone)]
pub enum Reply {
    Fixed(Bytes),
    /// `{"n": <invocation number>, "method": ..., "echo": <request json>}`
    CountedJson,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub status: u16,
    pub headers: Headers,
    pub reply: Reply,
    pub chunk_size: usize,
    pub delay: Duration,
    pub failure: Failure,
    pub notices: Vec<TransportNotice>,
    /// Wait for the caller's request body before answering.
    pub read_body: bool,
}

impl Script {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            headers: Headers::from([(
                "content-type".to_string(),
                "application/octet-stream".to_string(),
            )]),
            reply: Reply::Fixed(body.into()),
            chunk_size: 16 * 1024,
            delay: Duration::ZERO,
            failure: Failure::None,
            notices: Vec::new(),
            read_body: false,
        }
    }

    pub fn counted_json() -> Self {
        Self {
            headers: Headers::from([("content-type".to_string(), "application/json".to_string())]),
            reply: Reply::CountedJson,
            ..Self::ok(Bytes::new())
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_failure(mut self, failure: Failure) -> Self {
        self.failure = failure;
        self
    }

    pub fn with_notices(mut self, notices: Vec<TransportNotice>) -> Self {
        self.notices = notices;
        self
    }

    pub fn reading_body(mut self) -> Self {
        self.read_body = true;
        self
    }
}

/// In-memory transport that counts invocations and records request bodies.
#[derive(Clone)]
pub struct ScriptedTransport {
    script: Arc<Script>,
    calls: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Bytes>>>,
}

impl ScriptedTransport {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            calls: Arc::new(AtomicUsize::new(0)),
            bodies: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn bodies(&self) -> Vec<Bytes> {
        self.bodies.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: TransportRequest,
        notices: TransportNotices,
    ) -> Result<TransportResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let script = &self.script;

        for notice in &script.notices {
            notices.emit(*notice);
        }
        if script.read_body {
            let body = request.body.collect().await;
            self.bodies.lock().unwrap().push(body);
        }
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        if script.failure == Failure::Connect {
            return Err(CacheError::transport(format!("connection refused: {}", request.url)));
        }

        let body = match &script.reply {
            Reply::Fixed(body) => body.clone(),
            Reply::CountedJson => {
                let echo = match request.payload {
                    reqcache_core::Payload::Json(value) => value,
                    _ => serde_json::Value::Null,
                };
                let value = serde_json::json!({ "n": n, "method": request.method, "echo": echo });
                Bytes::from(serde_json::to_vec(&value).unwrap())
            }
        };

        let mut chunks: Vec<std::io::Result<Bytes>> = body
            .chunks(script.chunk_size.max(1))
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        if script.failure == Failure::MidStream {
            chunks.truncate(1);
            chunks.push(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }

        Ok(TransportResponse::new(
            script.status,
            script.headers.clone(),
            stream::iter(chunks),
        ))
    }
}

/// Cache over a scripted transport in a fresh directory.
pub struct Harness {
    pub dir: TempDir,
    pub transport: ScriptedTransport,
    pub cache: RequestCache,
    pub reported: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    pub fn new(script: Script) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("Failed to create temp dir");
        let transport = ScriptedTransport::new(script);
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink_reported = reported.clone();
        let cache = RequestCache::builder(transport.clone())
            .cache_directory(dir.path().join("cache"))
            .error_sink(move |err| sink_reported.lock().unwrap().push(err.to_string()))
            .build();
        Self {
            dir,
            transport,
            cache,
            reported,
        }
    }

    pub fn reported(&self) -> Vec<String> {
        self.reported.lock().unwrap().clone()
    }

    /// Names in the cache directory, sorted; empty if it was never created.
    pub fn entries(&self) -> Vec<String> {
        let Ok(read) = std::fs::read_dir(self.cache.cache_directory()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = read
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// Lock options generous enough for hundreds of contenders.
pub fn patient_lock(retries: u32) -> LockOptions {
    LockOptions::with_retries(
        RetryPolicy::new(retries)
            .with_factor(1.2)
            .with_timeouts(Duration::from_millis(5), Duration::from_millis(50))
            .with_randomize(true),
    )
}

/// Deterministic, poorly compressible bytes.
pub fn noise(len: usize) -> Bytes {
    let mut state: u32 = 0x9e37_79b9;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect::<Vec<u8>>()
        .into()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
