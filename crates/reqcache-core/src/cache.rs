//! The cache engine.
//!
//! [`RequestCache::call`] derives the entry for a descriptor and spawns one
//! task per call that walks the entry through lock, lookup, transport and
//! capture, feeding the caller's [`Relay`] as it goes.

use crate::config::{CacheConfig, CacheDefaults, ErrorReporter, ErrorSink};
use crate::descriptor::RequestDescriptor;
use crate::error::{CacheError, Result};
use crate::key::{self, CacheKey, CachePaths};
use crate::lock;
use crate::relay::{self, Relay, RelaySink};
use crate::store::{self, EntryCapture, ReadOutcome};
use crate::transport::{RequestBody, ResponseHead, Transport, TransportRequest};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

/// Disk-backed cache in front of a [`Transport`].
///
/// Cheap to clone; clones share the directory, error sink and request
/// notifications.
#[derive(Clone)]
pub struct RequestCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    transport: Arc<dyn Transport>,
    directory: RwLock<PathBuf>,
    reporter: ErrorReporter,
    requests: broadcast::Sender<RequestDescriptor>,
    relay_capacity: usize,
}

/// Builder for [`RequestCache`].
///
/// # Example
///
/// ```rust,ignore
/// use reqcache_core::{RequestCache, ReqwestTransport};
///
/// let cache = RequestCache::builder(ReqwestTransport::new())
///     .cache_directory("/var/cache/my-app")
///     .error_sink(|err| eprintln!("cache: {err}"))
///     .build();
/// ```
pub struct RequestCacheBuilder {
    transport: Arc<dyn Transport>,
    config: CacheConfig,
}

impl RequestCacheBuilder {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Arc::new(transport),
            config: CacheConfig::default(),
        }
    }

    /// Directory holding cache entries.
    ///
    /// Default: the platform cache directory joined with `reqcache`.
    pub fn cache_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.config.cache_directory = directory.into();
        self
    }

    /// Handler for errors that are not delivered to a caller.
    ///
    /// Default: log through `tracing::error!`.
    pub fn error_sink(mut self, sink: impl Fn(&CacheError) + Send + Sync + 'static) -> Self {
        self.config.error_sink = Some(Arc::new(sink) as ErrorSink);
        self
    }

    /// Bounded capacity of each call's event channel.
    pub fn relay_capacity(mut self, capacity: usize) -> Self {
        self.config.relay_capacity = capacity;
        self
    }

    pub fn build(self) -> RequestCache {
        RequestCache::with_config(self.transport, self.config)
    }
}

/// Outcome of [`RequestCache::fetch`].
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub head: ResponseHead,
    pub body: Bytes,
    /// Parsed body when the descriptor asked for JSON and the body parsed.
    pub json: Option<Value>,
}

impl RequestCache {
    pub fn builder(transport: impl Transport + 'static) -> RequestCacheBuilder {
        RequestCacheBuilder::new(transport)
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: CacheConfig) -> Self {
        let (requests, _) = broadcast::channel(CacheDefaults::REQUEST_NOTIFICATION_CAPACITY);
        info!("Request cache at {}", config.cache_directory.display());
        Self {
            inner: Arc::new(CacheInner {
                transport,
                reporter: config.reporter(),
                directory: RwLock::new(config.cache_directory),
                requests,
                relay_capacity: config.relay_capacity,
            }),
        }
    }

    pub fn cache_directory(&self) -> PathBuf {
        self.inner
            .directory
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Point subsequent calls at another directory. Calls already running keep
    /// the directory they started with.
    pub fn set_cache_directory(&self, directory: impl Into<PathBuf>) {
        let directory = directory.into();
        debug!("Cache directory changed to {}", directory.display());
        *self
            .inner
            .directory
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = directory;
    }

    /// Receive every descriptor that actually reaches the transport.
    pub fn subscribe_requests(&self) -> broadcast::Receiver<RequestDescriptor> {
        self.inner.requests.subscribe()
    }

    /// Entry locations for `descriptor` in the current directory.
    pub fn paths_for(&self, descriptor: &RequestDescriptor) -> Result<CachePaths> {
        CachePaths::derive(&self.cache_directory(), descriptor)
    }

    /// Start a call.
    ///
    /// Descriptor errors are returned immediately; everything else arrives
    /// through the relay. Must be called within a tokio runtime.
    pub fn call(&self, descriptor: RequestDescriptor) -> Result<Relay> {
        let canonical = key::normalize(&descriptor)?;
        let paths = CachePaths::new(&self.cache_directory(), CacheKey::derive(&canonical)?);

        let (relay, mut sink, body) =
            relay::channel(self.inner.relay_capacity, self.inner.reporter.clone());
        let inner = self.inner.clone();
        let key = paths.key;
        tokio::spawn(async move {
            let exchanged = inner.exchange(descriptor, canonical.url, paths, &mut sink, body).await;
            if let Err(err) = exchanged {
                if err.is_persistence() {
                    warn!("cache storage failed for entry {}: {}", key, err);
                }
                sink.fail(err).await;
            }
        });
        Ok(relay)
    }

    /// Run a call to completion with an empty request body.
    pub async fn fetch(&self, descriptor: RequestDescriptor) -> Result<FetchedResponse> {
        let wants_json = descriptor.wants_json();
        let mut relay = self.call(descriptor)?;
        relay.end_input();
        let (head, body) = relay.collect().await?;

        let json = if wants_json && !body.is_empty() {
            match serde_json::from_slice(&body) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!("Response body is not JSON: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Ok(FetchedResponse { head, body, json })
    }
}

impl std::fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCache")
            .field("cache_directory", &self.cache_directory())
            .finish()
    }
}

impl CacheInner {
    async fn exchange(
        &self,
        descriptor: RequestDescriptor,
        url: Url,
        paths: CachePaths,
        sink: &mut RelaySink,
        body: RequestBody,
    ) -> Result<()> {
        ensure_directory(paths.directory()).await?;
        let mut entry_lock = lock::acquire(&paths.body, &descriptor.lock_opt).await?;

        match store::try_read(&paths, descriptor.ttl(), &mut entry_lock, sink).await {
            Ok(ReadOutcome::Hit) => return Ok(()),
            Ok(ReadOutcome::Miss) => {}
            Err(err @ CacheError::MissingMetadata { .. }) => {
                self.reporter.report(&err);
                remove_orphan(&paths.body).await;
            }
            Err(err) => {
                entry_lock.release().await;
                return Err(err);
            }
        }

        debug!("cache miss for {}, calling transport", paths.key);
        let _ = self.requests.send(descriptor.clone());

        let request = TransportRequest {
            method: descriptor.method().to_string(),
            url,
            headers: descriptor.headers.clone(),
            payload: descriptor.payload(),
            body,
        };
        let response = match self.transport.send(request, sink.notices()).await {
            Ok(response) => response,
            Err(err) => {
                entry_lock.release().await;
                return Err(err);
            }
        };
        let head = ResponseHead::new(response.status, response.headers);

        let capture = match store::plan_capture(&head, descriptor.gzip_response) {
            Some(plan) => {
                let reporter = self.reporter.clone();
                Some(EntryCapture::start(paths.clone(), plan, entry_lock, reporter))
            }
            None => {
                debug!("not caching status {} for {}", head.status, paths.key);
                entry_lock.release().await;
                None
            }
        };

        sink.response(head).await;

        let mut stream = response.body;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    if let Some(capture) = &capture {
                        capture.push(chunk.clone()).await;
                    }
                    sink.data(chunk).await;
                }
                Err(e) => {
                    if let Some(capture) = capture {
                        capture.abort();
                    }
                    return Err(CacheError::Upstream {
                        message: format!("response body for entry {} failed: {}", paths.key, e),
                        source: Some(e),
                    });
                }
            }
        }

        let persisted = match capture {
            Some(capture) => Some(capture.commit().await),
            None => None,
        };
        sink.end(persisted).await;
        Ok(())
    }
}

/// Delete a body whose metadata could not be read.
async fn remove_orphan(body: &Path) {
    match tokio::fs::remove_file(body).await {
        Ok(()) => debug!("removed orphaned body {}", body.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove orphaned body {}: {}", body.display(), e),
    }
}

async fn ensure_directory(directory: Option<&Path>) -> Result<()> {
    let Some(directory) = directory else {
        return Ok(());
    };
    tokio::fs::create_dir_all(directory)
        .await
        .map_err(|e| CacheError::io("Failed to create cache directory", directory, e))
}
