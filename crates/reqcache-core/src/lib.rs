//! Reqcache Core - Disk-backed cache for request/response exchanges.
//!
//! Each exchange is identified by its method, URL, headers and payload. Fresh
//! entries are answered from disk with a synthetic `200` carrying
//! `x-from-cache: 1`; misses go to an injected [`Transport`] while the live
//! response is streamed to the caller and persisted at the same time.
//!
//! Entries are guarded by a lock file per key, so concurrent identical calls
//! (in one process or many) reach the transport once when lock retries are
//! configured.
//!
//! # Example
//!
//! ```rust,ignore
//! use reqcache_core::{RequestCache, RequestDescriptor, ReqwestTransport};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> reqcache_core::Result<()> {
//!     let cache = RequestCache::builder(ReqwestTransport::new())
//!         .cache_directory("/tmp/reqcache")
//!         .build();
//!
//!     let descriptor = RequestDescriptor::get("https://example.com/items")
//!         .with_ttl(Duration::from_secs(60));
//!
//!     let response = cache.fetch(descriptor.clone()).await?;
//!     println!("{} ({} bytes)", response.head.status, response.body.len());
//!
//!     // Streaming form
//!     let mut relay = cache.call(descriptor)?;
//!     relay.end_input();
//!     let head = relay.response().await?;
//!     assert!(head.from_cache());
//!     while let Some(chunk) = relay.chunk().await? {
//!         println!("{} bytes", chunk.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod key;
pub mod lock;
pub mod relay;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use cache::{FetchedResponse, RequestCache, RequestCacheBuilder};
pub use config::{CacheConfig, CacheDefaults, ErrorSink};
pub use descriptor::{Payload, RequestDescriptor};
pub use error::{CacheError, Result};
pub use key::{CacheKey, CachePaths, CanonicalRequest};
pub use lock::{EntryLock, LockOptions, RetryPolicy};
pub use relay::{PersistSignal, Relay, RelayEvent};
pub use store::EntryMetadata;
pub use transport::{
    Headers, RequestBody, ResponseHead, Transport, TransportNotice, TransportNotices,
    TransportRequest, TransportResponse,
};

#[cfg(feature = "reqwest-transport")]
pub use transport::ReqwestTransport;
