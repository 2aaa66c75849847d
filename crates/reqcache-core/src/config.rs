//! Centralized configuration for reqcache.
//!
//! Defaults live in [`CacheDefaults`]; the per-instance settings (cache
//! directory, error sink) live in [`CacheConfig`].

use crate::error::CacheError;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Default values for the cache engine.
pub struct CacheDefaults;

impl CacheDefaults {
    // Lock file handling
    pub const LOCK_STALE: Duration = Duration::from_secs(10);
    pub const LOCK_SUFFIX: &'static str = ".lock";
    pub const LOCK_RECLAIM_SUFFIX: &'static str = ".reclaim";

    // Lock retry schedule
    pub const RETRIES: u32 = 0;
    pub const RETRY_FACTOR: f64 = 2.0;
    pub const RETRY_MIN_TIMEOUT: Duration = Duration::from_secs(1);
    pub const RETRY_MAX_TIMEOUT: Duration = Duration::from_secs(60);

    // Disk layout
    pub const CACHE_DIR_NAME: &'static str = "reqcache";
    pub const META_SUFFIX: &'static str = ".json";
    pub const GZIP_FLAG_FIELD: &'static str = "_gzipResponse";
    pub const DISK_READ_CHUNK_SIZE: usize = 64 * 1024;

    // Relay
    pub const RELAY_CAPACITY: usize = 32;
    pub const CAPTURE_CAPACITY: usize = 32;
    pub const REQUEST_NOTIFICATION_CAPACITY: usize = 64;

    // Synthetic responses
    pub const FROM_CACHE_HEADER: &'static str = "x-from-cache";
    pub const HIT_STATUS: u16 = 200;
}

/// Process-wide error handler.
pub type ErrorSink = Arc<dyn Fn(&CacheError) + Send + Sync>;

/// Per-instance cache configuration.
#[derive(Clone)]
pub struct CacheConfig {
    /// Directory holding cache entries. Created on demand.
    pub cache_directory: PathBuf,
    /// Receives errors that are not delivered to a caller. Logged when absent.
    pub error_sink: Option<ErrorSink>,
    /// Bounded capacity of each call's relay event channel.
    pub relay_capacity: usize,
}

impl CacheConfig {
    /// Create a config for the given directory.
    pub fn new(cache_directory: impl Into<PathBuf>) -> Self {
        Self {
            cache_directory: cache_directory.into(),
            ..Self::default()
        }
    }

    /// Fallback cache directory: the platform cache dir, else the temp dir.
    pub fn default_directory() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(CacheDefaults::CACHE_DIR_NAME)
    }

    pub(crate) fn reporter(&self) -> ErrorReporter {
        ErrorReporter {
            sink: self.error_sink.clone(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_directory: Self::default_directory(),
            error_sink: None,
            relay_capacity: CacheDefaults::RELAY_CAPACITY,
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("cache_directory", &self.cache_directory)
            .field("error_sink", &self.error_sink.as_ref().map(|_| "<fn>"))
            .field("relay_capacity", &self.relay_capacity)
            .finish()
    }
}

/// Routes out-of-band errors to the configured sink.
#[derive(Clone, Default)]
pub(crate) struct ErrorReporter {
    sink: Option<ErrorSink>,
}

impl ErrorReporter {
    pub(crate) fn report(&self, err: &CacheError) {
        match &self.sink {
            Some(sink) => sink(err),
            None => error!("reqcache: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_default_directory_name() {
        assert!(CacheConfig::default_directory().ends_with(CacheDefaults::CACHE_DIR_NAME));
    }

    #[test]
    fn test_reporter_uses_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let config = CacheConfig {
            error_sink: Some(Arc::new(move |e: &CacheError| {
                seen_clone.lock().unwrap().push(e.to_string());
            })),
            ..CacheConfig::new("/tmp/reqcache-test")
        };

        config.reporter().report(&CacheError::InputClosed);
        assert_eq!(seen.lock().unwrap().as_slice(), ["Request body already ended"]);
    }

    #[test]
    fn test_reporter_without_sink_does_not_panic() {
        ErrorReporter::default().report(&CacheError::transport("offline"));
    }
}
