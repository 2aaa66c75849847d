//! Error types for reqcache.
//!
//! Errors are split by where they surface: descriptor and lock errors abort a
//! call before any I/O on the entry, transport errors abort the exchange, and
//! persistence errors are only ever handed to the process-wide error sink.

use std::path::PathBuf;
use thiserror::Error;

/// Boxed source error for collaborator failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for the cache engine.
#[derive(Debug, Error)]
pub enum CacheError {
    // Descriptor errors
    #[error("Invalid request descriptor ({field}): {message}")]
    InvalidDescriptor { field: String, message: String },

    // Lock errors
    #[error("Failed to lock cache entry {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Upstream body failed: {message}")]
    Upstream {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Cache entry errors
    #[error("Cache entry {body} has no readable metadata")]
    MissingMetadata {
        body: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Compression error: {message}")]
    Compression {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Relay errors
    #[error("Request body already ended")]
    InputClosed,
}

impl CacheError {
    /// Shorthand for descriptor validation failures.
    pub fn descriptor(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a transport failure without an underlying source.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a transport failure with its source error.
    pub fn transport_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub(crate) fn io(
        message: impl Into<String>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source),
        }
    }

    /// Whether this error comes from the cache's own storage rather than the
    /// transport or the caller.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Json { .. }
                | Self::Compression { .. }
                | Self::MissingMetadata { .. }
        )
    }
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
