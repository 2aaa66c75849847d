//! On-disk cache entries.
//!
//! An entry is a body file named by the cache key and a `.json` metadata file
//! next to it holding the response headers plus an internal
//! `_gzipResponse` flag. The body file's mtime is the entry's age.

mod atomic;
mod codec;
pub mod reader;
pub mod writer;

pub use atomic::{read_json, write_json_atomic};
pub use codec::{is_transport_compressed, GzipChunkDecoder, GzipChunkEncoder};
pub use reader::{is_fresh, ReadOutcome};
pub(crate) use reader::try_read;
pub use writer::{plan_capture, CapturePlan, EntryCapture};

use crate::transport::Headers;
use serde::{Deserialize, Serialize};

/// Contents of an entry's metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Whether the body was stored with on-disk compression enabled.
    #[serde(rename = "_gzipResponse", default)]
    pub gzip_response: bool,
    /// Response headers as received from the transport.
    #[serde(flatten)]
    pub headers: Headers,
}
