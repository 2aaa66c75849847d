//! Incremental gzip for streamed bodies.
//!
//! Both directions wrap a `flate2` writer over an in-memory buffer and drain
//! it after every chunk, so compression happens chunk by chunk without
//! blocking on file I/O.

use crate::transport::{header, Headers};
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use std::io::{self, Write};

/// Whether the response body is already content-encoded by the server.
///
/// Such bodies are stored and replayed byte for byte.
pub fn is_transport_compressed(headers: &Headers) -> bool {
    header(headers, "content-encoding")
        .map(str::trim)
        .map(|encoding| !encoding.is_empty() && !encoding.eq_ignore_ascii_case("identity"))
        .unwrap_or(false)
}

/// Chunk-at-a-time gzip compressor.
pub struct GzipChunkEncoder {
    inner: GzEncoder<Vec<u8>>,
}

impl GzipChunkEncoder {
    pub fn new() -> Self {
        Self {
            inner: GzEncoder::new(Vec::new(), Compression::default()),
        }
    }

    /// Compress a chunk, returning whatever output is ready.
    pub fn encode(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        self.inner.write_all(chunk)?;
        Ok(std::mem::take(self.inner.get_mut()))
    }

    /// Flush the trailer.
    pub fn finish(self) -> io::Result<Vec<u8>> {
        self.inner.finish()
    }
}

impl Default for GzipChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Chunk-at-a-time gzip decompressor.
pub struct GzipChunkDecoder {
    inner: GzDecoder<Vec<u8>>,
}

impl GzipChunkDecoder {
    pub fn new() -> Self {
        Self {
            inner: GzDecoder::new(Vec::new()),
        }
    }

    /// Decompress a chunk, returning whatever output is ready.
    pub fn decode(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        self.inner.write_all(chunk)?;
        Ok(std::mem::take(self.inner.get_mut()))
    }

    /// Drain remaining output and check the trailer.
    pub fn finish(mut self) -> io::Result<Vec<u8>> {
        self.inner.try_finish()?;
        let tail = std::mem::take(self.inner.get_mut());
        self.inner.finish()?;
        Ok(tail)
    }
}

impl Default for GzipChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}
