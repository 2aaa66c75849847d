//! Serving a call from a fresh cache entry.

use super::{is_transport_compressed, read_json, EntryMetadata, GzipChunkDecoder};
use crate::config::CacheDefaults;
use crate::error::{CacheError, Result};
use crate::key::CachePaths;
use crate::lock::EntryLock;
use crate::relay::RelaySink;
use crate::transport::ResponseHead;
use bytes::Bytes;
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Result of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The caller received the cached response and end-of-data.
    Hit,
    /// Nothing usable on disk; the lock is untouched.
    Miss,
}

/// Whether an entry modified at `modified` is still within `ttl` at `now`.
///
/// A zero TTL is never fresh. An expiry past the representable range is.
pub fn is_fresh(modified: SystemTime, ttl: Duration, now: SystemTime) -> bool {
    if ttl.is_zero() {
        return false;
    }
    match modified.checked_add(ttl) {
        Some(expires) => now < expires,
        None => true,
    }
}

/// Serve the entry at `paths` if it exists and is younger than `ttl`.
///
/// On a hit the lock is released as soon as the metadata has been read, then
/// the synthetic response and body are written to `sink` followed by
/// end-of-data. A fresh body without readable metadata is reported as
/// [`CacheError::MissingMetadata`] with the lock still held.
pub(crate) async fn try_read(
    paths: &CachePaths,
    ttl: Duration,
    lock: &mut EntryLock,
    sink: &mut RelaySink,
) -> Result<ReadOutcome> {
    let modified = match fs::metadata(&paths.body).await.and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) => {
            debug!("cache miss for {}: {}", paths.key, e);
            return Ok(ReadOutcome::Miss);
        }
    };
    if !is_fresh(modified, ttl, SystemTime::now()) {
        debug!("cache entry {} is stale", paths.key);
        return Ok(ReadOutcome::Miss);
    }

    let metadata: EntryMetadata = read_json(&paths.meta)
        .await
        .map_err(|source| CacheError::MissingMetadata {
            body: paths.body.clone(),
            source,
        })?;

    let mut file = match File::open(&paths.body).await {
        Ok(file) => file,
        Err(e) => {
            debug!("cache entry {} vanished: {}", paths.key, e);
            return Ok(ReadOutcome::Miss);
        }
    };
    lock.release().await;

    let decode = metadata.gzip_response && !is_transport_compressed(&metadata.headers);
    let mut headers = metadata.headers;
    headers.insert(CacheDefaults::FROM_CACHE_HEADER.to_string(), "1".to_string());
    sink.response(ResponseHead::new(CacheDefaults::HIT_STATUS, headers)).await;
    debug!("cache hit for {}", paths.key);

    let mut decoder = decode.then(GzipChunkDecoder::new);
    let mut buf = vec![0u8; CacheDefaults::DISK_READ_CHUNK_SIZE];
    loop {
        let read = file
            .read(&mut buf)
            .await
            .map_err(|e| CacheError::io("Failed to read cached body", &paths.body, e))?;
        if read == 0 {
            break;
        }
        let chunk = match decoder.as_mut() {
            Some(decoder) => decoder.decode(&buf[..read]).map_err(decompress_error)?,
            None => buf[..read].to_vec(),
        };
        sink.data(Bytes::from(chunk)).await;
    }
    if let Some(decoder) = decoder {
        let tail = decoder.finish().map_err(decompress_error)?;
        sink.data(Bytes::from(tail)).await;
    }

    sink.end(None).await;
    Ok(ReadOutcome::Hit)
}

fn decompress_error(source: std::io::Error) -> CacheError {
    CacheError::Compression {
        message: format!("Failed to decompress cached body: {}", source),
        source: Some(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ErrorReporter;
    use crate::key::CacheKey;
    use crate::lock::{self, LockOptions};
    use crate::relay;
    use crate::store::{write_json_atomic, GzipChunkEncoder};
    use crate::transport::Headers;
    use tempfile::TempDir;

    fn paths(dir: &TempDir) -> CachePaths {
        CachePaths::new(dir.path(), CacheKey::from(42))
    }

    async fn write_entry(paths: &CachePaths, body: &[u8], gzip: bool, headers: Headers) {
        let stored = if gzip {
            let mut encoder = GzipChunkEncoder::new();
            let mut out = encoder.encode(body).unwrap();
            out.extend(encoder.finish().unwrap());
            out
        } else {
            body.to_vec()
        };
        std::fs::write(&paths.body, stored).unwrap();
        let meta = EntryMetadata {
            gzip_response: gzip,
            headers,
        };
        write_json_atomic(&paths.meta, &meta).await.unwrap();
    }

    fn backdate(path: &std::path::Path, by: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn test_freshness_window() {
        let now = SystemTime::now();
        let minute = Duration::from_secs(60);
        assert!(is_fresh(now - Duration::from_secs(10), minute, now));
        assert!(!is_fresh(now - minute, minute, now));
        assert!(!is_fresh(now, Duration::ZERO, now));
        assert!(is_fresh(now, Duration::MAX, now));
    }

    #[tokio::test]
    async fn test_missing_entry_is_miss() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        let (mut relay, mut sink, _body) = relay::channel(8, ErrorReporter::default());
        let mut lock = EntryLock::unheld();

        let outcome = try_read(&paths, Duration::from_secs(60), &mut lock, &mut sink)
            .await
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Miss);
        drop(sink);
        assert!(relay.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_hit_decompresses_and_marks_from_cache() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        let body = b"cached body ".repeat(20_000);
        let headers = Headers::from([("content-type".to_string(), "text/plain".to_string())]);
        write_entry(&paths, &body, true, headers).await;

        let (relay, mut sink, _body) = relay::channel(8, ErrorReporter::default());
        let mut lock = lock::acquire(&paths.body, &LockOptions::default()).await.unwrap();
        let reading = tokio::spawn(async move {
            let outcome = try_read(&paths, Duration::from_secs(60), &mut lock, &mut sink).await;
            (outcome, lock.is_held())
        });

        let (head, received) = relay.collect().await.unwrap();
        let (outcome, held) = reading.await.unwrap();
        assert_eq!(outcome.unwrap(), ReadOutcome::Hit);
        assert!(!held);
        assert_eq!(head.status, 200);
        assert!(head.from_cache());
        assert_eq!(head.header("content-type"), Some("text/plain"));
        assert_eq!(received.as_ref(), &body[..]);
    }

    #[tokio::test]
    async fn test_transport_compressed_body_is_replayed_verbatim() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        let raw = {
            let mut encoder = GzipChunkEncoder::new();
            let mut out = encoder.encode(b"upstream gzip").unwrap();
            out.extend(encoder.finish().unwrap());
            out
        };
        std::fs::write(&paths.body, &raw).unwrap();
        let meta = EntryMetadata {
            gzip_response: true,
            headers: Headers::from([("content-encoding".to_string(), "gzip".to_string())]),
        };
        write_json_atomic(&paths.meta, &meta).await.unwrap();

        let (relay, mut sink, _body) = relay::channel(8, ErrorReporter::default());
        tokio::spawn(async move {
            let mut lock = EntryLock::unheld();
            try_read(&paths, Duration::from_secs(60), &mut lock, &mut sink).await
        });

        let (_, received) = relay.collect().await.unwrap();
        assert_eq!(received.as_ref(), &raw[..]);
    }

    #[tokio::test]
    async fn test_stale_entry_is_miss() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        write_entry(&paths, b"old", false, Headers::new()).await;
        backdate(&paths.body, Duration::from_secs(120));

        let (_relay, mut sink, _body) = relay::channel(8, ErrorReporter::default());
        let mut lock = EntryLock::unheld();
        let outcome = try_read(&paths, Duration::from_secs(60), &mut lock, &mut sink)
            .await
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Miss);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_always_miss() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        write_entry(&paths, b"new", false, Headers::new()).await;

        let (_relay, mut sink, _body) = relay::channel(8, ErrorReporter::default());
        let mut lock = EntryLock::unheld();
        let outcome = try_read(&paths, Duration::ZERO, &mut lock, &mut sink).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Miss);
    }

    #[tokio::test]
    async fn test_body_without_metadata_keeps_lock() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        std::fs::write(&paths.body, b"orphan").unwrap();

        let (mut relay, mut sink, _body) = relay::channel(8, ErrorReporter::default());
        let mut lock = lock::acquire(&paths.body, &LockOptions::default()).await.unwrap();
        let err = try_read(&paths, Duration::from_secs(60), &mut lock, &mut sink)
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::MissingMetadata { .. }));
        assert!(lock.is_held());
        drop(sink);
        assert!(relay.next_event().await.is_none());
        lock.release().await;
    }
}
