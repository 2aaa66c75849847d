//! Persisting a live response while it streams to the caller.
//!
//! The capture runs on its own task fed through a bounded channel. Bytes go to
//! a temp file in the cache directory; on commit the temp file is synced, the
//! metadata is written atomically and the temp file is renamed onto the body
//! path. Only then is the lock released and the persistence signal fired. An
//! aborted or failed capture leaves no body behind.
//!
//! Metadata lands before the body. Freshness is judged by the body's mtime, so
//! until the rename a reader pairing the new metadata with a previous body
//! sees that body as stale. Orphaned bodies are removed by the engine before
//! it fetches, so there is no fresh previous body to pair with.

use super::{is_transport_compressed, write_json_atomic, EntryMetadata, GzipChunkEncoder};
use crate::config::{CacheDefaults, ErrorReporter};
use crate::error::{CacheError, Result};
use crate::key::CachePaths;
use crate::lock::EntryLock;
use crate::relay::{PersistNotifier, PersistSignal};
use crate::transport::ResponseHead;
use bytes::Bytes;
use std::path::Path;
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How a response will be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturePlan {
    /// Gzip the body on the way to disk.
    pub compress: bool,
    pub metadata: EntryMetadata,
}

/// Decide whether and how to store `head`.
///
/// Non-2xx responses are never stored. Bodies the server already encoded are
/// stored as received.
pub fn plan_capture(head: &ResponseHead, gzip_policy: bool) -> Option<CapturePlan> {
    if !head.is_success() {
        return None;
    }
    Some(CapturePlan {
        compress: gzip_policy && !is_transport_compressed(&head.headers),
        metadata: EntryMetadata {
            gzip_response: gzip_policy,
            headers: head.headers.clone(),
        },
    })
}

#[derive(Debug)]
enum CaptureMsg {
    Chunk(Bytes),
    Commit(PersistNotifier),
}

/// Handle feeding a running capture.
#[derive(Debug)]
pub struct EntryCapture {
    chunks: mpsc::Sender<CaptureMsg>,
}

impl EntryCapture {
    /// Start capturing into `paths`. The capture owns `lock` until it finishes.
    ///
    /// Failures are handed to `reporter` only.
    pub(crate) fn start(
        paths: CachePaths,
        plan: CapturePlan,
        lock: EntryLock,
        reporter: ErrorReporter,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CacheDefaults::CAPTURE_CAPACITY);
        tokio::spawn(run_capture(paths, plan, lock, reporter, rx));
        Self { chunks: tx }
    }

    /// Append a body chunk. A capture that already failed ignores it.
    pub async fn push(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let _ = self.chunks.send(CaptureMsg::Chunk(chunk)).await;
    }

    /// Finish the entry. The signal fires once the capture is done, whether
    /// or not it succeeded.
    pub async fn commit(self) -> PersistSignal {
        let (notifier, signal) = PersistSignal::pair();
        // A failed capture has dropped its receiver; the notifier drops with
        // the message and the signal fires immediately.
        let _ = self.chunks.send(CaptureMsg::Commit(notifier)).await;
        signal
    }

    /// Discard everything captured so far.
    pub fn abort(self) {
        drop(self);
    }
}

async fn run_capture(
    paths: CachePaths,
    plan: CapturePlan,
    mut lock: EntryLock,
    reporter: ErrorReporter,
    mut rx: mpsc::Receiver<CaptureMsg>,
) {
    let outcome = capture(&paths, plan, &mut rx).await;
    lock.release().await;

    match outcome {
        Ok(Some(notifier)) => {
            debug!("stored cache entry {}", paths.key);
            notifier.notify();
        }
        Ok(None) => debug!("capture of {} abandoned", paths.key),
        Err(err) => {
            warn!("failed to store cache entry {}: {}", paths.key, err);
            reporter.report(&err);
        }
    }
}

/// Drive the capture. `Ok(None)` means the handle went away without a commit.
async fn capture(
    paths: &CachePaths,
    plan: CapturePlan,
    rx: &mut mpsc::Receiver<CaptureMsg>,
) -> Result<Option<PersistNotifier>> {
    let directory = paths.directory().unwrap_or_else(|| Path::new("."));
    let (mut file, temp_path) = create_temp(directory).await?;
    let mut encoder = plan.compress.then(GzipChunkEncoder::new);

    let notifier = loop {
        match rx.recv().await {
            Some(CaptureMsg::Chunk(chunk)) => {
                let encoded = match encoder.as_mut() {
                    Some(encoder) => encoder.encode(&chunk).map_err(compress_error)?,
                    None => chunk.to_vec(),
                };
                write_temp(&mut file, &temp_path, &encoded).await?;
            }
            Some(CaptureMsg::Commit(notifier)) => break notifier,
            None => return Ok(None),
        }
    };

    if let Some(encoder) = encoder {
        let tail = encoder.finish().map_err(compress_error)?;
        write_temp(&mut file, &temp_path, &tail).await?;
    }
    let synced = async {
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    synced.map_err(|e| CacheError::io("Failed to sync cached body", &*temp_path, e))?;
    drop(file);

    write_json_atomic(&paths.meta, &plan.metadata).await?;
    temp_path.persist(&paths.body).map_err(|e| {
        CacheError::io("Failed to move cached body into place", &paths.body, e.error)
    })?;

    Ok(Some(notifier))
}

async fn create_temp(directory: &Path) -> Result<(File, TempPath)> {
    let owned = directory.to_path_buf();
    let created = tokio::task::spawn_blocking(move || {
        tempfile::Builder::new().prefix(".capture-").suffix(".tmp").tempfile_in(&owned)
    })
    .await
    .map_err(|e| CacheError::Io {
        message: format!("Temp file task failed: {}", e),
        path: Some(directory.to_path_buf()),
        source: None,
    })?
    .map_err(|e| CacheError::io("Failed to create temp body", directory, e))?;

    let (file, temp_path) = created.into_parts();
    Ok((File::from_std(file), temp_path))
}

async fn write_temp(file: &mut File, temp_path: &TempPath, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    file.write_all(bytes)
        .await
        .map_err(|e| CacheError::io("Failed to write cached body", &**temp_path, e))
}

fn compress_error(source: std::io::Error) -> CacheError {
    CacheError::Compression {
        message: format!("Failed to compress body: {}", source),
        source: Some(source),
    }
}
