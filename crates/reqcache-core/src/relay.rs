//! The caller-facing byte channel.
//!
//! A [`Relay`] is returned for every call. Request-body writes are buffered
//! until the transport picks them up (and discarded on a cache hit). Events
//! arrive in a fixed order: optional transport notices, one response head,
//! body chunks, then either end-of-data or an error.
//!
//! End-of-data is the join of two completions: the body stream being exhausted
//! and, when the response is being persisted, the entry being durable on disk.

use crate::config::ErrorReporter;
use crate::error::{CacheError, Result};
use crate::transport::{RequestBody, ResponseHead, TransportNotice, TransportNotices};
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

/// One event observed by the caller.
#[derive(Debug)]
pub enum RelayEvent {
    Notice(TransportNotice),
    Response(ResponseHead),
    Data(Bytes),
    End,
    Error(CacheError),
}

/// Caller side of a call.
#[derive(Debug)]
pub struct Relay {
    input: Option<mpsc::UnboundedSender<Bytes>>,
    events: mpsc::Receiver<RelayEvent>,
    finished: bool,
}

impl Relay {
    /// Write request-body bytes.
    ///
    /// Accepted before the transport exists; silently discarded when the call
    /// is answered from cache.
    pub fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        let input = self.input.as_ref().ok_or(CacheError::InputClosed)?;
        let _ = input.send(chunk.into());
        Ok(())
    }

    /// Signal the end of the request body.
    pub fn end_input(&mut self) {
        self.input = None;
    }

    /// Next event, or `None` once end-of-data or an error has been delivered.
    pub async fn next_event(&mut self) -> Option<RelayEvent> {
        if self.finished {
            return None;
        }
        let event = self.events.recv().await;
        if matches!(event, None | Some(RelayEvent::End) | Some(RelayEvent::Error(_))) {
            self.finished = true;
        }
        event
    }

    /// Wait for the response head, skipping transport notices.
    pub async fn response(&mut self) -> Result<ResponseHead> {
        loop {
            match self.next_event().await {
                Some(RelayEvent::Notice(_)) => continue,
                Some(RelayEvent::Response(head)) => return Ok(head),
                Some(RelayEvent::Error(err)) => return Err(err),
                Some(RelayEvent::Data(_)) | Some(RelayEvent::End) | None => {
                    return Err(CacheError::transport("call ended without a response"))
                }
            }
        }
    }

    /// Next body chunk; `Ok(None)` at end-of-data.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.next_event().await {
                Some(RelayEvent::Data(chunk)) => return Ok(Some(chunk)),
                Some(RelayEvent::End) => return Ok(None),
                Some(RelayEvent::Error(err)) => return Err(err),
                Some(RelayEvent::Notice(_)) | Some(RelayEvent::Response(_)) => continue,
                None => {
                    return Err(CacheError::Upstream {
                        message: "relay closed before end of data".to_string(),
                        source: None,
                    })
                }
            }
        }
    }

    /// Consume the call into its response head and full body.
    pub async fn collect(mut self) -> Result<(ResponseHead, Bytes)> {
        let head = self.response().await?;
        let mut body = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok((head, body.freeze()))
    }
}

/// Fires once a capture has finished (successfully or not).
#[derive(Debug)]
pub struct PersistSignal(oneshot::Receiver<()>);

/// Completes the matching [`PersistSignal`].
#[derive(Debug)]
pub(crate) struct PersistNotifier(oneshot::Sender<()>);

impl PersistSignal {
    pub(crate) fn pair() -> (PersistNotifier, PersistSignal) {
        let (tx, rx) = oneshot::channel();
        (PersistNotifier(tx), PersistSignal(rx))
    }

    /// Wait for persistence to finish. A dropped notifier counts as finished.
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

impl PersistNotifier {
    pub(crate) fn notify(self) {
        let _ = self.0.send(());
    }
}

/// Engine side of a call.
pub(crate) struct RelaySink {
    events: mpsc::Sender<RelayEvent>,
    reporter: ErrorReporter,
    finished: bool,
}

impl RelaySink {
    pub(crate) fn notices(&self) -> TransportNotices {
        TransportNotices::new(self.events.clone())
    }

    pub(crate) async fn response(&mut self, head: ResponseHead) {
        self.send(RelayEvent::Response(head)).await;
    }

    pub(crate) async fn data(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.send(RelayEvent::Data(chunk)).await;
        }
    }

    /// Emit end-of-data, after `persisted` fires when a capture is running.
    pub(crate) async fn end(&mut self, persisted: Option<PersistSignal>) {
        if let Some(persisted) = persisted {
            persisted.wait().await;
        }
        self.send(RelayEvent::End).await;
        self.finished = true;
    }

    /// Report an error and deliver it to the caller.
    pub(crate) async fn fail(&mut self, err: CacheError) {
        self.reporter.report(&err);
        self.send(RelayEvent::Error(err)).await;
        self.finished = true;
    }

    async fn send(&mut self, event: RelayEvent) {
        if self.finished {
            return;
        }
        // A dropped relay only means nobody is listening; the call still completes.
        let _ = self.events.send(event).await;
    }
}

/// Create the three ends of a call: caller relay, engine sink, transport body.
pub(crate) fn channel(capacity: usize, reporter: ErrorReporter) -> (Relay, RelaySink, RequestBody) {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::channel(capacity.max(1));

    let relay = Relay {
        input: Some(input_tx),
        events: events_rx,
        finished: false,
    };
    let sink = RelaySink {
        events: events_tx,
        reporter,
        finished: false,
    };
    (relay, sink, RequestBody::new(input_rx))
}
