//! The transport collaborator contract.
//!
//! The cache never performs network I/O itself. On a miss it hands a
//! [`TransportRequest`] to an injected [`Transport`] and relays whatever
//! [`TransportResponse`] comes back.

#[cfg(feature = "reqwest-transport")]
mod reqwest_transport;

#[cfg(feature = "reqwest-transport")]
pub use reqwest_transport::ReqwestTransport;

use crate::config::CacheDefaults;
use crate::descriptor::Payload;
use crate::error::Result;
use crate::relay::RelayEvent;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use url::Url;

/// Header mapping. Transports should use lower-case names.
pub type Headers = BTreeMap<String, String>;

/// Case-insensitive header lookup.
pub fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Status line and headers of a response, live or synthesized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new(status: u16, headers: Headers) -> Self {
        Self { status, headers }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether this head was synthesized from a cache entry.
    pub fn from_cache(&self) -> bool {
        self.header(CacheDefaults::FROM_CACHE_HEADER) == Some("1")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }
}

/// Optional connection-level notices a transport may emit before its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportNotice {
    Socket,
    Connect,
    Continue,
}

/// Handle a transport uses to forward notices to the caller.
#[derive(Debug, Clone)]
pub struct TransportNotices {
    events: mpsc::Sender<RelayEvent>,
}

impl TransportNotices {
    pub(crate) fn new(events: mpsc::Sender<RelayEvent>) -> Self {
        Self { events }
    }

    /// Forward a notice. Dropped if nobody is listening or the caller lags.
    pub fn emit(&self, notice: TransportNotice) {
        let _ = self.events.try_send(RelayEvent::Notice(notice));
    }
}

/// Bytes the caller wrote to the relay, in order.
///
/// The stream ends once the caller ends its input.
#[derive(Debug)]
pub struct RequestBody {
    chunks: mpsc::UnboundedReceiver<Bytes>,
}

impl RequestBody {
    pub(crate) fn new(chunks: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { chunks }
    }

    /// Wait for the caller to end its input and return everything written.
    pub async fn collect(mut self) -> Bytes {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunks.recv().await {
            buf.extend_from_slice(&chunk);
        }
        buf.freeze()
    }
}

impl Stream for RequestBody {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.chunks.poll_recv(cx)
    }
}

/// A request handed to the transport on a cache miss.
#[derive(Debug)]
pub struct TransportRequest {
    pub method: String,
    pub url: Url,
    pub headers: Headers,
    pub payload: Payload,
    pub body: RequestBody,
}

/// Response returned by a transport; the body is streamed.
pub struct TransportResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: BoxStream<'static, std::io::Result<Bytes>>,
}

impl TransportResponse {
    pub fn new<S>(status: u16, headers: Headers, body: S) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        Self {
            status,
            headers,
            body: body.boxed(),
        }
    }

    /// A response whose body is already in memory.
    pub fn from_bytes(status: u16, headers: Headers, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self::new(status, headers, stream::iter([Ok::<_, std::io::Error>(body)]))
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Performs the actual exchange on a cache miss.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and resolve once response headers are available.
    ///
    /// Errors returned here abort the call before any entry is touched.
    async fn send(
        &self,
        request: TransportRequest,
        notices: TransportNotices,
    ) -> Result<TransportResponse>;
}
