//! Transport backed by `reqwest`.
//!
//! Bodies are streamed back untouched: no automatic decompression, so a
//! `content-encoding: gzip` response reaches the cache (and the caller) as the
//! server sent it.

use super::{Headers, Transport, TransportNotices, TransportRequest, TransportResponse};
use crate::descriptor::Payload;
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use tracing::debug;

/// [`Transport`] over a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured client (timeouts, proxies, TLS).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: TransportRequest,
        _notices: TransportNotices,
    ) -> Result<TransportResponse> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| CacheError::descriptor("method", e.to_string()))?;
        let target = format!("{} {}", method, request.url);

        let mut builder = self.client.request(method, request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match request.payload {
            Payload::Text(text) => builder.body(text),
            Payload::Form(fields) => builder.form(&fields),
            Payload::Multipart(fields) => {
                let form = fields
                    .into_iter()
                    .fold(reqwest::multipart::Form::new(), |form, (name, value)| {
                        form.text(name, value)
                    });
                builder.multipart(form)
            }
            Payload::Json(value) => builder.json(&value),
            Payload::Empty => {
                // Streamed writes are buffered so empty bodies are sent without chunked framing.
                let written = request.body.collect().await;
                if written.is_empty() {
                    builder
                } else {
                    builder.body(written)
                }
            }
        };

        let response = builder
            .send()
            .await
            .map_err(|e| CacheError::transport_with(format!("{} failed", target), e))?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        debug!("{} -> {}", target, status);

        let body = response.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other));
        Ok(TransportResponse::new(status, headers, body))
    }
}

/// Flatten a header map, joining repeated values with `", "`.
fn collect_headers(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        let Ok(value) = value.to_str() else {
            continue;
        };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
}
