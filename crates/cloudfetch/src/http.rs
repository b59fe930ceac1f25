//! Chunk transport
//!
//! [`ChunkFetcher`] abstracts the HTTP GET against a signed link. The
//! response body is exposed as a byte stream so the decoder can consume it
//! while it is still arriving.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tracing::debug;

use crate::config::CloudFetchConfig;
use crate::error::{is_retriable_status, Error, Result};
use crate::link::ChunkLink;

/// Streaming body of a chunk download
pub type ChunkByteStream = BoxStream<'static, Result<Bytes>>;

/// Longest error body kept in an [`Error::Http`] message
const MAX_ERROR_BODY: usize = 512;

/// Fetches chunk payloads from signed links
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    /// Issue the request and return the response body as a stream.
    ///
    /// Non-success statuses are reported as [`Error::Http`] before any body
    /// is streamed.
    async fn fetch(&self, link: &ChunkLink) -> Result<ChunkByteStream>;
}

/// [`ChunkFetcher`] backed by a pooled `reqwest` client
#[derive(Clone)]
pub struct HttpChunkFetcher {
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpChunkFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpChunkFetcher").finish_non_exhaustive()
    }
}

impl HttpChunkFetcher {
    /// Build a fetcher using the timeouts and user agent of `config`
    pub fn new(config: &CloudFetchConfig) -> Result<Self> {
        Self::with_timeouts(
            config.connect_timeout,
            config.request_timeout,
            &config.user_agent,
        )
    }

    pub fn with_timeouts(connect: Duration, request: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect)
            .timeout(request)
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wrap an existing client (shared connection pool)
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Read at most [`MAX_ERROR_BODY`] bytes of an error response; the rest of the
/// body is never pulled off the socket
async fn error_snippet(response: reqwest::Response) -> String {
    let mut body = response.bytes_stream();
    let mut snippet = Vec::with_capacity(MAX_ERROR_BODY);
    while snippet.len() < MAX_ERROR_BODY {
        match body.next().await {
            Some(Ok(piece)) => {
                let take = piece.len().min(MAX_ERROR_BODY - snippet.len());
                snippet.extend_from_slice(&piece[..take]);
            }
            _ => break,
        }
    }
    String::from_utf8_lossy(&snippet).into_owned()
}

#[async_trait]
impl ChunkFetcher for HttpChunkFetcher {
    async fn fetch(&self, link: &ChunkLink) -> Result<ChunkByteStream> {
        let mut request = self.client.get(&link.url);
        for (name, value) in &link.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let snippet = error_snippet(response).await;
            debug!(
                chunk_index = link.chunk_index,
                status = status.as_u16(),
                retriable = is_retriable_status(status.as_u16()),
                "chunk download rejected"
            );
            return Err(Error::http(
                status.as_u16(),
                format!(
                    "{} fetching chunk {}: {}",
                    status.canonical_reason().unwrap_or("unexpected status"),
                    link.chunk_index,
                    snippet.trim()
                ),
            ));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed())
    }
}
