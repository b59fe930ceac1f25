//! Signed download links and the service that issues them.
//!
//! A [`ChunkLink`] is a pre-signed, time-limited URL for one chunk. Links are
//! considered usable only while they are more than a safety margin away from
//! expiry; anything closer is refreshed through a [`LinkResolver`] before the
//! HTTP request is issued.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

/// Identifier of the statement whose result is being fetched
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatementId(Arc<str>);

impl StatementId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StatementId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for StatementId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

/// Pre-signed download location for a single chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLink {
    /// Chunk this link belongs to
    pub chunk_index: u64,
    /// Signed URL
    pub url: String,
    /// Headers that must accompany the request (e.g. server-side encryption keys)
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Instant after which the storage service rejects the URL
    pub expires_at: DateTime<Utc>,
    /// First row covered by the chunk, when the issuer reports it
    #[serde(default)]
    pub row_offset: Option<u64>,
    /// Rows in the chunk, when the issuer reports it
    #[serde(default)]
    pub row_count: Option<u64>,
    /// Compressed size in bytes, when the issuer reports it
    #[serde(default)]
    pub byte_count: Option<u64>,
    /// Index of the following chunk, `None` on the last one
    #[serde(default)]
    pub next_chunk_index: Option<u64>,
}

impl ChunkLink {
    /// Create a link with no headers or size hints
    pub fn new(chunk_index: u64, url: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            chunk_index,
            url: url.into(),
            headers: HashMap::new(),
            expires_at,
            row_offset: None,
            row_count: None,
            byte_count: None,
            next_chunk_index: None,
        }
    }

    /// Add a request header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Whether the link can still be used at `now`, keeping `margin` in reserve
    pub fn is_usable_at(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        let Ok(margin) = chrono::Duration::from_std(margin) else {
            return false;
        };
        match self.expires_at.checked_sub_signed(margin) {
            Some(deadline) => deadline > now,
            None => false,
        }
    }

    /// Whether the link can still be used now, keeping `margin` in reserve
    pub fn is_usable(&self, margin: Duration) -> bool {
        self.is_usable_at(margin, Utc::now())
    }
}

/// Issues fresh signed links for chunks of a statement's result.
///
/// Implementations may return links for more chunks than the one requested
/// (batched issuance); every returned link is applied to its chunk.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    /// Resolve links starting at `chunk_index`
    async fn resolve_links(
        &self,
        statement_id: &StatementId,
        chunk_index: u64,
    ) -> Result<Vec<ChunkLink>>;
}

/// Resolver for results whose links can never be re-issued.
///
/// Every call fails with a non-retriable error, so a chunk whose link expires
/// is aborted instead of being retried forever.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLinkResolver;

#[async_trait]
impl LinkResolver for NoLinkResolver {
    async fn resolve_links(
        &self,
        _statement_id: &StatementId,
        chunk_index: u64,
    ) -> Result<Vec<ChunkLink>> {
        Err(Error::LinkResolution {
            chunk_index,
            message: "link refresh is not supported for this result".to_string(),
            retriable: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_usable_outside_margin() {
        let now = Utc::now();
        let link = ChunkLink::new(0, "https://storage/c0", now + chrono::Duration::minutes(10));
        assert!(link.is_usable_at(Duration::from_secs(60), now));
    }

    #[test]
    fn test_link_unusable_inside_margin() {
        let now = Utc::now();
        let link = ChunkLink::new(0, "https://storage/c0", now + chrono::Duration::seconds(30));
        assert!(!link.is_usable_at(Duration::from_secs(60), now));
        assert!(link.is_usable_at(Duration::from_secs(10), now));
    }

    #[test]
    fn test_expired_link_unusable() {
        let now = Utc::now();
        let link = ChunkLink::new(0, "https://storage/c0", now - chrono::Duration::seconds(1));
        assert!(!link.is_usable_at(Duration::ZERO, now));
    }

    #[test]
    fn test_link_json_roundtrip_defaults() {
        let json = r#"{"chunk_index":2,"url":"https://s/2","expires_at":"2030-01-01T00:00:00Z"}"#;
        let link: ChunkLink = serde_json::from_str(json).unwrap();
        assert_eq!(link.chunk_index, 2);
        assert!(link.headers.is_empty());
        assert_eq!(link.row_count, None);
    }

    #[test]
    fn test_statement_id_display() {
        let id = StatementId::from("01ee-42");
        assert_eq!(id.to_string(), "01ee-42");
        assert_eq!(id.as_str(), "01ee-42");
    }

    #[tokio::test]
    async fn test_no_link_resolver_is_fatal() {
        let err = NoLinkResolver
            .resolve_links(&StatementId::new("s"), 7)
            .await
            .unwrap_err();
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("chunk 7"));
    }
}
