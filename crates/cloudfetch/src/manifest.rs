//! Result manifests
//!
//! A statement's result is described either by a complete manifest returned
//! with the statement (every chunk known up front, links optional) or by a
//! continuation protocol that hands out pages of links until the server
//! reports there are no more rows. Both are normalised into one ordered list
//! of [`ChunkDescriptor`]s before the pipeline starts scheduling.

use arrow_schema::SchemaRef;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::chunk::ChunkDescriptor;
use crate::compression::CompressionCodec;
use crate::error::{Error, Result};
use crate::link::{ChunkLink, StatementId};

/// Row span of one chunk as declared by a complete manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub chunk_index: u64,
    pub row_offset: u64,
    pub row_count: u64,
    #[serde(default)]
    pub byte_count: Option<u64>,
}

/// Complete description of a statement's result
#[derive(Debug, Clone, Default)]
pub struct ResultManifest {
    pub total_chunk_count: u64,
    pub total_row_count: u64,
    /// Out-of-band schema; when absent the schema embedded in each chunk is used
    pub schema: Option<SchemaRef>,
    pub compression: CompressionCodec,
    pub chunks: Vec<ChunkInfo>,
    /// Links already issued alongside the manifest
    pub initial_links: Vec<ChunkLink>,
}

impl ResultManifest {
    /// Build a manifest from chunk infos, deriving the totals
    pub fn new(chunks: Vec<ChunkInfo>, compression: CompressionCodec) -> Self {
        Self {
            total_chunk_count: chunks.len() as u64,
            total_row_count: chunks.iter().map(|c| c.row_count).sum(),
            schema: None,
            compression,
            chunks,
            initial_links: Vec::new(),
        }
    }

    /// Build a manifest of contiguous chunks with the given row counts
    pub fn from_row_counts(row_counts: &[u64], compression: CompressionCodec) -> Self {
        let mut offset = 0;
        let chunks = row_counts
            .iter()
            .enumerate()
            .map(|(index, &row_count)| {
                let info = ChunkInfo {
                    chunk_index: index as u64,
                    row_offset: offset,
                    row_count,
                    byte_count: None,
                };
                offset += row_count;
                info
            })
            .collect();
        Self::new(chunks, compression)
    }

    pub fn with_schema(mut self, schema: SchemaRef) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_initial_links(mut self, links: Vec<ChunkLink>) -> Self {
        self.initial_links = links;
        self
    }

    /// Check chunk numbering and row accounting
    pub fn validate(&self) -> Result<()> {
        if self.chunks.len() as u64 != self.total_chunk_count {
            return Err(Error::manifest(format!(
                "manifest declares {} chunks but lists {}",
                self.total_chunk_count,
                self.chunks.len()
            )));
        }
        let mut next_offset = 0u64;
        for (position, chunk) in self.chunks.iter().enumerate() {
            if chunk.chunk_index != position as u64 {
                return Err(Error::manifest(format!(
                    "chunk at position {position} has index {}",
                    chunk.chunk_index
                )));
            }
            if chunk.row_offset != next_offset {
                return Err(Error::manifest(format!(
                    "chunk {} starts at row {}, expected {next_offset}",
                    chunk.chunk_index, chunk.row_offset
                )));
            }
            next_offset = next_offset
                .checked_add(chunk.row_count)
                .ok_or_else(|| Error::manifest("row count overflow"))?;
        }
        if next_offset != self.total_row_count {
            return Err(Error::manifest(format!(
                "chunks cover {next_offset} rows, manifest declares {}",
                self.total_row_count
            )));
        }
        Ok(())
    }
}

/// Link entry of a continuation page; carries the row span of its chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultLink {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub expires_at: DateTime<Utc>,
    pub start_row_offset: u64,
    pub row_count: u64,
    #[serde(default)]
    pub byte_count: Option<u64>,
}

/// One page of a continuation manifest
#[derive(Debug, Clone, Default)]
pub struct ContinuationPage {
    pub links: Vec<ResultLink>,
    pub has_more_rows: bool,
}

/// Incremental manifest protocol: pages are fetched until `has_more_rows` is false
#[async_trait]
pub trait ContinuationSource: Send {
    /// Codec of every chunk of the result
    fn compression(&self) -> CompressionCodec {
        CompressionCodec::None
    }

    /// Out-of-band schema, if the protocol provides one
    fn schema(&self) -> Option<SchemaRef> {
        None
    }

    /// Fetch the next page of links
    async fn fetch_page(&mut self) -> Result<ContinuationPage>;
}

/// Where the pipeline learns about its chunks
pub enum ManifestSource {
    /// Whole manifest known up front
    Complete(ResultManifest),
    /// Pages of links fetched until the server reports no more rows
    Continuation(Box<dyn ContinuationSource>),
}

impl std::fmt::Debug for ManifestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(manifest) => f.debug_tuple("Complete").field(manifest).finish(),
            Self::Continuation(_) => f.write_str("Continuation(..)"),
        }
    }
}

impl From<ResultManifest> for ManifestSource {
    fn from(manifest: ResultManifest) -> Self {
        Self::Complete(manifest)
    }
}

/// Manifest normalised into descriptors
#[derive(Debug)]
pub(crate) struct ResolvedManifest {
    pub descriptors: Vec<Arc<ChunkDescriptor>>,
    pub total_rows: u64,
    pub schema: Option<SchemaRef>,
    pub compression: CompressionCodec,
}

impl ManifestSource {
    pub(crate) async fn resolve(self, statement_id: &StatementId) -> Result<ResolvedManifest> {
        match self {
            Self::Complete(manifest) => resolve_complete(statement_id, manifest),
            Self::Continuation(source) => resolve_continuation(statement_id, source).await,
        }
    }
}

fn resolve_complete(
    statement_id: &StatementId,
    manifest: ResultManifest,
) -> Result<ResolvedManifest> {
    manifest.validate()?;
    let descriptors: Vec<Arc<ChunkDescriptor>> = manifest
        .chunks
        .iter()
        .map(|info| Arc::new(ChunkDescriptor::from_chunk_info(statement_id, info)))
        .collect();

    for link in manifest.initial_links {
        match usize::try_from(link.chunk_index)
            .ok()
            .and_then(|i| descriptors.get(i))
        {
            Some(descriptor) => {
                descriptor.set_link(link);
            }
            None => warn!(
                statement_id = %statement_id,
                chunk_index = link.chunk_index,
                "ignoring initial link for unknown chunk"
            ),
        }
    }

    Ok(ResolvedManifest {
        descriptors,
        total_rows: manifest.total_row_count,
        schema: manifest.schema,
        compression: manifest.compression,
    })
}

async fn resolve_continuation(
    statement_id: &StatementId,
    mut source: Box<dyn ContinuationSource>,
) -> Result<ResolvedManifest> {
    let mut descriptors: Vec<Arc<ChunkDescriptor>> = Vec::new();
    let mut total_rows = 0u64;
    let mut pages = 0usize;

    loop {
        let page = source.fetch_page().await?;
        pages += 1;
        for link in &page.links {
            if link.start_row_offset != total_rows {
                return Err(Error::manifest(format!(
                    "continuation link {} starts at row {}, expected {total_rows}",
                    descriptors.len(),
                    link.start_row_offset
                )));
            }
            let index = descriptors.len() as u64;
            descriptors.push(Arc::new(ChunkDescriptor::from_result_link(
                statement_id,
                index,
                link,
            )));
            total_rows += link.row_count;
        }
        debug!(
            statement_id = %statement_id,
            page = pages,
            chunks = descriptors.len(),
            rows = total_rows,
            has_more_rows = page.has_more_rows,
            "fetched continuation page"
        );
        if !page.has_more_rows {
            break;
        }
    }

    Ok(ResolvedManifest {
        descriptors,
        total_rows,
        schema: source.schema(),
        compression: source.compression(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkStatus;
    use std::collections::VecDeque;

    fn link(offset: u64, rows: u64) -> ResultLink {
        ResultLink {
            url: format!("https://storage/{offset}"),
            headers: HashMap::new(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            start_row_offset: offset,
            row_count: rows,
            byte_count: None,
        }
    }

    struct Pages(VecDeque<ContinuationPage>);

    #[async_trait]
    impl ContinuationSource for Pages {
        fn compression(&self) -> CompressionCodec {
            CompressionCodec::Lz4Frame
        }

        async fn fetch_page(&mut self) -> Result<ContinuationPage> {
            self.0
                .pop_front()
                .ok_or_else(|| Error::internal("no more pages scripted"))
        }
    }

    #[test]
    fn test_from_row_counts() {
        let manifest =
            ResultManifest::from_row_counts(&[20, 20, 20, 20, 10], CompressionCodec::None);
        assert_eq!(manifest.total_chunk_count, 5);
        assert_eq!(manifest.total_row_count, 90);
        assert_eq!(manifest.chunks[4].row_offset, 80);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_gap() {
        let mut manifest = ResultManifest::from_row_counts(&[10, 10], CompressionCodec::None);
        manifest.chunks[1].row_offset = 11;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_wrong_totals() {
        let mut manifest = ResultManifest::from_row_counts(&[10, 10], CompressionCodec::None);
        manifest.total_row_count = 25;
        assert!(manifest.validate().is_err());

        let mut manifest = ResultManifest::from_row_counts(&[10, 10], CompressionCodec::None);
        manifest.total_chunk_count = 3;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_order_index() {
        let mut manifest = ResultManifest::from_row_counts(&[10, 10], CompressionCodec::None);
        manifest.chunks.swap(0, 1);
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("position 0"));
    }

    #[tokio::test]
    async fn test_complete_manifest_applies_initial_links() {
        let statement = StatementId::new("s");
        let expires = Utc::now() + chrono::Duration::hours(1);
        let manifest = ResultManifest::from_row_counts(&[5, 5, 5], CompressionCodec::None)
            .with_initial_links(vec![
                ChunkLink::new(0, "https://storage/0", expires),
                ChunkLink::new(1, "https://storage/1", expires),
                ChunkLink::new(9, "https://storage/9", expires),
            ]);

        let resolved = ManifestSource::from(manifest).resolve(&statement).await.unwrap();
        assert_eq!(resolved.descriptors.len(), 3);
        assert_eq!(resolved.total_rows, 15);
        assert_eq!(resolved.descriptors[0].status(), ChunkStatus::UrlFetched);
        assert_eq!(resolved.descriptors[1].status(), ChunkStatus::UrlFetched);
        assert_eq!(resolved.descriptors[2].status(), ChunkStatus::Pending);
        assert!(resolved.descriptors[2].link().is_none());
    }

    #[tokio::test]
    async fn test_continuation_assigns_sequential_indices() {
        let statement = StatementId::new("s");
        let source = Pages(VecDeque::from(vec![
            ContinuationPage {
                links: vec![link(0, 100), link(100, 100)],
                has_more_rows: true,
            },
            ContinuationPage {
                links: vec![],
                has_more_rows: true,
            },
            ContinuationPage {
                links: vec![link(200, 42)],
                has_more_rows: false,
            },
        ]));

        let resolved = ManifestSource::Continuation(Box::new(source))
            .resolve(&statement)
            .await
            .unwrap();
        assert_eq!(resolved.compression, CompressionCodec::Lz4Frame);
        assert_eq!(resolved.total_rows, 242);
        let indices: Vec<u64> = resolved.descriptors.iter().map(|d| d.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(resolved.descriptors[2].row_offset(), 200);
        assert_eq!(resolved.descriptors[2].row_count(), 42);
        assert!(resolved
            .descriptors
            .iter()
            .all(|d| d.status() == ChunkStatus::UrlFetched));
    }

    #[tokio::test]
    async fn test_continuation_rejects_overlap() {
        let statement = StatementId::new("s");
        let source = Pages(VecDeque::from(vec![ContinuationPage {
            links: vec![link(0, 100), link(90, 10)],
            has_more_rows: false,
        }]));
        let err = ManifestSource::Continuation(Box::new(source))
            .resolve(&statement)
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Manifest);
    }

    #[tokio::test]
    async fn test_continuation_source_error_propagates() {
        let statement = StatementId::new("s");
        let source = Pages(VecDeque::from(vec![ContinuationPage {
            links: vec![link(0, 1)],
            has_more_rows: true,
        }]));
        let err = ManifestSource::Continuation(Box::new(source))
            .resolve(&statement)
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Internal);
    }
}
