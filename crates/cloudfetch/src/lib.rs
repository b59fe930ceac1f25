//! # cloudfetch
//!
//! Client-side retrieval of large query results served as chunks of Arrow
//! data behind pre-signed, time-limited links.
//!
//! ## Features
//!
//! - **Bounded prefetch**: at most `max_parallel_downloads` chunks are
//!   downloading or resident at once; memory is reclaimed as the consumer
//!   moves on
//! - **Streaming decode**: HTTP bodies are piped through LZ4/Zstd/gzip
//!   decompression straight into the Arrow IPC reader
//! - **Retry with backoff**: transient faults are retried with exponential
//!   backoff and jitter; fatal ones abort the chunk immediately
//! - **Link refresh**: links inside the expiry buffer are re-issued before
//!   any request is made
//! - **Cancellation**: closing the pipeline stops every download and wakes
//!   blocked consumers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cloudfetch::prelude::*;
//! use std::sync::Arc;
//!
//! let config = CloudFetchConfig::builder()
//!     .max_parallel_downloads(8)
//!     .build()?;
//! let deps = PipelineDeps::http(&config, Arc::new(my_link_service))?;
//! let pipeline = ChunkPipeline::new(statement_id, manifest, deps, config).await?;
//!
//! let mut cursor = ResultCursor::new(pipeline);
//! while cursor.next_row().await? {
//!     let (ids, row) = cursor.value(0).unwrap();
//!     // ...
//! }
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod chunk;
pub mod columnar;
pub mod compression;
pub mod config;
pub mod cursor;
pub mod decoder;
pub mod error;
pub mod http;
pub mod link;
pub mod manifest;
pub mod pipeline;
pub mod retry;
pub mod worker;

pub use chunk::{ChunkDescriptor, ChunkStatus};
pub use columnar::{ColumnBatchSet, RowCursor, RowRef};
pub use compression::CompressionCodec;
pub use config::{CloudFetchConfig, CloudFetchConfigBuilder, RetryConfig};
pub use cursor::ResultCursor;
pub use decoder::{encode_stream, ColumnarDecoder};
pub use error::{Error, ErrorCategory, Result};
pub use http::{ChunkByteStream, ChunkFetcher, HttpChunkFetcher};
pub use link::{ChunkLink, LinkResolver, NoLinkResolver, StatementId};
pub use manifest::{
    ChunkInfo, ContinuationPage, ContinuationSource, ManifestSource, ResultLink, ResultManifest,
};
pub use pipeline::{ChunkPipeline, PipelineDeps, PipelineStats, PipelineStatsSnapshot};
pub use retry::RetryPolicy;
pub use worker::WorkerPool;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::chunk::{ChunkDescriptor, ChunkStatus};
    pub use crate::columnar::ColumnBatchSet;
    pub use crate::compression::CompressionCodec;
    pub use crate::config::{CloudFetchConfig, RetryConfig};
    pub use crate::cursor::ResultCursor;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::http::{ChunkFetcher, HttpChunkFetcher};
    pub use crate::link::{ChunkLink, LinkResolver, StatementId};
    pub use crate::manifest::{ContinuationSource, ManifestSource, ResultManifest};
    pub use crate::pipeline::{ChunkPipeline, PipelineDeps};
    pub use crate::worker::WorkerPool;
}
