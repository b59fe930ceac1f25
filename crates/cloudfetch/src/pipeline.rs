//! Chunk scheduling and sequential consumption
//!
//! The pipeline owns every [`ChunkDescriptor`] of a result and keeps a
//! window of the next `window_size` chunks (starting at the consumer's
//! position) downloading or resident:
//!
//! ```text
//!   released        window (in flight or resident)        not yet admitted
//! [ 0 .. cursor ) [ cursor .. next_to_schedule )     [ next_to_schedule .. total )
//! ```
//!
//! [`advance`](ChunkPipeline::advance) releases the chunk under the cursor
//! and admits the next one, so memory stays bounded by the window no matter
//! how far the downloads race ahead. [`current`](ChunkPipeline::current) is
//! the only call that waits.

use arrow_schema::SchemaRef;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chunk::{ChunkDescriptor, ChunkStatus};
use crate::config::CloudFetchConfig;
use crate::decoder::ColumnarDecoder;
use crate::error::{Error, Result};
use crate::http::{ChunkFetcher, HttpChunkFetcher};
use crate::link::{LinkResolver, StatementId};
use crate::manifest::ManifestSource;
use crate::retry::RetryPolicy;
use crate::worker::{DownloadWorker, WorkerContext, WorkerPool};

// ============================================================================
// Statistics
// ============================================================================

/// Pipeline counters
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub(crate) chunks_admitted: AtomicU64,
    pub(crate) chunks_succeeded: AtomicU64,
    pub(crate) chunks_failed: AtomicU64,
    pub(crate) chunks_cancelled: AtomicU64,
    pub(crate) chunks_released: AtomicU64,
    pub(crate) download_attempts: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) link_refreshes: AtomicU64,
    pub(crate) bytes_downloaded: AtomicU64,
    pub(crate) peak_in_flight: AtomicU64,
}

impl PipelineStats {
    fn record_in_flight(&self, in_flight: u64) {
        self.peak_in_flight.fetch_max(in_flight, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            chunks_admitted: self.chunks_admitted.load(Ordering::Relaxed),
            chunks_succeeded: self.chunks_succeeded.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            chunks_cancelled: self.chunks_cancelled.load(Ordering::Relaxed),
            chunks_released: self.chunks_released.load(Ordering::Relaxed),
            download_attempts: self.download_attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            link_refreshes: self.link_refreshes.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub chunks_admitted: u64,
    pub chunks_succeeded: u64,
    pub chunks_failed: u64,
    pub chunks_cancelled: u64,
    pub chunks_released: u64,
    pub download_attempts: u64,
    pub retries: u64,
    pub link_refreshes: u64,
    pub bytes_downloaded: u64,
    pub peak_in_flight: u64,
}

// ============================================================================
// Pipeline
// ============================================================================

/// Collaborators of a pipeline
pub struct PipelineDeps {
    pub fetcher: Arc<dyn ChunkFetcher>,
    pub resolver: Arc<dyn LinkResolver>,
    /// Worker pool; a private pool sized to the window is created when absent
    pub pool: Option<WorkerPool>,
}

impl PipelineDeps {
    pub fn new(fetcher: Arc<dyn ChunkFetcher>, resolver: Arc<dyn LinkResolver>) -> Self {
        Self {
            fetcher,
            resolver,
            pool: None,
        }
    }

    /// Dependencies using the `reqwest` fetcher configured from `config`
    pub fn http(config: &CloudFetchConfig, resolver: Arc<dyn LinkResolver>) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpChunkFetcher::new(config)?), resolver))
    }

    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }
}

struct Schedule {
    /// Chunk being consumed; -1 before the first `advance`
    cursor: i64,
    next_to_schedule: u64,
    in_flight: u64,
    closed: bool,
}

/// Bounded prefetching scheduler over the chunks of one result
pub struct ChunkPipeline {
    ctx: Arc<WorkerContext>,
    schedule: Mutex<Schedule>,
    pool: WorkerPool,
    window_size: u64,
    total_rows: u64,
    schema: Option<SchemaRef>,
}

impl std::fmt::Debug for ChunkPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let schedule = self.schedule.lock();
        f.debug_struct("ChunkPipeline")
            .field("statement_id", &self.ctx.statement_id)
            .field("total_chunks", &self.ctx.chunks.len())
            .field("total_rows", &self.total_rows)
            .field("window_size", &self.window_size)
            .field("cursor", &schedule.cursor)
            .field("in_flight", &schedule.in_flight)
            .field("closed", &schedule.closed)
            .finish()
    }
}

impl ChunkPipeline {
    /// Resolve the manifest and start downloading the first window of chunks
    pub async fn new(
        statement_id: impl Into<StatementId>,
        source: impl Into<ManifestSource>,
        deps: PipelineDeps,
        config: CloudFetchConfig,
    ) -> Result<Self> {
        config.validate()?;
        let statement_id = statement_id.into();
        let manifest = source.into().resolve(&statement_id).await?;

        let pool = match deps.pool {
            Some(pool) => pool,
            None => WorkerPool::new(config.max_parallel_downloads)?,
        };
        let total_chunks = manifest.descriptors.len() as u64;
        let window_size = (config.max_parallel_downloads as u64).min(total_chunks);
        let decoder = ColumnarDecoder::new(manifest.compression)
            .with_expected_schema(manifest.schema.clone())
            .with_max_memory_bytes(config.max_chunk_memory_bytes);

        info!(
            statement_id = %statement_id,
            chunks = total_chunks,
            rows = manifest.total_rows,
            window_size,
            compression = %manifest.compression,
            "created chunk pipeline"
        );

        let ctx = Arc::new(WorkerContext {
            statement_id,
            chunks: manifest.descriptors.into(),
            fetcher: deps.fetcher,
            resolver: deps.resolver,
            decoder: Arc::new(decoder),
            retry: RetryPolicy::new(config.retry.clone()),
            link_expiry_buffer: config.link_expiry_buffer,
            cancel: CancellationToken::new(),
            stats: Arc::new(PipelineStats::default()),
            handle: pool.handle().clone(),
        });

        let pipeline = Self {
            ctx,
            schedule: Mutex::new(Schedule {
                cursor: -1,
                next_to_schedule: 0,
                in_flight: 0,
                closed: false,
            }),
            pool,
            window_size,
            total_rows: manifest.total_rows,
            schema: manifest.schema,
        };
        pipeline.admit(&mut pipeline.schedule.lock());
        Ok(pipeline)
    }

    /// Admit chunks in index order until the window is full
    fn admit(&self, schedule: &mut Schedule) {
        let total = self.total_chunks();
        while !schedule.closed
            && schedule.next_to_schedule < total
            && schedule.in_flight < self.window_size
        {
            let index = schedule.next_to_schedule;
            let descriptor = Arc::clone(&self.ctx.chunks[index as usize]);
            descriptor.mark_admitted();
            schedule.next_to_schedule += 1;
            schedule.in_flight += 1;
            self.ctx.stats.chunks_admitted.fetch_add(1, Ordering::Relaxed);
            self.ctx.stats.record_in_flight(schedule.in_flight);
            debug!(
                statement_id = %self.ctx.statement_id,
                chunk_index = index,
                in_flight = schedule.in_flight,
                "admitted chunk"
            );

            let worker = DownloadWorker::new(Arc::clone(&self.ctx), Arc::clone(&descriptor));
            let task = self.pool.spawn(worker.run());
            descriptor.set_task(task.abort_handle());
        }
    }

    /// Whether a chunk follows the one under the cursor
    pub fn has_next(&self) -> bool {
        let schedule = self.schedule.lock();
        !schedule.closed && schedule.cursor + 1 < self.total_chunks() as i64
    }

    /// Release the chunk under the cursor and move to the next one.
    ///
    /// Never waits. Returns `false` once the last chunk has been passed or
    /// the pipeline is closed.
    pub fn advance(&self) -> bool {
        let mut schedule = self.schedule.lock();
        if schedule.closed {
            return false;
        }
        if schedule.cursor >= 0 {
            let descriptor = &self.ctx.chunks[schedule.cursor as usize];
            if descriptor.release() {
                schedule.in_flight = schedule.in_flight.saturating_sub(1);
                self.ctx.stats.chunks_released.fetch_add(1, Ordering::Relaxed);
            }
        }
        let has_next = schedule.cursor + 1 < self.total_chunks() as i64;
        if has_next {
            schedule.cursor += 1;
        }
        self.admit(&mut schedule);
        has_next
    }

    /// Wait for the chunk under the cursor and return it.
    ///
    /// A chunk that failed yields [`Error::ChunkFailed`] with the stored
    /// cause; a closed pipeline yields [`Error::Cancelled`].
    pub async fn current(&self) -> Result<Arc<ChunkDescriptor>> {
        let cursor = {
            let schedule = self.schedule.lock();
            if schedule.closed {
                return Err(self.cancelled_at(schedule.cursor));
            }
            schedule.cursor
        };
        if cursor < 0 {
            return Err(Error::internal("advance() must be called before current()"));
        }

        let descriptor = Arc::clone(&self.ctx.chunks[cursor as usize]);
        let status = descriptor.wait_ready().await;
        if self.is_closed() {
            return Err(self.cancelled_at(cursor));
        }

        match status {
            ChunkStatus::Succeeded => Ok(descriptor),
            ChunkStatus::FailedAborted => {
                let source = descriptor.error().unwrap_or_else(|| {
                    Arc::new(Error::internal("chunk failed without a recorded error"))
                });
                Err(Error::ChunkFailed {
                    statement_id: self.ctx.statement_id.clone(),
                    chunk_index: descriptor.index(),
                    source,
                })
            }
            ChunkStatus::Cancelled => Err(self.cancelled_at(cursor)),
            status => Err(Error::internal(format!(
                "chunk {} is {status} and cannot be read",
                descriptor.index()
            ))),
        }
    }

    /// Stop all downloads and free every resident chunk; idempotent
    pub fn close(&self) {
        let mut schedule = self.schedule.lock();
        if schedule.closed {
            return;
        }
        schedule.closed = true;
        self.ctx.cancel.cancel();

        let mut cancelled = 0u64;
        let mut released = 0u64;
        for descriptor in self.ctx.chunks.iter() {
            if descriptor.cancel() {
                cancelled += 1;
            } else if descriptor.status() != ChunkStatus::Cancelled && descriptor.release() {
                released += 1;
            }
        }
        schedule.in_flight = 0;

        let stats = &self.ctx.stats;
        stats.chunks_cancelled.fetch_add(cancelled, Ordering::Relaxed);
        stats.chunks_released.fetch_add(released, Ordering::Relaxed);
        info!(
            statement_id = %self.ctx.statement_id,
            cursor = schedule.cursor,
            cancelled,
            released,
            "closed chunk pipeline"
        );
    }

    fn cancelled_at(&self, cursor: i64) -> Error {
        Error::cancelled(&self.ctx.statement_id, u64::try_from(cursor).ok())
    }

    pub fn statement_id(&self) -> &StatementId {
        &self.ctx.statement_id
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    pub fn total_chunks(&self) -> u64 {
        self.ctx.chunks.len() as u64
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    /// Chunks currently downloading or resident
    pub fn in_flight(&self) -> u64 {
        self.schedule.lock().in_flight
    }

    /// Index of the chunk being consumed, -1 before the first `advance`
    pub fn cursor(&self) -> i64 {
        self.schedule.lock().cursor
    }

    pub fn chunk(&self, index: u64) -> Option<Arc<ChunkDescriptor>> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.ctx.chunks.get(i))
            .cloned()
    }

    /// Out-of-band schema of the result, if the manifest carried one
    pub fn schema(&self) -> Option<&SchemaRef> {
        self.schema.as_ref()
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.schedule.lock().closed
    }
}

impl Drop for ChunkPipeline {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionCodec;
    use crate::http::ChunkByteStream;
    use crate::link::{ChunkLink, NoLinkResolver};
    use crate::manifest::ResultManifest;
    use async_trait::async_trait;

    struct RefusingFetcher;

    #[async_trait]
    impl ChunkFetcher for RefusingFetcher {
        async fn fetch(&self, _link: &ChunkLink) -> Result<ChunkByteStream> {
            Err(Error::http(404, "no such object"))
        }
    }

    fn deps() -> PipelineDeps {
        PipelineDeps::new(Arc::new(RefusingFetcher), Arc::new(NoLinkResolver))
    }

    #[tokio::test]
    async fn test_empty_result() {
        let manifest = ResultManifest::from_row_counts(&[], CompressionCodec::None);
        let pipeline = ChunkPipeline::new("s", manifest, deps(), CloudFetchConfig::default())
            .await
            .unwrap();
        assert_eq!(pipeline.total_chunks(), 0);
        assert_eq!(pipeline.window_size(), 0);
        assert!(!pipeline.has_next());
        assert!(!pipeline.advance());
        assert_eq!(pipeline.cursor(), -1);
        assert_eq!(pipeline.stats().chunks_admitted, 0);
    }

    #[tokio::test]
    async fn test_current_before_advance() {
        let manifest = ResultManifest::from_row_counts(&[1], CompressionCodec::None);
        let pipeline = ChunkPipeline::new("s", manifest, deps(), CloudFetchConfig::default())
            .await
            .unwrap();
        let err = pipeline.current().await.unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Internal);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let manifest = ResultManifest::from_row_counts(&[1], CompressionCodec::None);
        let config = CloudFetchConfig {
            max_parallel_downloads: 0,
            ..CloudFetchConfig::default()
        };
        let err = ChunkPipeline::new("s", manifest, deps(), config)
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Configuration);
    }

    #[tokio::test]
    async fn test_invalid_manifest_rejected() {
        let mut manifest = ResultManifest::from_row_counts(&[3, 3], CompressionCodec::None);
        manifest.total_row_count = 7;
        let err = ChunkPipeline::new("s", manifest, deps(), CloudFetchConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Manifest);
    }

    #[tokio::test]
    async fn test_missing_link_without_resolver_fails_chunk() {
        let manifest = ResultManifest::from_row_counts(&[4], CompressionCodec::None);
        let pipeline = ChunkPipeline::new("s", manifest, deps(), CloudFetchConfig::default())
            .await
            .unwrap();
        assert!(pipeline.advance());
        let err = pipeline.current().await.unwrap_err();
        match err {
            Error::ChunkFailed {
                chunk_index,
                source,
                ..
            } => {
                assert_eq!(chunk_index, 0);
                assert!(matches!(*source, Error::LinkResolution { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pipeline.stats().download_attempts, 0);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = PipelineStats::default();
        stats.retries.fetch_add(2, Ordering::Relaxed);
        stats.record_in_flight(3);
        stats.record_in_flight(1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.retries, 2);
        assert_eq!(snapshot.peak_in_flight, 3);
    }
}
