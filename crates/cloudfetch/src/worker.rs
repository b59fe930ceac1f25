//! Chunk download workers
//!
//! A [`DownloadWorker`] drives one chunk from its first link to a terminal
//! status: refresh the link when it is missing or about to expire, stream the
//! body through the decompressor into the Arrow decoder, and retry retriable
//! failures with exponential backoff. Workers run on a [`WorkerPool`], which
//! caps how many of them execute at once.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::chunk::ChunkDescriptor;
use crate::columnar::ColumnBatchSet;
use crate::decoder::ColumnarDecoder;
use crate::error::{Error, Result};
use crate::http::{ChunkByteStream, ChunkFetcher};
use crate::link::{ChunkLink, LinkResolver, StatementId};
use crate::pipeline::PipelineStats;
use crate::retry::RetryPolicy;

// ============================================================================
// Worker Pool
// ============================================================================

/// Bounded pool of download tasks.
///
/// A pool can be shared between pipelines; each pipeline still caps its own
/// in-flight chunks by its window.
#[derive(Clone)]
pub struct WorkerPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    size: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}

impl WorkerPool {
    /// Pool of `size` workers on the current tokio runtime
    pub fn new(size: usize) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::config(format!("worker pool requires a tokio runtime: {e}")))?;
        Ok(Self::with_handle(handle, size))
    }

    /// Pool of `size` workers on an explicit runtime
    pub fn with_handle(handle: Handle, size: usize) -> Self {
        let size = size.max(1);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers not currently running a download
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `task` once a worker slot is free
    pub(crate) fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        })
    }
}

// ============================================================================
// Download Worker
// ============================================================================

/// State shared by all workers of one pipeline
pub(crate) struct WorkerContext {
    pub statement_id: StatementId,
    /// Every chunk of the result; position equals chunk index
    pub chunks: Arc<[Arc<ChunkDescriptor>]>,
    pub fetcher: Arc<dyn ChunkFetcher>,
    pub resolver: Arc<dyn LinkResolver>,
    pub decoder: Arc<ColumnarDecoder>,
    pub retry: RetryPolicy,
    pub link_expiry_buffer: Duration,
    pub cancel: CancellationToken,
    pub stats: Arc<PipelineStats>,
    pub handle: Handle,
}

impl WorkerContext {
    /// Apply links from a batched resolver response to their chunks
    fn apply_links(&self, links: Vec<ChunkLink>) -> usize {
        let mut applied = 0;
        for link in links {
            let descriptor = usize::try_from(link.chunk_index)
                .ok()
                .and_then(|i| self.chunks.get(i));
            match descriptor {
                Some(descriptor) => {
                    if descriptor.set_link(link) {
                        applied += 1;
                    }
                }
                None => debug!(
                    statement_id = %self.statement_id,
                    chunk_index = link.chunk_index,
                    "resolver returned link for unknown chunk"
                ),
            }
        }
        applied
    }
}

/// Downloads and decodes one chunk
pub(crate) struct DownloadWorker {
    ctx: Arc<WorkerContext>,
    descriptor: Arc<ChunkDescriptor>,
}

impl DownloadWorker {
    pub fn new(ctx: Arc<WorkerContext>, descriptor: Arc<ChunkDescriptor>) -> Self {
        Self { ctx, descriptor }
    }

    /// Drive the chunk to a terminal status
    pub async fn run(self) {
        let started = Instant::now();
        let index = self.descriptor.index();
        let outcome = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => {
                Err(Error::cancelled(&self.ctx.statement_id, Some(index)))
            }
            result = self.download_with_retry() => result,
        };

        match outcome {
            Ok((decoded, bytes)) => {
                let rows = decoded.num_rows();
                if self.descriptor.complete(decoded) {
                    self.ctx.stats.chunks_succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        statement_id = %self.ctx.statement_id,
                        chunk_index = index,
                        rows,
                        bytes,
                        attempts = self.descriptor.attempts(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "chunk downloaded"
                    );
                }
            }
            Err(err) if err.is_cancelled() => {
                if self.descriptor.cancel() {
                    self.ctx.stats.chunks_cancelled.fetch_add(1, Ordering::Relaxed);
                }
                debug!(
                    statement_id = %self.ctx.statement_id,
                    chunk_index = index,
                    "chunk download cancelled"
                );
            }
            Err(err) => {
                error!(
                    statement_id = %self.ctx.statement_id,
                    chunk_index = index,
                    attempts = self.descriptor.attempts(),
                    error = %err,
                    "chunk download failed"
                );
                if self.descriptor.fail(err) {
                    self.ctx.stats.chunks_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    async fn download_with_retry(&self) -> Result<(ColumnBatchSet, u64)> {
        loop {
            let link = self.ensure_link().await?;
            let attempt = self.descriptor.begin_attempt()?;
            self.ctx.stats.download_attempts.fetch_add(1, Ordering::Relaxed);

            let err = match self.download_once(&link).await {
                Ok(done) => return Ok(done),
                Err(err) => err,
            };
            if !err.is_retriable() || !self.ctx.retry.should_retry(attempt) {
                return Err(err);
            }

            let delay = self.ctx.retry.backoff(attempt);
            warn!(
                statement_id = %self.ctx.statement_id,
                chunk_index = self.descriptor.index(),
                attempt,
                max_attempts = self.ctx.retry.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "chunk download failed, retrying"
            );
            if !self.descriptor.begin_retry(&err) {
                return Err(Error::cancelled(
                    &self.ctx.statement_id,
                    Some(self.descriptor.index()),
                ));
            }
            self.ctx.stats.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
        }
    }

    /// Return a link that stays valid past the expiry buffer, refreshing it if needed
    async fn ensure_link(&self) -> Result<ChunkLink> {
        let margin = self.ctx.link_expiry_buffer;
        if let Some(link) = self.descriptor.usable_link(margin) {
            return Ok(link);
        }

        let index = self.descriptor.index();
        let mut failures = 0u32;
        loop {
            self.ctx.stats.link_refreshes.fetch_add(1, Ordering::Relaxed);
            debug!(
                statement_id = %self.ctx.statement_id,
                chunk_index = index,
                "refreshing chunk link"
            );
            let resolved = self
                .ctx
                .resolver
                .resolve_links(&self.ctx.statement_id, index)
                .await
                .and_then(|links| {
                    self.ctx.apply_links(links);
                    self.descriptor.usable_link(margin).ok_or_else(|| {
                        Error::link_resolution(index, "resolver returned no usable link")
                    })
                });

            match resolved {
                Ok(link) => return Ok(link),
                Err(err) => {
                    failures += 1;
                    if !err.is_retriable() || !self.ctx.retry.should_retry(failures) {
                        return Err(err);
                    }
                    let delay = self.ctx.retry.backoff(failures);
                    warn!(
                        statement_id = %self.ctx.statement_id,
                        chunk_index = index,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "link refresh failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One fetch-decompress-decode pass; returns the decoded chunk and body size
    async fn download_once(&self, link: &ChunkLink) -> Result<(ColumnBatchSet, u64)> {
        let body = self.ctx.fetcher.fetch(link).await?;

        let tap = BodyTap::default();
        let stream = tap.wrap(body, self.descriptor.cancellation().clone());
        let reader =
            SyncIoBridge::new_with_handle(StreamReader::new(stream), self.ctx.handle.clone());

        let decoder = Arc::clone(&self.ctx.decoder);
        let index = self.descriptor.index();
        let rows = self.descriptor.row_count();
        let decoded = self
            .ctx
            .handle
            .spawn_blocking(move || decoder.decode(reader, index, rows))
            .await
            .map_err(|e| Error::internal(format!("decode task for chunk {index} failed: {e}")))?;

        let bytes = tap.bytes.load(Ordering::Relaxed);
        self.ctx.stats.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);

        match decoded {
            Ok(set) => Ok((set, bytes)),
            Err(err) => match tap.fault.lock().take() {
                Some(cause) => Err(err.with_transport_cause(cause)),
                None => Err(err),
            },
        }
    }
}

/// Observes a body stream on its way to the decoder: counts bytes and keeps
/// the transport error that ended it, if any.
#[derive(Default)]
struct BodyTap {
    fault: Arc<Mutex<Option<Error>>>,
    bytes: Arc<AtomicU64>,
}

impl BodyTap {
    fn wrap(
        &self,
        body: ChunkByteStream,
        cancel: CancellationToken,
    ) -> BoxStream<'static, io::Result<Bytes>> {
        let fault = Arc::clone(&self.fault);
        let bytes = Arc::clone(&self.bytes);
        body.take_until(cancel.cancelled_owned())
            .map(move |item| match item {
                Ok(chunk) => {
                    bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    Ok(chunk)
                }
                Err(err) => {
                    let io_err = io::Error::other(err.to_string());
                    *fault.lock() = Some(err);
                    Err(io_err)
                }
            })
            .boxed()
    }
}
