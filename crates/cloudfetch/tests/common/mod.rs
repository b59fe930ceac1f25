//! Shared fixtures for integration tests
//!
//! In-memory fakes for the chunk transport and the link service, plus Arrow
//! payload builders.

#![allow(dead_code)]

use arrow_array::{Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use cloudfetch::{
    encode_stream, ChunkByteStream, ChunkFetcher, ChunkLink, ChunkPipeline, CloudFetchConfig,
    CompressionCodec, Error, LinkResolver, PipelineDeps, Result, ResultManifest, StatementId,
};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const ROWS_PER_BATCH: usize = 7;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cloudfetch=debug")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Arrow fixtures
// ============================================================================

pub fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
    ]))
}

/// Name of row `id`; every fifth row is null
pub fn name_for(id: i64) -> Option<String> {
    (id % 5 != 0).then(|| format!("row-{id}"))
}

pub fn rows_batch(schema: &SchemaRef, start: i64, len: usize) -> RecordBatch {
    let ids: Vec<i64> = (start..start + len as i64).collect();
    let names: Vec<Option<String>> = ids.iter().map(|&id| name_for(id)).collect();
    RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(names)),
        ],
    )
    .unwrap()
}

/// Wire payload of a chunk covering rows `start..start + rows`
pub fn chunk_payload(start: u64, rows: u64, codec: CompressionCodec) -> Bytes {
    let schema = schema();
    let mut batches = Vec::new();
    let mut offset = 0u64;
    while offset < rows {
        let len = (rows - offset).min(ROWS_PER_BATCH as u64);
        batches.push(rows_batch(&schema, (start + offset) as i64, len as usize));
        offset += len;
    }
    encode_stream(&schema, &batches, codec).unwrap()
}

/// Payloads for contiguous chunks with the given row counts
pub fn payloads(row_counts: &[u64], codec: CompressionCodec) -> Vec<Bytes> {
    let mut start = 0;
    row_counts
        .iter()
        .map(|&rows| {
            let payload = chunk_payload(start, rows, codec);
            start += rows;
            payload
        })
        .collect()
}

// ============================================================================
// Links and manifests
// ============================================================================

pub fn link(index: u64, expires_in: chrono::Duration) -> ChunkLink {
    ChunkLink::new(
        index,
        format!("https://storage.test/initial/{index}"),
        Utc::now() + expires_in,
    )
}

pub fn valid_links(count: usize) -> Vec<ChunkLink> {
    (0..count as u64)
        .map(|i| link(i, chrono::Duration::hours(1)))
        .collect()
}

pub fn manifest(row_counts: &[u64], codec: CompressionCodec) -> ResultManifest {
    ResultManifest::from_row_counts(row_counts, codec)
        .with_initial_links(valid_links(row_counts.len()))
}

/// Config with millisecond backoff and no jitter
pub fn fast_config(parallel: usize) -> CloudFetchConfig {
    CloudFetchConfig::builder()
        .max_parallel_downloads(parallel)
        .retry_max_attempts(3)
        .retry_base_delay(Duration::from_millis(5))
        .retry_max_delay(Duration::from_millis(20))
        .retry_max_jitter(Duration::ZERO)
        .build()
        .unwrap()
}

pub async fn build_pipeline(
    manifest: impl Into<cloudfetch::ManifestSource>,
    fetcher: &Arc<ScriptedFetcher>,
    resolver: &Arc<CountingResolver>,
    config: CloudFetchConfig,
) -> ChunkPipeline {
    let deps = PipelineDeps::new(fetcher.clone(), resolver.clone());
    ChunkPipeline::new("stmt-test", manifest, deps, config)
        .await
        .unwrap()
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}

// ============================================================================
// Scripted fetcher
// ============================================================================

#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the request with a socket timeout
    Timeout,
    /// Answer with an HTTP status
    Status(u16),
    /// Send half of the body, then reset the connection
    ResetMidBody,
    /// Never answer
    Hang,
    /// Send half of the body, then stall forever
    HangBody,
    /// Answer normally after a delay
    Delay(Duration),
    /// Send bytes that are not an Arrow stream
    Garbage,
}

/// In-memory [`ChunkFetcher`] with per-chunk fault scripts
#[derive(Default)]
pub struct ScriptedFetcher {
    payloads: HashMap<u64, Bytes>,
    scripted: Mutex<HashMap<u64, VecDeque<Fault>>>,
    always: Mutex<HashMap<u64, Fault>>,
    attempts: Mutex<HashMap<u64, u32>>,
    requests: Mutex<Vec<ChunkLink>>,
    bodies_served: AtomicU32,
    bodies_dropped: Arc<AtomicU32>,
}

/// Counts a body stream as dropped when the stream goes away
struct BodyGuard(Arc<AtomicU32>);

impl Drop for BodyGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl ScriptedFetcher {
    pub fn new(payloads: Vec<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            payloads: payloads
                .into_iter()
                .enumerate()
                .map(|(i, p)| (i as u64, p))
                .collect(),
            ..Self::default()
        })
    }

    /// Apply `faults` to the next requests for `index`, in order
    pub fn fail_next(&self, index: u64, faults: impl IntoIterator<Item = Fault>) {
        self.scripted
            .lock()
            .entry(index)
            .or_default()
            .extend(faults);
    }

    /// Apply `fault` to every request for `index`
    pub fn fail_always(&self, index: u64, fault: Fault) {
        self.always.lock().insert(index, fault);
    }

    pub fn attempts(&self, index: u64) -> u32 {
        self.attempts.lock().get(&index).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.requests.lock().len()
    }

    /// Body streams handed out and not yet dropped by the reader
    pub fn open_bodies(&self) -> u32 {
        self.bodies_served.load(Ordering::SeqCst) - self.bodies_dropped.load(Ordering::SeqCst)
    }

    fn track(&self, body: ChunkByteStream) -> ChunkByteStream {
        self.bodies_served.fetch_add(1, Ordering::SeqCst);
        let guard = BodyGuard(Arc::clone(&self.bodies_dropped));
        body.map(move |item| {
            let _guard = &guard;
            item
        })
        .boxed()
    }

    pub fn requested_urls(&self, index: u64) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter(|link| link.chunk_index == index)
            .map(|link| link.url.clone())
            .collect()
    }

    fn next_fault(&self, index: u64) -> Option<Fault> {
        let scripted = self
            .scripted
            .lock()
            .get_mut(&index)
            .and_then(VecDeque::pop_front);
        scripted.or_else(|| self.always.lock().get(&index).cloned())
    }
}

fn body(payload: Bytes) -> ChunkByteStream {
    let pieces: Vec<Result<Bytes>> = (0..payload.len())
        .step_by(1024)
        .map(|start| Ok(payload.slice(start..(start + 1024).min(payload.len()))))
        .collect();
    stream::iter(pieces).boxed()
}

#[async_trait]
impl ChunkFetcher for ScriptedFetcher {
    async fn fetch(&self, link: &ChunkLink) -> Result<ChunkByteStream> {
        let index = link.chunk_index;
        *self.attempts.lock().entry(index).or_default() += 1;
        self.requests.lock().push(link.clone());

        let fault = self.next_fault(index);
        let payload = self
            .payloads
            .get(&index)
            .cloned()
            .ok_or_else(|| Error::http(404, format!("no payload for chunk {index}")))?;
        let half = payload.slice(..payload.len() / 2);

        let stream = match fault {
            None => body(payload),
            Some(Fault::Timeout) => return Err(Error::timeout("socket read timed out")),
            Some(Fault::Status(status)) => return Err(Error::http(status, "scripted status")),
            Some(Fault::ResetMidBody) => stream::iter(vec![
                Ok(half),
                Err(Error::transport("connection reset by peer")),
            ])
            .boxed(),
            Some(Fault::Hang) => futures::future::pending().await,
            Some(Fault::HangBody) => stream::iter(vec![Ok(half)])
                .chain(stream::pending())
                .boxed(),
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                body(payload)
            }
            Some(Fault::Garbage) => body(Bytes::from_static(
                b"\xff\xff\xff\xff\x08\x00\x00\x00garbage!",
            )),
        };
        Ok(self.track(stream))
    }
}

// ============================================================================
// Counting resolver
// ============================================================================

/// [`LinkResolver`] that issues fresh links and records every call
pub struct CountingResolver {
    calls: Mutex<Vec<u64>>,
    batch: u64,
    failures_left: AtomicU32,
    ttl: chrono::Duration,
}

impl Default for CountingResolver {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            batch: 1,
            failures_left: AtomicU32::new(0),
            ttl: chrono::Duration::hours(1),
        }
    }
}

impl CountingResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Issue links for `batch` consecutive chunks per call
    pub fn batched(batch: u64) -> Arc<Self> {
        Arc::new(Self {
            batch,
            ..Self::default()
        })
    }

    /// Fail the first `failures` calls with a retriable error
    pub fn failing_first(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(failures),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<u64> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, index: u64) -> usize {
        self.calls.lock().iter().filter(|&&i| i == index).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl LinkResolver for CountingResolver {
    async fn resolve_links(
        &self,
        _statement_id: &StatementId,
        chunk_index: u64,
    ) -> Result<Vec<ChunkLink>> {
        self.calls.lock().push(chunk_index);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::link_resolution(chunk_index, "link service unavailable"));
        }
        let expires_at = Utc::now() + self.ttl;
        Ok((chunk_index..chunk_index + self.batch)
            .map(|i| ChunkLink::new(i, format!("https://storage.test/refreshed/{i}"), expires_at))
            .collect())
    }
}

// ============================================================================
// Consumption helpers
// ============================================================================

/// Drain the pipeline, returning the id column of every row in order
pub async fn read_all_ids(pipeline: &ChunkPipeline) -> Result<Vec<i64>> {
    let mut ids = Vec::new();
    while pipeline.advance() {
        let chunk = pipeline.current().await?;
        let set = chunk.batches().expect("succeeded chunk holds data");
        for batch in set.batches() {
            let column = batch
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap();
            ids.extend(column.values().iter().copied());
        }
    }
    Ok(ids)
}
