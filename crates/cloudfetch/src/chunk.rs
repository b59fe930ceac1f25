//! Per-chunk state
//!
//! A [`ChunkDescriptor`] is shared between the download task that produces
//! the chunk and the consumer that reads it. Status, link, decoded data and
//! error live under one lock so the consumer never observes a status without
//! its matching payload. Status changes are also published on a watch
//! channel, which is what [`ChunkDescriptor::wait_ready`] parks on.
//!
//! ```text
//! Pending ──► UrlFetched ──► Downloading ──► Succeeded ──► Released
//!                               │  ▲
//!                               ▼  │
//!                             Retrying ──► FailedAborted ──► Released
//!
//! any non-terminal state ──► Cancelled | Released
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::columnar::ColumnBatchSet;
use crate::error::{Error, Result};
use crate::link::{ChunkLink, StatementId};
use crate::manifest::{ChunkInfo, ResultLink};

/// Lifecycle state of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkStatus {
    /// Known from the manifest, no link yet
    Pending,
    /// Link available
    UrlFetched,
    /// HTTP request issued, body being decoded
    Downloading,
    /// Waiting out the backoff before another attempt
    Retrying,
    /// Decoded and resident
    Succeeded,
    /// Terminal failure; the error is stored on the descriptor
    FailedAborted,
    /// Download stopped because the pipeline closed
    Cancelled,
    /// Decoded data freed
    Released,
}

impl ChunkStatus {
    /// Whether a waiting consumer can stop waiting
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::FailedAborted | Self::Cancelled | Self::Released
        )
    }

    pub fn can_transition_to(self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        match self {
            Pending => matches!(next, UrlFetched | FailedAborted | Cancelled | Released),
            UrlFetched => matches!(next, Downloading | FailedAborted | Cancelled | Released),
            Downloading => matches!(
                next,
                Succeeded | Retrying | FailedAborted | Cancelled | Released
            ),
            Retrying => matches!(next, Downloading | FailedAborted | Cancelled | Released),
            Succeeded | FailedAborted | Cancelled => next == Released,
            Released => false,
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::UrlFetched => "url_fetched",
            Self::Downloading => "downloading",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::FailedAborted => "failed_aborted",
            Self::Cancelled => "cancelled",
            Self::Released => "released",
        };
        f.write_str(name)
    }
}

struct ChunkState {
    status: ChunkStatus,
    link: Option<ChunkLink>,
    decoded: Option<Arc<ColumnBatchSet>>,
    error: Option<Arc<Error>>,
    last_error: Option<String>,
}

/// State record of one chunk
pub struct ChunkDescriptor {
    statement_id: StatementId,
    index: u64,
    row_offset: u64,
    row_count: u64,
    byte_count: Option<u64>,
    state: Mutex<ChunkState>,
    status_tx: watch::Sender<ChunkStatus>,
    admitted: AtomicBool,
    attempts: AtomicU32,
    task: Mutex<Option<AbortHandle>>,
    /// Cuts the body stream of an in-flight download on cancel or release
    cancel: CancellationToken,
}

impl ChunkDescriptor {
    fn with_state(
        statement_id: &StatementId,
        index: u64,
        row_offset: u64,
        row_count: u64,
        byte_count: Option<u64>,
        link: Option<ChunkLink>,
    ) -> Self {
        let status = if link.is_some() {
            ChunkStatus::UrlFetched
        } else {
            ChunkStatus::Pending
        };
        let (status_tx, _) = watch::channel(status);
        Self {
            statement_id: statement_id.clone(),
            index,
            row_offset,
            row_count,
            byte_count,
            state: Mutex::new(ChunkState {
                status,
                link,
                decoded: None,
                error: None,
                last_error: None,
            }),
            status_tx,
            admitted: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Descriptor for a chunk of a complete manifest; starts `Pending`
    pub fn from_chunk_info(statement_id: &StatementId, info: &ChunkInfo) -> Self {
        Self::with_state(
            statement_id,
            info.chunk_index,
            info.row_offset,
            info.row_count,
            info.byte_count,
            None,
        )
    }

    /// Descriptor for a continuation link; starts `UrlFetched`
    pub fn from_result_link(statement_id: &StatementId, index: u64, link: &ResultLink) -> Self {
        let mut chunk_link = ChunkLink::new(index, link.url.clone(), link.expires_at);
        chunk_link.headers = link.headers.clone();
        chunk_link.row_offset = Some(link.start_row_offset);
        chunk_link.row_count = Some(link.row_count);
        chunk_link.byte_count = link.byte_count;
        Self::with_state(
            statement_id,
            index,
            link.start_row_offset,
            link.row_count,
            link.byte_count,
            Some(chunk_link),
        )
    }

    pub fn statement_id(&self) -> &StatementId {
        &self.statement_id
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn row_offset(&self) -> u64 {
        self.row_offset
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn byte_count(&self) -> Option<u64> {
        self.byte_count
    }

    pub fn status(&self) -> ChunkStatus {
        self.state.lock().status
    }

    pub fn link(&self) -> Option<ChunkLink> {
        self.state.lock().link.clone()
    }

    /// Decoded batches; `Some` only while the chunk is `Succeeded`
    pub fn batches(&self) -> Option<Arc<ColumnBatchSet>> {
        self.state.lock().decoded.clone()
    }

    /// Terminal failure, if any
    pub fn error(&self) -> Option<Arc<Error>> {
        self.state.lock().error.clone()
    }

    /// Message of the most recent failed attempt, retried or not
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    /// Download attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Whether a download task has ever been admitted for this chunk
    pub fn is_admitted(&self) -> bool {
        self.admitted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_admitted(&self) {
        self.admitted.store(true, Ordering::Release);
    }

    pub(crate) fn set_task(&self, handle: AbortHandle) {
        *self.task.lock() = Some(handle);
    }

    /// Token fired when the chunk is cancelled or released
    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Current link if it stays valid for longer than `margin`
    pub fn usable_link(&self, margin: Duration) -> Option<ChunkLink> {
        self.state
            .lock()
            .link
            .as_ref()
            .filter(|link| link.is_usable(margin))
            .cloned()
    }

    /// Store a freshly resolved link.
    ///
    /// Moves `Pending` to `UrlFetched`; later states keep their status. Links
    /// arriving for a chunk that already reached a terminal state are ignored
    /// and `false` is returned.
    pub fn set_link(&self, link: ChunkLink) -> bool {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.link = Some(link);
        if state.status == ChunkStatus::Pending {
            self.transition(&mut state, ChunkStatus::UrlFetched);
        }
        true
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// `Succeeded` and `FailedAborted` carry a payload and are only reachable
    /// through [`complete`](Self::complete) and [`fail`](Self::fail).
    pub fn set_status(&self, next: ChunkStatus) -> Result<()> {
        let mut state = self.state.lock();
        if matches!(next, ChunkStatus::Succeeded | ChunkStatus::FailedAborted) {
            return Err(Error::internal(format!(
                "chunk {} cannot enter {next} without a payload",
                self.index
            )));
        }
        if !state.status.can_transition_to(next) {
            return Err(Error::internal(format!(
                "chunk {}: illegal transition {} -> {next}",
                self.index, state.status
            )));
        }
        if next == ChunkStatus::Released {
            state.decoded = None;
        }
        self.transition(&mut state, next);
        drop(state);
        if matches!(next, ChunkStatus::Cancelled | ChunkStatus::Released) {
            self.stop_download();
        }
        Ok(())
    }

    /// Start a download attempt; returns the attempt number
    pub(crate) fn begin_attempt(&self) -> Result<u32> {
        let mut state = self.state.lock();
        if !state.status.can_transition_to(ChunkStatus::Downloading) {
            return Err(match state.status {
                ChunkStatus::Cancelled | ChunkStatus::Released => {
                    Error::cancelled(&self.statement_id, Some(self.index))
                }
                status => Error::internal(format!(
                    "chunk {}: cannot start a download from {status}",
                    self.index
                )),
            });
        }
        self.transition(&mut state, ChunkStatus::Downloading);
        Ok(self.attempts.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Record a retriable failure and enter `Retrying`
    pub(crate) fn begin_retry(&self, error: &Error) -> bool {
        let mut state = self.state.lock();
        state.last_error = Some(error.to_string());
        if !state.status.can_transition_to(ChunkStatus::Retrying) {
            return false;
        }
        self.transition(&mut state, ChunkStatus::Retrying);
        true
    }

    /// Store decoded data and enter `Succeeded`.
    ///
    /// Returns `false` (dropping `decoded`) if the chunk was cancelled or
    /// released while decoding.
    pub fn complete(&self, decoded: ColumnBatchSet) -> bool {
        let mut state = self.state.lock();
        if !state.status.can_transition_to(ChunkStatus::Succeeded) {
            return false;
        }
        state.decoded = Some(Arc::new(decoded));
        state.error = None;
        self.transition(&mut state, ChunkStatus::Succeeded);
        true
    }

    /// Store a terminal error and enter `FailedAborted`
    pub fn fail(&self, error: Error) -> bool {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.last_error = Some(error.to_string());
        state.error = Some(Arc::new(error));
        state.decoded = None;
        self.transition(&mut state, ChunkStatus::FailedAborted);
        true
    }

    /// Stop a non-terminal chunk; aborts its download task
    pub fn cancel(&self) -> bool {
        let cancelled = {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                false
            } else {
                self.transition(&mut state, ChunkStatus::Cancelled);
                true
            }
        };
        if cancelled {
            self.stop_download();
        }
        cancelled
    }

    /// Free decoded data and enter `Released`.
    ///
    /// Returns `true` only on the call that performs the release; releasing
    /// again is a no-op.
    pub fn release(&self) -> bool {
        let released = {
            let mut state = self.state.lock();
            if state.status == ChunkStatus::Released {
                false
            } else {
                state.decoded = None;
                self.transition(&mut state, ChunkStatus::Released);
                true
            }
        };
        if released {
            self.stop_download();
            trace!(
                statement_id = %self.statement_id,
                chunk_index = self.index,
                "released chunk"
            );
        }
        released
    }

    /// Wait until the chunk reaches a terminal status and return it
    pub async fn wait_ready(&self) -> ChunkStatus {
        let mut rx = self.status_tx.subscribe();
        let status = match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            // The sender lives as long as `self`
            Err(_) => self.status(),
        };
        status
    }

    fn transition(&self, state: &mut ChunkState, next: ChunkStatus) {
        state.status = next;
        self.status_tx.send_replace(next);
    }

    /// Abort the download task and end its body stream; a decode running on a
    /// blocking thread sees end-of-stream and returns
    fn stop_download(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for ChunkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChunkDescriptor")
            .field("statement_id", &self.statement_id)
            .field("index", &self.index)
            .field("row_offset", &self.row_offset)
            .field("row_count", &self.row_count)
            .field("status", &state.status)
            .field("has_link", &state.link.is_some())
            .field("attempts", &self.attempts())
            .finish()
    }
}
