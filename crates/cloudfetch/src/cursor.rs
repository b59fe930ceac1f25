//! Row-level consumer of a [`ChunkPipeline`]

use arrow_array::{Array, ArrayRef};
use std::sync::Arc;

use crate::columnar::ColumnBatchSet;
use crate::error::{Error, Result};
use crate::pipeline::ChunkPipeline;

/// Reads a result one row at a time, pulling chunks from the pipeline as
/// each one is exhausted.
///
/// A failed chunk surfaces as an error when the cursor reaches it; rows read
/// before that stay valid.
pub struct ResultCursor {
    pipeline: Arc<ChunkPipeline>,
    batches: Option<Arc<ColumnBatchSet>>,
    chunk_index: Option<u64>,
    chunk_row_offset: u64,
    /// Row within the current chunk
    row: Option<usize>,
    /// `(batch, row_in_batch)` of the current row
    location: Option<(usize, usize)>,
    rows_read: u64,
    done: bool,
}

impl std::fmt::Debug for ResultCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCursor")
            .field("statement_id", self.pipeline.statement_id())
            .field("chunk_index", &self.chunk_index)
            .field("row", &self.row)
            .field("rows_read", &self.rows_read)
            .field("done", &self.done)
            .finish()
    }
}

impl ResultCursor {
    pub fn new(pipeline: impl Into<Arc<ChunkPipeline>>) -> Self {
        Self {
            pipeline: pipeline.into(),
            batches: None,
            chunk_index: None,
            chunk_row_offset: 0,
            row: None,
            location: None,
            rows_read: 0,
            done: false,
        }
    }

    /// Move to the next row; `Ok(false)` once the result is exhausted
    pub async fn next_row(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        loop {
            if let Some(set) = &self.batches {
                let next = self.row.map_or(0, |row| row + 1);
                if next < set.num_rows() {
                    self.row = Some(next);
                    self.location = set.locate(next);
                    self.rows_read += 1;
                    return Ok(true);
                }
            }

            self.batches = None;
            self.row = None;
            self.location = None;
            if !self.pipeline.advance() {
                self.done = true;
                return Ok(false);
            }
            match self.load_current().await {
                Ok(()) => {}
                Err(err) => {
                    self.done = true;
                    return Err(err);
                }
            }
        }
    }

    async fn load_current(&mut self) -> Result<()> {
        let chunk = self.pipeline.current().await?;
        let set = chunk.batches().ok_or_else(|| {
            Error::cancelled(self.pipeline.statement_id(), Some(chunk.index()))
        })?;
        self.chunk_index = Some(chunk.index());
        self.chunk_row_offset = chunk.row_offset();
        self.batches = Some(set);
        Ok(())
    }

    /// Array holding `column` of the current row and the row's offset in it
    pub fn value(&self, column: usize) -> Option<(&ArrayRef, usize)> {
        let (batch, offset) = self.location?;
        let array = self.batches.as_ref()?.column(batch, column)?;
        Some((array, offset))
    }

    /// Whether `column` of the current row is null; `None` without a current row
    pub fn is_null(&self, column: usize) -> Option<bool> {
        self.value(column).map(|(array, offset)| array.is_null(offset))
    }

    /// Chunk holding the current row
    pub fn current_chunk_index(&self) -> Option<u64> {
        self.chunk_index
    }

    /// Result-wide index of the current row
    pub fn row_number(&self) -> Option<u64> {
        self.row.map(|row| self.chunk_row_offset + row as u64)
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    pub fn num_columns(&self) -> Option<usize> {
        self.batches.as_ref().map(|set| set.num_columns())
    }

    pub fn pipeline(&self) -> &Arc<ChunkPipeline> {
        &self.pipeline
    }

    /// Close the underlying pipeline
    pub fn close(&mut self) {
        self.batches = None;
        self.location = None;
        self.done = true;
        self.pipeline.close();
    }
}
