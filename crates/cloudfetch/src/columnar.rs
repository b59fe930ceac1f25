//! In-memory column batches of a decoded chunk
//!
//! A [`ColumnBatchSet`] owns the Arrow record batches of one chunk and maps a
//! chunk-relative row number to `(batch, row_in_batch)`. Producers usually
//! emit batches of a fixed size, in which case lookups are a single division;
//! otherwise the batch start offsets are binary searched.

use arrow_array::{Array, ArrayRef, RecordBatch};
use arrow_schema::SchemaRef;

/// Decoded record batches of a single chunk
#[derive(Debug, Clone)]
pub struct ColumnBatchSet {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    /// First chunk-relative row of every batch
    row_starts: Vec<usize>,
    num_rows: usize,
    /// Rows per batch when every batch but the last has the same size
    uniform_rows: Option<usize>,
}

impl ColumnBatchSet {
    /// Wrap decoded batches; all batches must share `schema`
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        let mut row_starts = Vec::with_capacity(batches.len());
        let mut num_rows = 0;
        for batch in &batches {
            row_starts.push(num_rows);
            num_rows += batch.num_rows();
        }
        let uniform_rows = uniform_batch_rows(&batches);
        Self {
            schema,
            batches,
            row_starts,
            num_rows,
            uniform_rows,
        }
    }

    /// A set with no batches
    pub fn empty(schema: SchemaRef) -> Self {
        Self::new(schema, Vec::new())
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.schema.fields().len()
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn batch(&self, index: usize) -> Option<&RecordBatch> {
        self.batches.get(index)
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    /// Column `column` of batch `batch`
    pub fn column(&self, batch: usize, column: usize) -> Option<&ArrayRef> {
        let batch = self.batches.get(batch)?;
        (column < batch.num_columns()).then(|| batch.column(column))
    }

    /// Map a chunk-relative row to `(batch_index, row_in_batch)`
    pub fn locate(&self, row: usize) -> Option<(usize, usize)> {
        if row >= self.num_rows {
            return None;
        }
        if let Some(per_batch) = self.uniform_rows {
            return Some((row / per_batch, row % per_batch));
        }
        // Last batch starting at or before `row`; empty batches share the start
        // of their successor and are skipped by taking the last match.
        let batch = self.row_starts.partition_point(|&start| start <= row) - 1;
        Some((batch, row - self.row_starts[batch]))
    }

    /// The array holding `(row, column)` and the row's position inside it
    pub fn value(&self, row: usize, column: usize) -> Option<(&ArrayRef, usize)> {
        let (batch, offset) = self.locate(row)?;
        let array = self.column(batch, column)?;
        Some((array, offset))
    }

    /// Whether `(row, column)` is null; `None` when out of range
    pub fn is_null(&self, row: usize, column: usize) -> Option<bool> {
        self.value(row, column)
            .map(|(array, offset)| array.is_null(offset))
    }

    /// Approximate heap footprint of the decoded buffers
    pub fn memory_size(&self) -> usize {
        self.batches
            .iter()
            .map(RecordBatch::get_array_memory_size)
            .sum()
    }

    /// Row-by-row cursor over the set
    pub fn rows(&self) -> RowCursor<'_> {
        RowCursor {
            set: self,
            batch: 0,
            row_in_batch: 0,
            row: 0,
        }
    }

    pub fn into_batches(self) -> Vec<RecordBatch> {
        self.batches
    }
}

fn uniform_batch_rows(batches: &[RecordBatch]) -> Option<usize> {
    let (last, head) = batches.split_last()?;
    let per_batch = head.first().unwrap_or(last).num_rows();
    if per_batch == 0 {
        return None;
    }
    let head_uniform = head.iter().all(|b| b.num_rows() == per_batch);
    let last_fits = last.num_rows() > 0 && last.num_rows() <= per_batch;
    (head_uniform && last_fits).then_some(per_batch)
}

/// Sequential row cursor over a [`ColumnBatchSet`]; empty batches are skipped
pub struct RowCursor<'a> {
    set: &'a ColumnBatchSet,
    batch: usize,
    row_in_batch: usize,
    row: usize,
}

impl<'a> Iterator for RowCursor<'a> {
    type Item = RowRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let batch = self.set.batches.get(self.batch)?;
            if self.row_in_batch < batch.num_rows() {
                let row = RowRef {
                    batch,
                    row_in_batch: self.row_in_batch,
                    row: self.row,
                };
                self.row_in_batch += 1;
                self.row += 1;
                return Some(row);
            }
            self.batch += 1;
            self.row_in_batch = 0;
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.set.num_rows - self.row;
        (remaining, Some(remaining))
    }
}

/// A single row inside a batch
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    batch: &'a RecordBatch,
    row_in_batch: usize,
    row: usize,
}

impl<'a> RowRef<'a> {
    /// Chunk-relative row number
    pub fn index(&self) -> usize {
        self.row
    }

    pub fn row_in_batch(&self) -> usize {
        self.row_in_batch
    }

    pub fn column(&self, column: usize) -> Option<&'a ArrayRef> {
        (column < self.batch.num_columns()).then(|| self.batch.column(column))
    }

    pub fn is_null(&self, column: usize) -> Option<bool> {
        self.column(column).map(|a| a.is_null(self.row_in_batch))
    }
}
