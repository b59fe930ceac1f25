//! Chunk payload decoding
//!
//! A chunk payload is an Arrow IPC stream (schema message followed by record
//! batches), optionally wrapped in a compression codec. Decoding is strictly
//! streaming: bytes are pulled from the reader as the decoder needs them.
//!
//! On any failure the batches decoded so far are dropped before the error is
//! returned, so a failed decode never leaves buffers behind.

use arrow_array::RecordBatch;
use arrow_ipc::reader::StreamReader;
use arrow_ipc::writer::StreamWriter;
use arrow_schema::{Schema, SchemaRef};
use bytes::Bytes;
use std::io::{BufReader, Read};
use tracing::trace;

use crate::columnar::ColumnBatchSet;
use crate::compression::{compress, decompress_reader, CompressionCodec};
use crate::error::{Error, Result};

/// Decodes compressed Arrow IPC streams into [`ColumnBatchSet`]s
#[derive(Debug, Clone, Default)]
pub struct ColumnarDecoder {
    codec: CompressionCodec,
    expected_schema: Option<SchemaRef>,
    max_memory_bytes: Option<usize>,
}

impl ColumnarDecoder {
    pub fn new(codec: CompressionCodec) -> Self {
        Self {
            codec,
            expected_schema: None,
            max_memory_bytes: None,
        }
    }

    /// Require the embedded schema to match an out-of-band schema
    pub fn with_expected_schema(mut self, schema: Option<SchemaRef>) -> Self {
        self.expected_schema = schema;
        self
    }

    /// Fail with [`Error::ResourceExhausted`] once decoded buffers exceed `limit`
    pub fn with_max_memory_bytes(mut self, limit: Option<usize>) -> Self {
        self.max_memory_bytes = limit;
        self
    }

    pub fn codec(&self) -> CompressionCodec {
        self.codec
    }

    pub fn expected_schema(&self) -> Option<&SchemaRef> {
        self.expected_schema.as_ref()
    }

    /// Decode a whole chunk from `reader`.
    ///
    /// `expected_rows` is the row count declared for the chunk; any other
    /// total is an error.
    pub fn decode<R>(
        &self,
        reader: R,
        chunk_index: u64,
        expected_rows: u64,
    ) -> Result<ColumnBatchSet>
    where
        R: Read + Send + 'static,
    {
        let input = decompress_reader(reader, self.codec)?;
        let stream = StreamReader::try_new(BufReader::new(input), None)?;
        let schema = stream.schema();
        if let Some(expected) = &self.expected_schema {
            check_schema(expected, &schema)?;
        }

        let mut batches = Vec::new();
        let mut rows: u64 = 0;
        let mut memory = 0usize;
        for batch in stream {
            let batch = batch?;
            rows += batch.num_rows() as u64;
            memory += batch.get_array_memory_size();
            if let Some(limit) = self.max_memory_bytes {
                if memory > limit {
                    return Err(Error::resource_exhausted(format!(
                        "chunk {chunk_index} exceeds {limit} bytes after {rows} decoded rows"
                    )));
                }
            }
            batches.push(batch);
        }

        if rows != expected_rows {
            return Err(Error::RowCountMismatch {
                chunk_index,
                expected: expected_rows,
                actual: rows,
            });
        }

        trace!(
            chunk_index,
            rows,
            batches = batches.len(),
            memory_bytes = memory,
            "decoded chunk"
        );
        Ok(ColumnBatchSet::new(schema, batches))
    }

    /// Decode a chunk held entirely in memory
    pub fn decode_bytes(
        &self,
        data: Bytes,
        chunk_index: u64,
        expected_rows: u64,
    ) -> Result<ColumnBatchSet> {
        self.decode(std::io::Cursor::new(data), chunk_index, expected_rows)
    }
}

fn check_schema(expected: &Schema, actual: &Schema) -> Result<()> {
    if expected.fields().len() != actual.fields().len() {
        return Err(Error::SchemaMismatch {
            message: format!(
                "expected {} columns, stream has {}",
                expected.fields().len(),
                actual.fields().len()
            ),
        });
    }
    for (position, (want, got)) in expected.fields().iter().zip(actual.fields()).enumerate() {
        if want.data_type() != got.data_type() {
            return Err(Error::SchemaMismatch {
                message: format!(
                    "column {position} ({}): expected {}, stream has {}",
                    want.name(),
                    want.data_type(),
                    got.data_type()
                ),
            });
        }
    }
    Ok(())
}

/// Encode batches into the chunk wire format
pub fn encode_stream(
    schema: &SchemaRef,
    batches: &[RecordBatch],
    codec: CompressionCodec,
) -> Result<Bytes> {
    let mut writer = StreamWriter::try_new(Vec::new(), schema.as_ref())?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.finish()?;
    let raw = writer.into_inner()?;
    Ok(Bytes::from(compress(&raw, codec)?))
}
