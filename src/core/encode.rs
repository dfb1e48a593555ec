//! Purpose: Serialize a materialized `Table` into an in-memory Parquet buffer.
//! Exports: `encode_table`, `EncodeOptions`.
//! Role: Final step of a query; the buffer is handed to the caller whole.
//! Invariants: Output is deterministic for a given table and options.
//! Invariants: Default options match a plain `ArrowWriter` with default properties (uncompressed).
//! Invariants: Source key/value metadata is carried over; the writer regenerates the arrow schema entry.
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::core::error::{Error, ErrorKind};
use crate::core::scan::Table;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EncodeCompression {
    #[default]
    None,
    Snappy,
    Zstd,
}

impl From<EncodeCompression> for Compression {
    fn from(value: EncodeCompression) -> Self {
        match value {
            EncodeCompression::None => Compression::UNCOMPRESSED,
            EncodeCompression::Snappy => Compression::SNAPPY,
            EncodeCompression::Zstd => Compression::ZSTD(Default::default()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EncodeOptions {
    pub compression: EncodeCompression,
}

pub fn encode_table(table: &Table, options: EncodeOptions) -> Result<Vec<u8>, Error> {
    let metadata = table.key_value_metadata();
    let properties = WriterProperties::builder()
        .set_compression(options.compression.into())
        .set_key_value_metadata((!metadata.is_empty()).then(|| metadata.to_vec()))
        .build();

    let mut out_buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut out_buffer, table.schema().clone(), Some(properties))
        .map_err(encode_error)?;
    for batch in table.batches() {
        write_batch(&mut writer, batch)?;
    }
    writer.close().map_err(encode_error)?;
    Ok(out_buffer)
}

fn write_batch(writer: &mut ArrowWriter<&mut Vec<u8>>, batch: &RecordBatch) -> Result<(), Error> {
    if batch.num_rows() == 0 {
        return Ok(());
    }
    writer.write(batch).map_err(encode_error)
}

fn encode_error(err: parquet::errors::ParquetError) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message("failed to encode parquet output")
        .with_source(err)
}
