//! Segment file format, version 1
//!
//! ```text
//! magic "SHSG" | u16 version | u16 flags | u32 header_len | header (JSON SegmentMeta)
//!              | u64 body_len | u32 crc32(body) | body (Parquet)
//! ```
//!
//! All integers are little endian. The high byte of `version` is the major
//! version: readers reject an unknown major and accept any minor. Header
//! fields added later must be optional; unknown fields are ignored. `flags`
//! bits are reserved and ignored by v1 readers.

use crate::schema::{stored_schema, KEY_FIELD, ORDINAL_FIELD, SEQ_FIELD, TIMESTAMP_FIELD};
use crate::{Error, Result, ShardGroupId};
use arrow::compute::{concat_batches, lexsort_to_indices, min, max, take, SortColumn};
use arrow_array::cast::AsArray;
use arrow_array::types::{TimestampNanosecondType, UInt64Type};
use arrow_array::{ArrayRef, RecordBatch};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::{EnabledStatistics, WriterProperties, WriterVersion};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const SEGMENT_MAGIC: &[u8; 4] = b"SHSG";
/// Major 1, minor 0
pub const SEGMENT_FORMAT_VERSION: u16 = 0x0100;
const FIXED_PREFIX: usize = 4 + 2 + 2 + 4;

/// Segment header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub segment_id: String,
    pub shard: ShardGroupId,
    /// 0 for flushed segments, +1 per compaction generation
    #[serde(default)]
    pub level: u32,
    pub min_key: String,
    pub max_key: String,
    pub min_seq: u64,
    pub max_seq: u64,
    pub row_count: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub created_at_ms: i64,
}

/// A sealed, sorted block of stored rows
#[derive(Debug, Clone)]
pub struct Segment {
    pub meta: SegmentMeta,
    pub batch: RecordBatch,
}

impl Segment {
    /// Seal `batches` into a segment sorted by `(key, seq, ordinal)`
    pub fn seal(
        segment_id: String,
        shard: ShardGroupId,
        level: u32,
        batches: &[RecordBatch],
        created_at_ms: i64,
    ) -> Result<Self> {
        if batches.is_empty() {
            return Err(Error::InvalidRequest("cannot seal an empty segment".into()));
        }
        let batch = sort_stored(&concat_batches(&stored_schema(), batches)?)?;
        if batch.num_rows() == 0 {
            return Err(Error::InvalidRequest("cannot seal an empty segment".into()));
        }

        let keys = column(&batch, KEY_FIELD)?.as_string::<i32>();
        let seqs = column(&batch, SEQ_FIELD)?.as_primitive::<UInt64Type>();
        let timestamps = column(&batch, TIMESTAMP_FIELD)?.as_primitive::<TimestampNanosecondType>();
        let last = batch.num_rows() - 1;

        let meta = SegmentMeta {
            segment_id,
            shard,
            level,
            min_key: keys.value(0).to_string(),
            max_key: keys.value(last).to_string(),
            min_seq: min(seqs).unwrap_or_default(),
            max_seq: max(seqs).unwrap_or_default(),
            row_count: batch.num_rows() as u64,
            min_timestamp: min(timestamps).unwrap_or_default(),
            max_timestamp: max(timestamps).unwrap_or_default(),
            created_at_ms,
        };
        Ok(Self { meta, batch })
    }

    pub fn encode(&self) -> Result<Bytes> {
        let header = serde_json::to_vec(&self.meta)?;
        let body = write_parquet(&self.batch)?;

        let mut out = BytesMut::with_capacity(FIXED_PREFIX + header.len() + 12 + body.len());
        out.put_slice(SEGMENT_MAGIC);
        out.put_u16_le(SEGMENT_FORMAT_VERSION);
        out.put_u16_le(0);
        out.put_u32_le(header.len() as u32);
        out.put_slice(&header);
        out.put_u64_le(body.len() as u64);
        out.put_u32_le(crc32fast::hash(&body));
        out.put_slice(&body);
        Ok(out.freeze())
    }

    pub fn decode(bytes: Bytes) -> Result<Self> {
        let (meta, body) = split(bytes)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(body)?.build()?;
        let batches = reader
            .map(|batch| Ok(RecordBatch::try_new(stored_schema(), batch?.columns().to_vec())?))
            .collect::<Result<Vec<_>>>()?;
        let batch = if batches.is_empty() {
            RecordBatch::new_empty(stored_schema())
        } else {
            concat_batches(&stored_schema(), &batches)?
        };
        if batch.num_rows() as u64 != meta.row_count {
            return Err(Error::CorruptSegment(format!(
                "segment {} holds {} rows, header says {}",
                meta.segment_id,
                batch.num_rows(),
                meta.row_count
            )));
        }
        Ok(Self { meta, batch })
    }
}

/// Read only the header of an encoded segment
pub fn decode_meta(bytes: Bytes) -> Result<SegmentMeta> {
    Ok(split(bytes)?.0)
}

fn split(mut bytes: Bytes) -> Result<(SegmentMeta, Bytes)> {
    if bytes.len() < FIXED_PREFIX {
        return Err(Error::CorruptSegment("segment shorter than its prefix".into()));
    }
    if &bytes[0..4] != SEGMENT_MAGIC {
        return Err(Error::CorruptSegment("bad segment magic".into()));
    }
    bytes.advance(4);
    let version = bytes.get_u16_le();
    if version >> 8 != SEGMENT_FORMAT_VERSION >> 8 {
        return Err(Error::CorruptSegment(format!(
            "unsupported segment major version {}",
            version >> 8
        )));
    }
    let _flags = bytes.get_u16_le();
    let header_len = bytes.get_u32_le() as usize;
    if bytes.len() < header_len + 12 {
        return Err(Error::CorruptSegment("segment header truncated".into()));
    }
    let meta: SegmentMeta = serde_json::from_slice(&bytes[..header_len])
        .map_err(|e| Error::CorruptSegment(format!("bad segment header: {}", e)))?;
    bytes.advance(header_len);
    let body_len = bytes.get_u64_le() as usize;
    let crc = bytes.get_u32_le();
    if bytes.len() < body_len {
        return Err(Error::CorruptSegment(format!(
            "segment {} body truncated",
            meta.segment_id
        )));
    }
    let body = bytes.slice(..body_len);
    if crc32fast::hash(&body) != crc {
        return Err(Error::CorruptSegment(format!(
            "segment {} failed checksum",
            meta.segment_id
        )));
    }
    Ok((meta, body))
}

/// Sort stored rows by `(key, seq, ordinal)`
pub fn sort_stored(batch: &RecordBatch) -> Result<RecordBatch> {
    if batch.num_rows() <= 1 {
        return Ok(batch.clone());
    }
    let sort_columns: Vec<SortColumn> = [KEY_FIELD, SEQ_FIELD, ORDINAL_FIELD]
        .iter()
        .map(|name| {
            Ok(SortColumn {
                values: Arc::clone(column(batch, name)?),
                options: None,
            })
        })
        .collect::<Result<_>>()?;
    let indices = lexsort_to_indices(&sort_columns, None)?;
    let columns: Vec<ArrayRef> = batch
        .columns()
        .iter()
        .map(|col| take(col.as_ref(), &indices, None))
        .collect::<std::result::Result<_, _>>()?;
    Ok(RecordBatch::try_new(batch.schema(), columns)?)
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::CorruptSegment(format!("missing column {}", name)))
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_writer_version(WriterVersion::PARQUET_2_0)
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .set_dictionary_enabled(true)
        .set_max_row_group_size(500_000)
        // Page statistics on key and timestamp let readers skip pages.
        .set_statistics_enabled(EnabledStatistics::Page)
        .set_bloom_filter_enabled(false)
        .set_data_page_size_limit(1024 * 1024)
        .build()
}

fn write_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    {
        let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(writer_properties()))?;
        writer.write(batch)?;
        writer.close()?;
    }
    Ok(buffer)
}
