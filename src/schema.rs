//! Row model and Arrow schemas
//!
//! A row is one scraped document landed by the scheduler: the shard key it is
//! partitioned by, the fetch timestamp, the source it came from, an optional
//! numeric measure the BI layer aggregates, and the raw payload.
//!
//! Stored batches carry two internal columns on top of the row columns:
//! the commit sequence number of the write record and the row's ordinal
//! within that record. `(key, seq, ordinal)` totally orders a replica.

use crate::{Error, Result};
use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, TimestampNanosecondType, UInt32Type, UInt64Type};
use arrow_array::{
    Array, ArrayRef, Float64Array, RecordBatch, StringArray, TimestampNanosecondArray,
    UInt32Array, UInt64Array,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::{Arc, OnceLock};

pub const KEY_FIELD: &str = "key";
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const SOURCE_FIELD: &str = "source";
pub const VALUE_FIELD: &str = "value";
pub const PAYLOAD_FIELD: &str = "payload";
pub const SEQ_FIELD: &str = "seq";
pub const ORDINAL_FIELD: &str = "ordinal";

/// A single ingested row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Shard key
    pub key: String,
    /// Fetch time, nanoseconds since the Unix epoch (UTC)
    pub timestamp: i64,
    /// Where the document was scraped from
    #[serde(default)]
    pub source: String,
    /// Optional numeric measure
    #[serde(default)]
    pub value: Option<f64>,
    /// Raw document (JSON text)
    #[serde(default)]
    pub payload: Option<String>,
}

impl Row {
    pub fn new(key: impl Into<String>, timestamp: i64) -> Self {
        Self {
            key: key.into(),
            timestamp,
            source: String::new(),
            value: None,
            payload: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// A row as stored by a replica, with its position in the shard's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    #[serde(flatten)]
    pub row: Row,
    pub seq: u64,
    pub ordinal: u32,
}

impl StoredRow {
    /// Storage order: `(key, seq, ordinal)`
    pub fn storage_cmp(&self, other: &StoredRow) -> Ordering {
        self.row
            .key
            .cmp(&other.row.key)
            .then(self.seq.cmp(&other.seq))
            .then(self.ordinal.cmp(&other.ordinal))
    }
}

/// User-facing row schema
pub fn row_schema() -> SchemaRef {
    static SCHEMA: OnceLock<SchemaRef> = OnceLock::new();
    SCHEMA
        .get_or_init(|| Arc::new(Schema::new(row_fields())))
        .clone()
}

/// Schema of batches held in memtables and segments
pub fn stored_schema() -> SchemaRef {
    static SCHEMA: OnceLock<SchemaRef> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            let mut fields = row_fields();
            fields.push(Field::new(SEQ_FIELD, DataType::UInt64, false));
            fields.push(Field::new(ORDINAL_FIELD, DataType::UInt32, false));
            Arc::new(Schema::new(fields))
        })
        .clone()
}

fn row_fields() -> Vec<Field> {
    vec![
        Field::new(KEY_FIELD, DataType::Utf8, false),
        Field::new(
            TIMESTAMP_FIELD,
            DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into())),
            false,
        ),
        Field::new(SOURCE_FIELD, DataType::Utf8, false),
        Field::new(VALUE_FIELD, DataType::Float64, true),
        Field::new(PAYLOAD_FIELD, DataType::Utf8, true),
    ]
}

/// Reject rows the storage layer cannot place
pub fn validate_rows(rows: &[Row]) -> Result<()> {
    if rows.is_empty() {
        return Err(Error::InvalidRequest("batch contains no rows".into()));
    }
    if let Some(idx) = rows.iter().position(|r| r.key.is_empty()) {
        return Err(Error::InvalidRequest(format!(
            "row {} has an empty shard key",
            idx
        )));
    }
    Ok(())
}

/// Build a stored batch for one write record
pub fn rows_to_batch(rows: &[Row], seq: u64) -> Result<RecordBatch> {
    let keys = StringArray::from_iter_values(rows.iter().map(|r| r.key.as_str()));
    let timestamps = TimestampNanosecondArray::from(
        rows.iter().map(|r| r.timestamp).collect::<Vec<_>>(),
    )
    .with_timezone("UTC");
    let sources = StringArray::from_iter_values(rows.iter().map(|r| r.source.as_str()));
    let values = Float64Array::from(rows.iter().map(|r| r.value).collect::<Vec<_>>());
    let payloads = StringArray::from(
        rows.iter()
            .map(|r| r.payload.as_deref())
            .collect::<Vec<_>>(),
    );
    let seqs = UInt64Array::from(vec![seq; rows.len()]);
    let ordinals = UInt32Array::from((0..rows.len() as u32).collect::<Vec<_>>());

    let columns: Vec<ArrayRef> = vec![
        Arc::new(keys),
        Arc::new(timestamps),
        Arc::new(sources),
        Arc::new(values),
        Arc::new(payloads),
        Arc::new(seqs),
        Arc::new(ordinals),
    ];
    Ok(RecordBatch::try_new(stored_schema(), columns)?)
}

/// Build a stored batch from rows that already carry their log positions
pub fn stored_rows_to_batch(rows: &[StoredRow]) -> Result<RecordBatch> {
    let keys = StringArray::from_iter_values(rows.iter().map(|r| r.row.key.as_str()));
    let timestamps = TimestampNanosecondArray::from(
        rows.iter().map(|r| r.row.timestamp).collect::<Vec<_>>(),
    )
    .with_timezone("UTC");
    let sources = StringArray::from_iter_values(rows.iter().map(|r| r.row.source.as_str()));
    let values = Float64Array::from(rows.iter().map(|r| r.row.value).collect::<Vec<_>>());
    let payloads = StringArray::from(
        rows.iter()
            .map(|r| r.row.payload.as_deref())
            .collect::<Vec<_>>(),
    );
    let seqs = UInt64Array::from(rows.iter().map(|r| r.seq).collect::<Vec<_>>());
    let ordinals = UInt32Array::from(rows.iter().map(|r| r.ordinal).collect::<Vec<_>>());

    let columns: Vec<ArrayRef> = vec![
        Arc::new(keys),
        Arc::new(timestamps),
        Arc::new(sources),
        Arc::new(values),
        Arc::new(payloads),
        Arc::new(seqs),
        Arc::new(ordinals),
    ];
    Ok(RecordBatch::try_new(stored_schema(), columns)?)
}

/// Decode a stored batch back into rows
pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<StoredRow>> {
    let column = |name: &str| {
        batch
            .column_by_name(name)
            .ok_or_else(|| Error::Serialization(format!("missing column {}", name)))
    };

    let keys = column(KEY_FIELD)?.as_string::<i32>();
    let timestamps = column(TIMESTAMP_FIELD)?.as_primitive::<TimestampNanosecondType>();
    let sources = column(SOURCE_FIELD)?.as_string::<i32>();
    let values = column(VALUE_FIELD)?.as_primitive::<Float64Type>();
    let payloads = column(PAYLOAD_FIELD)?.as_string::<i32>();
    let seqs = column(SEQ_FIELD)?.as_primitive::<UInt64Type>();
    let ordinals = column(ORDINAL_FIELD)?.as_primitive::<UInt32Type>();

    let mut rows = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        rows.push(StoredRow {
            row: Row {
                key: keys.value(i).to_string(),
                timestamp: timestamps.value(i),
                source: sources.value(i).to_string(),
                value: (!values.is_null(i)).then(|| values.value(i)),
                payload: (!payloads.is_null(i)).then(|| payloads.value(i).to_string()),
            },
            seq: seqs.value(i),
            ordinal: ordinals.value(i),
        });
    }
    Ok(rows)
}

/// Approximate payload size of a row batch, used for flush triggers
pub fn approximate_size(rows: &[Row]) -> usize {
    rows.iter()
        .map(|r| {
            r.key.len() + r.source.len() + r.payload.as_ref().map_or(0, |p| p.len()) + 24
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rows() -> Vec<Row> {
        vec![
            Row::new("bmw-m3", 1_000)
                .with_source("auto.ru")
                .with_value(7_900_000.0)
                .with_payload(r#"{"@type":"Product"}"#),
            Row::new("audi-rs4", 2_000).with_source("auto.ru"),
        ]
    }

    #[test]
    fn test_rows_to_batch_layout() {
        let batch = rows_to_batch(&sample_rows(), 42).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema(), stored_schema());

        let decoded = batch_to_rows(&batch).unwrap();
        assert_eq!(decoded[0].seq, 42);
        assert_eq!(decoded[1].ordinal, 1);
        assert_eq!(decoded[0].row.value, Some(7_900_000.0));
        assert_eq!(decoded[1].row.value, None);
        assert_eq!(decoded[1].row.payload, None);
    }

    #[test]
    fn test_validate_rejects_empty_key() {
        let rows = vec![Row::new("", 1)];
        assert!(matches!(validate_rows(&rows), Err(Error::InvalidRequest(_))));
        assert!(validate_rows(&[]).is_err());
        assert!(validate_rows(&sample_rows()).is_ok());
    }

    #[test]
    fn test_storage_order() {
        let a = StoredRow {
            row: Row::new("a", 5),
            seq: 9,
            ordinal: 0,
        };
        let b = StoredRow {
            row: Row::new("a", 1),
            seq: 10,
            ordinal: 0,
        };
        let c = StoredRow {
            row: Row::new("b", 0),
            seq: 1,
            ordinal: 0,
        };
        assert_eq!(a.storage_cmp(&b), Ordering::Less);
        assert_eq!(b.storage_cmp(&c), Ordering::Less);
    }

    #[test]
    fn test_row_json_defaults() {
        let row: Row = serde_json::from_str(r#"{"key":"k","timestamp":7}"#).unwrap();
        assert_eq!(row.source, "");
        assert!(row.value.is_none());
        assert!(row.payload.is_none());
    }
}
