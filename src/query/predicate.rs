//! Row predicates
//!
//! A predicate is evaluated column-at-a-time into an Arrow boolean mask.
//! Comparisons against a null `value` yield null, which filtering treats as
//! false. [`Predicate::may_match`] prunes whole segments from their header
//! statistics before any data is read.

use crate::schema::{Row, KEY_FIELD, SOURCE_FIELD, TIMESTAMP_FIELD, VALUE_FIELD};
use crate::storage::SegmentMeta;
use crate::{Error, Result};
use arrow::compute::kernels::boolean::{and_kleene, not, or_kleene};
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};
use arrow::compute::filter_record_batch;
use arrow_array::cast::AsArray;
use arrow_array::{
    Array, ArrayRef, BooleanArray, Datum, Float64Array, RecordBatch, Scalar, StringArray,
    TimestampNanosecondArray,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    #[default]
    All,
    KeyEq {
        key: String,
    },
    KeyIn {
        keys: Vec<String>,
    },
    /// `start <= key < end`
    KeyRange {
        #[serde(default)]
        start: Option<String>,
        #[serde(default)]
        end: Option<String>,
    },
    SourceEq {
        source: String,
    },
    /// `start <= timestamp < end`, nanoseconds
    TimeRange {
        #[serde(default)]
        start: Option<i64>,
        #[serde(default)]
        end: Option<i64>,
    },
    ValueCmp {
        cmp: CmpOp,
        value: f64,
    },
    And {
        predicates: Vec<Predicate>,
    },
    Or {
        predicates: Vec<Predicate>,
    },
    Not {
        predicate: Box<Predicate>,
    },
}

impl Predicate {
    pub fn key_eq(key: impl Into<String>) -> Self {
        Predicate::KeyEq { key: key.into() }
    }

    pub fn and(predicates: Vec<Predicate>) -> Self {
        Predicate::And { predicates }
    }

    /// Row-at-a-time evaluation with the same semantics as [`Predicate::evaluate`]
    pub fn matches(&self, row: &Row) -> bool {
        self.matches_opt(row).unwrap_or(false)
    }

    fn matches_opt(&self, row: &Row) -> Option<bool> {
        Some(match self {
            Predicate::All => true,
            Predicate::KeyEq { key } => &row.key == key,
            Predicate::KeyIn { keys } => keys.iter().any(|k| k == &row.key),
            Predicate::KeyRange { start, end } => {
                start.as_deref().map_or(true, |s| row.key.as_str() >= s)
                    && end.as_deref().map_or(true, |e| row.key.as_str() < e)
            }
            Predicate::SourceEq { source } => &row.source == source,
            Predicate::TimeRange { start, end } => {
                start.map_or(true, |s| row.timestamp >= s) && end.map_or(true, |e| row.timestamp < e)
            }
            Predicate::ValueCmp { cmp, value } => cmp.holds(row.value?, *value),
            Predicate::And { predicates } => {
                let mut result = Some(true);
                for p in predicates {
                    match p.matches_opt(row) {
                        Some(false) => return Some(false),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                return result;
            }
            Predicate::Or { predicates } => {
                let mut result = Some(false);
                for p in predicates {
                    match p.matches_opt(row) {
                        Some(true) => return Some(true),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                return result;
            }
            Predicate::Not { predicate } => !predicate.matches_opt(row)?,
        })
    }

    /// Whether a segment could hold a matching row
    pub fn may_match(&self, meta: &SegmentMeta) -> bool {
        match self {
            Predicate::KeyEq { key } => key >= &meta.min_key && key <= &meta.max_key,
            Predicate::KeyIn { keys } => keys
                .iter()
                .any(|k| k >= &meta.min_key && k <= &meta.max_key),
            Predicate::KeyRange { start, end } => {
                start.as_deref().map_or(true, |s| meta.max_key.as_str() >= s)
                    && end.as_deref().map_or(true, |e| meta.min_key.as_str() < e)
            }
            Predicate::TimeRange { start, end } => {
                start.map_or(true, |s| meta.max_timestamp >= s)
                    && end.map_or(true, |e| meta.min_timestamp < e)
            }
            Predicate::And { predicates } => predicates.iter().all(|p| p.may_match(meta)),
            Predicate::Or { predicates } => predicates.iter().any(|p| p.may_match(meta)),
            Predicate::All
            | Predicate::SourceEq { .. }
            | Predicate::ValueCmp { .. }
            | Predicate::Not { .. } => true,
        }
    }

    /// Evaluate against a stored or row batch
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let rows = batch.num_rows();
        Ok(match self {
            Predicate::All => BooleanArray::from(vec![true; rows]),
            Predicate::KeyEq { key } => eq(column(batch, KEY_FIELD)?, &utf8(key))?,
            Predicate::KeyIn { keys } => {
                let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
                let values = column(batch, KEY_FIELD)?.as_string::<i32>();
                values
                    .iter()
                    .map(|k| Some(k.is_some_and(|k| wanted.contains(k))))
                    .collect()
            }
            Predicate::KeyRange { start, end } => {
                let keys = column(batch, KEY_FIELD)?;
                let lower = match start {
                    Some(s) => gt_eq(keys, &utf8(s))?,
                    None => BooleanArray::from(vec![true; rows]),
                };
                match end {
                    Some(e) => and_kleene(&lower, &lt(keys, &utf8(e))?)?,
                    None => lower,
                }
            }
            Predicate::SourceEq { source } => eq(column(batch, SOURCE_FIELD)?, &utf8(source))?,
            Predicate::TimeRange { start, end } => {
                let timestamps = column(batch, TIMESTAMP_FIELD)?;
                let lower = match start {
                    Some(s) => gt_eq(timestamps, &timestamp(*s))?,
                    None => BooleanArray::from(vec![true; rows]),
                };
                match end {
                    Some(e) => and_kleene(&lower, &lt(timestamps, &timestamp(*e))?)?,
                    None => lower,
                }
            }
            Predicate::ValueCmp { cmp, value } => {
                let values = column(batch, VALUE_FIELD)?;
                let rhs = Float64Array::new_scalar(*value);
                match cmp {
                    CmpOp::Eq => eq(values, &rhs)?,
                    CmpOp::Ne => neq(values, &rhs)?,
                    CmpOp::Lt => lt(values, &rhs)?,
                    CmpOp::Le => lt_eq(values, &rhs)?,
                    CmpOp::Gt => gt(values, &rhs)?,
                    CmpOp::Ge => gt_eq(values, &rhs)?,
                }
            }
            Predicate::And { predicates } => {
                let mut mask = BooleanArray::from(vec![true; rows]);
                for p in predicates {
                    mask = and_kleene(&mask, &p.evaluate(batch)?)?;
                }
                mask
            }
            Predicate::Or { predicates } => {
                let mut mask = BooleanArray::from(vec![false; rows]);
                for p in predicates {
                    mask = or_kleene(&mask, &p.evaluate(batch)?)?;
                }
                mask
            }
            Predicate::Not { predicate } => not(&predicate.evaluate(batch)?)?,
        })
    }

    /// Rows of `batch` the predicate selects
    pub fn filter(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        if matches!(self, Predicate::All) {
            return Ok(batch.clone());
        }
        let mask = self.evaluate(batch)?;
        Ok(filter_record_batch(batch, &mask)?)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Predicate::ValueCmp { value, .. } if value.is_nan() => Err(Error::InvalidRequest(
                "value comparison against NaN".into(),
            )),
            Predicate::And { predicates } | Predicate::Or { predicates } => {
                predicates.iter().try_for_each(Predicate::validate)
            }
            Predicate::Not { predicate } => predicate.validate(),
            _ => Ok(()),
        }
    }
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::Internal(format!("batch has no {} column", name)))
}

fn utf8(value: &str) -> Scalar<StringArray> {
    StringArray::new_scalar(value)
}

fn timestamp(nanos: i64) -> impl Datum {
    Scalar::new(TimestampNanosecondArray::from(vec![nanos]).with_timezone("UTC"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::rows_to_batch;

    fn rows() -> Vec<Row> {
        vec![
            Row::new("audi", 10).with_source("auto.ru").with_value(5.0),
            Row::new("bmw", 20).with_source("drom.ru").with_value(15.0),
            Row::new("kia", 30).with_source("auto.ru"),
            Row::new("lada", 40).with_source("avito.ru").with_value(1.0),
        ]
    }

    fn selected(predicate: &Predicate) -> Vec<String> {
        let batch = rows_to_batch(&rows(), 1).unwrap();
        let filtered = predicate.filter(&batch).unwrap();
        filtered
            .column_by_name(KEY_FIELD)
            .unwrap()
            .as_string::<i32>()
            .iter()
            .map(|k| k.unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_columnar_and_row_evaluation_agree() {
        let predicates = vec![
            Predicate::All,
            Predicate::key_eq("bmw"),
            Predicate::KeyIn {
                keys: vec!["kia".into(), "lada".into(), "zil".into()],
            },
            Predicate::KeyRange {
                start: Some("b".into()),
                end: Some("l".into()),
            },
            Predicate::SourceEq {
                source: "auto.ru".into(),
            },
            Predicate::TimeRange {
                start: Some(20),
                end: None,
            },
            Predicate::ValueCmp {
                cmp: CmpOp::Ge,
                value: 5.0,
            },
            Predicate::Not {
                predicate: Box::new(Predicate::ValueCmp {
                    cmp: CmpOp::Gt,
                    value: 2.0,
                }),
            },
            Predicate::Or {
                predicates: vec![
                    Predicate::key_eq("audi"),
                    Predicate::TimeRange {
                        start: None,
                        end: Some(25),
                    },
                ],
            },
            Predicate::and(vec![
                Predicate::SourceEq {
                    source: "auto.ru".into(),
                },
                Predicate::ValueCmp {
                    cmp: CmpOp::Lt,
                    value: 100.0,
                },
            ]),
        ];
        for predicate in predicates {
            let expected: Vec<String> = rows()
                .into_iter()
                .filter(|r| predicate.matches(r))
                .map(|r| r.key)
                .collect();
            assert_eq!(selected(&predicate), expected, "{:?}", predicate);
        }
    }

    #[test]
    fn test_null_values_never_match() {
        let not_big = Predicate::Not {
            predicate: Box::new(Predicate::ValueCmp {
                cmp: CmpOp::Gt,
                value: 2.0,
            }),
        };
        assert_eq!(selected(&not_big), vec!["lada".to_string()]);
    }

    #[test]
    fn test_segment_pruning() {
        let meta = SegmentMeta {
            segment_id: "s".into(),
            shard: 0,
            level: 0,
            min_key: "c".into(),
            max_key: "f".into(),
            min_seq: 1,
            max_seq: 1,
            row_count: 1,
            min_timestamp: 100,
            max_timestamp: 200,
            created_at_ms: 0,
        };
        assert!(!Predicate::key_eq("a").may_match(&meta));
        assert!(Predicate::key_eq("d").may_match(&meta));
        assert!(!Predicate::TimeRange {
            start: Some(300),
            end: None
        }
        .may_match(&meta));
        assert!(Predicate::Not {
            predicate: Box::new(Predicate::key_eq("d"))
        }
        .may_match(&meta));
    }

    #[test]
    fn test_json_shape() {
        let parsed: Predicate = serde_json::from_str(
            r#"{"op":"and","predicates":[{"op":"key_eq","key":"bmw"},{"op":"value_cmp","cmp":"gt","value":1.5}]}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            Predicate::and(vec![
                Predicate::key_eq("bmw"),
                Predicate::ValueCmp {
                    cmp: CmpOp::Gt,
                    value: 1.5
                }
            ])
        );
        assert_eq!(
            serde_json::from_str::<Predicate>(r#"{"op":"all"}"#).unwrap(),
            Predicate::All
        );
    }
}
