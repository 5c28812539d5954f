//! Partial aggregation and its combine step
//!
//! Each shard folds its matching rows into [`AggState`]s; the coordinator
//! merges them. `merge` is associative and commutative, so partials can be
//! combined in any order. Averages travel as `(sum, value_count)` and are
//! divided only once, after the final merge.

use super::GroupBy;
use crate::schema::{KEY_FIELD, SOURCE_FIELD, VALUE_FIELD};
use crate::{Error, Result};
use arrow::compute::kernels::aggregate;
use arrow_array::cast::AsArray;
use arrow_array::types::Float64Type;
use arrow_array::{Array, RecordBatch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Return matching rows unaggregated
    #[default]
    Rows,
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl Aggregation {
    pub fn is_rows(&self) -> bool {
        matches!(self, Aggregation::Rows)
    }
}

/// Running aggregate over the `value` column of a set of rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggState {
    /// Rows matched, including rows without a value
    pub count: u64,
    /// Rows that carried a value
    pub value_count: u64,
    pub sum: f64,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl AggState {
    pub fn observe(&mut self, value: Option<f64>) {
        self.count += 1;
        if let Some(v) = value {
            self.value_count += 1;
            self.sum += v;
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    pub fn merge(&mut self, other: &AggState) {
        self.count += other.count;
        self.value_count += other.value_count;
        self.sum += other.sum;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// Fold a whole batch with Arrow's aggregate kernels
    pub fn observe_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        let values = batch
            .column_by_name(VALUE_FIELD)
            .ok_or_else(|| Error::Internal("batch has no value column".into()))?
            .as_primitive::<Float64Type>();
        let partial = AggState {
            count: batch.num_rows() as u64,
            value_count: (values.len() - values.null_count()) as u64,
            sum: aggregate::sum(values).unwrap_or(0.0),
            min: aggregate::min(values),
            max: aggregate::max(values),
        };
        self.merge(&partial);
        Ok(())
    }

    /// Final value of `aggregation`; `None` when no row carried a value
    pub fn finalize(&self, aggregation: Aggregation) -> Option<f64> {
        match aggregation {
            Aggregation::Rows => None,
            Aggregation::Count => Some(self.count as f64),
            Aggregation::Sum => (self.value_count > 0).then_some(self.sum),
            Aggregation::Min => self.min,
            Aggregation::Max => self.max,
            Aggregation::Avg => {
                (self.value_count > 0).then(|| self.sum / self.value_count as f64)
            }
        }
    }
}

/// Fold filtered batches into per-group states; the ungrouped case uses a
/// single group named `""`
pub fn fold_batches(
    batches: &[RecordBatch],
    group_by: Option<GroupBy>,
) -> Result<BTreeMap<String, AggState>> {
    let mut groups: BTreeMap<String, AggState> = BTreeMap::new();
    for batch in batches {
        if batch.num_rows() == 0 {
            continue;
        }
        let Some(group_by) = group_by else {
            groups.entry(String::new()).or_default().observe_batch(batch)?;
            continue;
        };
        let column = match group_by {
            GroupBy::Key => KEY_FIELD,
            GroupBy::Source => SOURCE_FIELD,
        };
        let names = batch
            .column_by_name(column)
            .ok_or_else(|| Error::Internal(format!("batch has no {} column", column)))?
            .as_string::<i32>();
        let values = batch
            .column_by_name(VALUE_FIELD)
            .ok_or_else(|| Error::Internal("batch has no value column".into()))?
            .as_primitive::<Float64Type>();
        for i in 0..batch.num_rows() {
            let value = (!values.is_null(i)).then(|| values.value(i));
            match groups.get_mut(names.value(i)) {
                Some(state) => state.observe(value),
                None => {
                    let mut state = AggState::default();
                    state.observe(value);
                    groups.insert(names.value(i).to_string(), state);
                }
            }
        }
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{rows_to_batch, Row};

    fn state(values: &[Option<f64>]) -> AggState {
        let mut s = AggState::default();
        for v in values {
            s.observe(*v);
        }
        s
    }

    #[test]
    fn test_merge_matches_single_pass() {
        let all = state(&[Some(1.0), None, Some(4.0), Some(-2.0), Some(10.0)]);
        let mut left = state(&[Some(1.0), None]);
        let right = state(&[Some(4.0), Some(-2.0), Some(10.0)]);
        left.merge(&right);
        assert_eq!(left, all);

        let mut other_order = right;
        other_order.merge(&state(&[Some(1.0), None]));
        assert_eq!(other_order, all);
    }

    #[test]
    fn test_avg_is_not_an_average_of_averages() {
        let mut a = state(&[Some(10.0)]);
        let b = state(&[Some(1.0), Some(1.0), Some(1.0)]);
        a.merge(&b);
        assert_eq!(a.finalize(Aggregation::Avg), Some(13.0 / 4.0));
    }

    #[test]
    fn test_empty_state_finalizes() {
        let empty = AggState::default();
        assert_eq!(empty.finalize(Aggregation::Count), Some(0.0));
        assert_eq!(empty.finalize(Aggregation::Sum), None);
        assert_eq!(empty.finalize(Aggregation::Avg), None);
        assert_eq!(empty.finalize(Aggregation::Min), None);
    }

    #[test]
    fn test_fold_batches_by_source() {
        let batch = rows_to_batch(
            &[
                Row::new("a", 1).with_source("x").with_value(2.0),
                Row::new("b", 1).with_source("y").with_value(3.0),
                Row::new("c", 1).with_source("x"),
            ],
            1,
        )
        .unwrap();
        let groups = fold_batches(&[batch.clone()], Some(GroupBy::Source)).unwrap();
        assert_eq!(groups["x"].count, 2);
        assert_eq!(groups["x"].value_count, 1);
        assert_eq!(groups["y"].finalize(Aggregation::Sum), Some(3.0));

        let total = fold_batches(&[batch], None).unwrap();
        assert_eq!(total[""].count, 3);
        assert_eq!(total[""].finalize(Aggregation::Max), Some(3.0));
    }
}
