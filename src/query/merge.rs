//! Result ordering and k-way merge of pre-sorted shard partials
//!
//! Rows are totally ordered by `(field, key, shard, seq, ordinal)`, where
//! `field` is the requested sort field and rows without a value sort last.
//! `descending` flips the sort field only; the tie-breakers keep ascending
//! order so pages stay stable.

use super::{OrderBy, QueryCursor, ResultRow, SortField};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Anything that occupies a position in the result order
pub trait SortPosition {
    fn key(&self) -> &str;
    fn timestamp(&self) -> i64;
    fn source(&self) -> &str;
    fn value(&self) -> Option<f64>;
    fn shard(&self) -> u32;
    fn seq(&self) -> u64;
    fn ordinal(&self) -> u32;
}

impl SortPosition for ResultRow {
    fn key(&self) -> &str {
        &self.row.row.key
    }
    fn timestamp(&self) -> i64 {
        self.row.row.timestamp
    }
    fn source(&self) -> &str {
        &self.row.row.source
    }
    fn value(&self) -> Option<f64> {
        self.row.row.value
    }
    fn shard(&self) -> u32 {
        self.shard
    }
    fn seq(&self) -> u64 {
        self.row.seq
    }
    fn ordinal(&self) -> u32 {
        self.row.ordinal
    }
}

impl SortPosition for QueryCursor {
    fn key(&self) -> &str {
        &self.key
    }
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
    fn source(&self) -> &str {
        &self.source
    }
    fn value(&self) -> Option<f64> {
        self.value
    }
    fn shard(&self) -> u32 {
        self.shard
    }
    fn seq(&self) -> u64 {
        self.seq
    }
    fn ordinal(&self) -> u32 {
        self.ordinal
    }
}

pub fn compare<A, B>(a: &A, b: &B, order: OrderBy) -> Ordering
where
    A: SortPosition + ?Sized,
    B: SortPosition + ?Sized,
{
    let primary = match order.field {
        SortField::Key => a.key().cmp(b.key()),
        SortField::Timestamp => a.timestamp().cmp(&b.timestamp()),
        SortField::Source => a.source().cmp(b.source()),
        SortField::Value => match (a.value(), b.value()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (None, None) => Ordering::Equal,
            // Nulls last in either direction.
            (None, Some(_)) => return Ordering::Greater,
            (Some(_), None) => return Ordering::Less,
        },
    };
    let primary = if order.descending {
        primary.reverse()
    } else {
        primary
    };
    primary
        .then_with(|| a.key().cmp(b.key()))
        .then_with(|| a.shard().cmp(&b.shard()))
        .then_with(|| a.seq().cmp(&b.seq()))
        .then_with(|| a.ordinal().cmp(&b.ordinal()))
}

/// Sort one shard's rows into result order
pub fn sort_rows(rows: &mut [ResultRow], order: OrderBy) {
    rows.sort_by(|a, b| compare(a, b, order));
}

struct HeapItem {
    row: ResultRow,
    stream: usize,
    order: OrderBy,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert to pop the smallest row first.
        compare(&other.row, &self.row, self.order)
    }
}

/// Merge streams that are each sorted by `order`, emitting at most `limit`
/// rows. The flag is true when rows were left unemitted.
pub fn k_way_merge(
    streams: Vec<Vec<ResultRow>>,
    order: OrderBy,
    limit: usize,
) -> (Vec<ResultRow>, bool) {
    let mut iters: Vec<_> = streams.into_iter().map(Vec::into_iter).collect();
    let mut heap = BinaryHeap::with_capacity(iters.len());
    for (stream, iter) in iters.iter_mut().enumerate() {
        if let Some(row) = iter.next() {
            heap.push(HeapItem { row, stream, order });
        }
    }

    let mut out = Vec::new();
    while let Some(HeapItem { row, stream, .. }) = heap.pop() {
        if out.len() == limit {
            return (out, true);
        }
        out.push(row);
        if let Some(next) = iters[stream].next() {
            heap.push(HeapItem {
                row: next,
                stream,
                order,
            });
        }
    }
    (out, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Row, StoredRow};

    fn row(shard: u32, key: &str, seq: u64, value: Option<f64>) -> ResultRow {
        let mut r = Row::new(key, seq as i64 * 10);
        r.value = value;
        ResultRow {
            shard,
            row: StoredRow {
                row: r,
                seq,
                ordinal: 0,
            },
        }
    }

    fn keys(rows: &[ResultRow]) -> Vec<String> {
        rows.iter().map(|r| r.row.row.key.clone()).collect()
    }

    #[test]
    fn test_merge_interleaves_sorted_streams() {
        let order = OrderBy::default();
        let streams = vec![
            vec![row(0, "a", 1, None), row(0, "d", 2, None), row(0, "e", 3, None)],
            vec![row(1, "b", 1, None), row(1, "c", 2, None)],
            vec![],
        ];
        let (merged, more) = k_way_merge(streams, order, 10);
        assert_eq!(keys(&merged), vec!["a", "b", "c", "d", "e"]);
        assert!(!more);
    }

    #[test]
    fn test_merge_respects_limit() {
        let streams = vec![
            vec![row(0, "a", 1, None), row(0, "c", 2, None)],
            vec![row(1, "b", 1, None)],
        ];
        let (merged, more) = k_way_merge(streams, OrderBy::default(), 2);
        assert_eq!(keys(&merged), vec!["a", "b"]);
        assert!(more);
    }

    #[test]
    fn test_descending_value_keeps_nulls_last() {
        let order = OrderBy {
            field: SortField::Value,
            descending: true,
        };
        let mut rows = vec![
            row(0, "a", 1, Some(1.0)),
            row(0, "b", 2, None),
            row(1, "c", 1, Some(5.0)),
            row(1, "d", 2, Some(3.0)),
        ];
        sort_rows(&mut rows, order);
        assert_eq!(keys(&rows), vec!["c", "d", "a", "b"]);
    }

    #[test]
    fn test_ties_break_on_shard_then_seq() {
        let order = OrderBy::default();
        let mut rows = vec![row(1, "k", 1, None), row(0, "k", 7, None), row(0, "k", 2, None)];
        sort_rows(&mut rows, order);
        let positions: Vec<(u32, u64)> = rows.iter().map(|r| (r.shard, r.row.seq)).collect();
        assert_eq!(positions, vec![(0, 2), (0, 7), (1, 1)]);
    }

    #[test]
    fn test_cursor_compares_with_rows() {
        let order = OrderBy::default();
        let cursor = QueryCursor::from(&row(0, "b", 1, None));
        assert_eq!(compare(&row(0, "c", 1, None), &cursor, order), Ordering::Greater);
        assert_eq!(compare(&row(0, "b", 1, None), &cursor, order), Ordering::Equal);
        assert_eq!(compare(&row(0, "a", 9, None), &cursor, order), Ordering::Less);
    }
}
