//! In-memory log entries that have not been sealed into a segment

use super::LogEntry;
use crate::schema::{batch_to_rows, rows_to_batch};
use crate::Result;
use arrow_array::RecordBatch;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct MemEntry {
    epoch: u64,
    batch_id: String,
    batch: RecordBatch,
}

/// Persisted log entries keyed by sequence number
#[derive(Debug, Default)]
pub struct Memtable {
    entries: BTreeMap<u64, MemEntry>,
    row_count: usize,
    size_bytes: usize,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry; an existing entry at the same seq is replaced
    pub fn insert(&mut self, entry: &LogEntry) -> Result<()> {
        let batch = rows_to_batch(&entry.rows, entry.seq)?;
        let rows = batch.num_rows();
        let size = batch.get_array_memory_size();
        if let Some(old) = self.entries.insert(
            entry.seq,
            MemEntry {
                epoch: entry.epoch,
                batch_id: entry.batch_id.clone(),
                batch,
            },
        ) {
            self.row_count -= old.batch.num_rows();
            self.size_bytes -= old.batch.get_array_memory_size();
        }
        self.row_count += rows;
        self.size_bytes += size;
        Ok(())
    }

    pub fn batch_id(&self, seq: u64) -> Option<&str> {
        self.entries.get(&seq).map(|e| e.batch_id.as_str())
    }

    /// Batches with `seq <= through`, in sequence order
    pub fn batches_through(&self, through: u64) -> Vec<RecordBatch> {
        self.entries
            .range(..=through)
            .map(|(_, e)| e.batch.clone())
            .collect()
    }

    pub fn rows_through(&self, through: u64) -> usize {
        self.entries
            .range(..=through)
            .map(|(_, e)| e.batch.num_rows())
            .sum()
    }

    /// Log entries in `(after, through]`
    pub fn entries_between(&self, after: u64, through: u64) -> Result<Vec<LogEntry>> {
        if after >= through {
            return Ok(Vec::new());
        }
        self.entries
            .range(after + 1..=through)
            .map(|(seq, e)| {
                Ok(LogEntry {
                    seq: *seq,
                    epoch: e.epoch,
                    batch_id: e.batch_id.clone(),
                    rows: batch_to_rows(&e.batch)?
                        .into_iter()
                        .map(|stored| stored.row)
                        .collect(),
                })
            })
            .collect()
    }

    /// `(batch_id, seq)` of every entry, oldest first
    pub fn batch_ids(&self) -> Vec<(String, u64)> {
        self.entries
            .iter()
            .map(|(seq, e)| (e.batch_id.clone(), *seq))
            .collect()
    }

    /// Remove and return batches with `seq <= through`
    pub fn take_through(&mut self, through: u64) -> Vec<RecordBatch> {
        let keep = self.entries.split_off(&(through + 1));
        let taken = std::mem::replace(&mut self.entries, keep);
        let batches: Vec<RecordBatch> = taken.into_values().map(|e| e.batch).collect();
        for batch in &batches {
            self.row_count -= batch.num_rows();
            self.size_bytes -= batch.get_array_memory_size();
        }
        batches
    }

    /// Drop entries with `seq > seq`; returns the dropped batch ids
    pub fn truncate_after(&mut self, seq: u64) -> Vec<String> {
        let dropped = self.entries.split_off(&(seq + 1));
        dropped
            .into_values()
            .map(|e| {
                self.row_count -= e.batch.num_rows();
                self.size_bytes -= e.batch.get_array_memory_size();
                e.batch_id
            })
            .collect()
    }

    pub fn first_seq(&self) -> Option<u64> {
        self.entries.keys().next().copied()
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.entries.keys().next_back().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.row_count = 0;
        self.size_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Row;

    fn entry(seq: u64, rows: usize) -> LogEntry {
        LogEntry {
            seq,
            epoch: 1,
            batch_id: format!("b-{}", seq),
            rows: (0..rows)
                .map(|i| Row::new(format!("k{}", i), i as i64))
                .collect(),
        }
    }

    #[test]
    fn test_insert_and_take() {
        let mut mem = Memtable::new();
        for seq in 1..=4 {
            mem.insert(&entry(seq, 2)).unwrap();
        }
        assert_eq!(mem.row_count(), 8);
        assert_eq!(mem.rows_through(2), 4);
        assert_eq!(mem.batches_through(3).len(), 3);

        let taken = mem.take_through(2);
        assert_eq!(taken.len(), 2);
        assert_eq!(mem.first_seq(), Some(3));
        assert_eq!(mem.row_count(), 4);
    }

    #[test]
    fn test_truncate_after_returns_batch_ids() {
        let mut mem = Memtable::new();
        for seq in 1..=3 {
            mem.insert(&entry(seq, 1)).unwrap();
        }
        assert_eq!(mem.truncate_after(1), vec!["b-2".to_string(), "b-3".to_string()]);
        assert_eq!(mem.last_seq(), Some(1));
        assert_eq!(mem.row_count(), 1);
        assert!(mem.size_bytes() > 0);
    }

    #[test]
    fn test_entries_between_rebuilds_rows() {
        let mut mem = Memtable::new();
        mem.insert(&entry(5, 3)).unwrap();
        mem.insert(&entry(6, 1)).unwrap();
        let entries = mem.entries_between(4, 6).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], entry(5, 3));
        assert!(mem.entries_between(6, 6).unwrap().is_empty());
    }
}
