//! Replica role state machine and replication bookkeeping
//!
//! A replica is either `Primary` (holding a live lease) or `Secondary`.
//! The only transitions are [`ReplicaRole::on_lease_granted`] and
//! [`ReplicaRole::on_lease_lost`], both driven by lease events from the
//! coordination ensemble.

use super::LogEntry;
use crate::cluster::lease::LeaseToken;
use crate::cluster::map::Role;
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaRole {
    Primary { lease: LeaseToken },
    Secondary,
}

/// What a lease event did to the role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Promoted,
    Renewed,
    Demoted,
    Unchanged,
}

impl ReplicaRole {
    pub fn role(&self) -> Role {
        match self {
            ReplicaRole::Primary { .. } => Role::Primary,
            ReplicaRole::Secondary => Role::Secondary,
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, ReplicaRole::Primary { .. })
    }

    pub fn lease(&self) -> Option<&LeaseToken> {
        match self {
            ReplicaRole::Primary { lease } => Some(lease),
            ReplicaRole::Secondary => None,
        }
    }

    /// A grant or renewal of the primary lease
    pub fn on_lease_granted(&mut self, lease: LeaseToken) -> Transition {
        let transition = match self {
            ReplicaRole::Primary { lease: current } if current.token == lease.token => {
                Transition::Renewed
            }
            _ => Transition::Promoted,
        };
        *self = ReplicaRole::Primary { lease };
        transition
    }

    /// The lease expired, was denied on renewal, or a newer epoch was seen
    pub fn on_lease_lost(&mut self) -> Transition {
        match self {
            ReplicaRole::Primary { .. } => {
                *self = ReplicaRole::Secondary;
                Transition::Demoted
            }
            ReplicaRole::Secondary => Transition::Unchanged,
        }
    }
}

/// Entry id of the rows `row_ids` of caller batch `batch_id`, e.g.
/// `b:rows=0-3,7`
pub fn row_set_id(batch_id: &str, row_ids: &[u32]) -> String {
    let mut ids = row_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    let mut ranges = Vec::new();
    let mut iter = ids.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        ranges.push(if start == end {
            start.to_string()
        } else {
            format!("{}-{}", start, end)
        });
    }
    format!("{}{}{}", batch_id, ROW_SET_MARKER, ranges.join(","))
}

const ROW_SET_MARKER: &str = ":rows=";

fn parse_row_set(ranges: &str) -> Option<Vec<u32>> {
    let mut ids = Vec::new();
    for part in ranges.split(',') {
        match part.split_once('-') {
            Some((start, end)) => {
                let (start, end): (u32, u32) = (start.parse().ok()?, end.parse().ok()?);
                ids.extend(start..=end);
            }
            None => ids.push(part.parse().ok()?),
        }
    }
    Some(ids)
}

/// Bounded map of recent batch ids to the sequence number they were given
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    seqs: HashMap<String, u64>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seqs: HashMap::new(),
        }
    }

    pub fn get(&self, batch_id: &str) -> Option<u64> {
        self.seqs.get(batch_id).copied()
    }

    pub fn insert(&mut self, batch_id: String, seq: u64) {
        if self.seqs.insert(batch_id.clone(), seq).is_none() {
            self.order.push_back(batch_id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seqs.remove(&oldest);
            }
        }
    }

    /// Row-tracked entries of caller batch `batch_id`: each entry's seq and
    /// the row ids it carries
    pub fn rows_of(&self, batch_id: &str) -> Vec<(u64, Vec<u32>)> {
        let prefix = format!("{}{}", batch_id, ROW_SET_MARKER);
        self.order
            .iter()
            .filter_map(|id| {
                let ranges = id.strip_prefix(&prefix)?;
                Some((*self.seqs.get(id)?, parse_row_set(ranges)?))
            })
            .collect()
    }

    pub fn remove(&mut self, batch_id: &str) {
        if self.seqs.remove(batch_id).is_some() {
            self.order.retain(|id| id != batch_id);
        }
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        self.order
            .iter()
            .filter_map(|id| self.seqs.get(id).map(|seq| (id.clone(), *seq)))
            .collect()
    }

    pub fn restore(&mut self, entries: impl IntoIterator<Item = (String, u64)>) {
        for (batch_id, seq) in entries {
            self.insert(batch_id, seq);
        }
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seqs.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Entries that arrived ahead of a gap
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    entries: BTreeMap<u64, LogEntry>,
}

impl ReorderBuffer {
    pub fn insert(&mut self, entry: LogEntry) {
        self.entries.insert(entry.seq, entry);
    }

    /// Remove and return the entry that directly follows `last_seq`,
    /// discarding anything at or below it
    pub fn pop_next(&mut self, last_seq: u64) -> Option<LogEntry> {
        while let Some((&seq, _)) = self.entries.first_key_value() {
            if seq <= last_seq {
                self.entries.remove(&seq);
            } else {
                break;
            }
        }
        self.entries.remove(&(last_seq + 1))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(token: u64) -> LeaseToken {
        LeaseToken {
            resource: "shard/0/primary".into(),
            holder: "node-0-1".into(),
            token,
            expires_at_ms: 10,
        }
    }

    #[test]
    fn test_role_transitions() {
        let mut role = ReplicaRole::Secondary;
        assert_eq!(role.on_lease_lost(), Transition::Unchanged);
        assert_eq!(role.on_lease_granted(lease(3)), Transition::Promoted);
        assert_eq!(role.role(), Role::Primary);
        assert_eq!(role.on_lease_granted(lease(3)), Transition::Renewed);
        assert_eq!(role.on_lease_granted(lease(9)), Transition::Promoted);
        assert_eq!(role.lease().map(|l| l.token), Some(9));
        assert_eq!(role.on_lease_lost(), Transition::Demoted);
        assert!(!role.is_primary());
    }

    #[test]
    fn test_dedup_window_is_bounded() {
        let mut window = DedupWindow::new(2);
        window.insert("a".into(), 1);
        window.insert("b".into(), 2);
        window.insert("c".into(), 3);
        assert_eq!(window.get("a"), None);
        assert_eq!(window.get("c"), Some(3));
        assert_eq!(window.len(), 2);

        window.remove("b");
        assert_eq!(window.snapshot(), vec![("c".to_string(), 3)]);
    }

    #[test]
    fn test_row_sets_are_tracked_per_batch() {
        assert_eq!(row_set_id("b", &[9, 0, 1, 2, 3, 7, 10]), "b:rows=0-3,7,9-10");

        let mut window = DedupWindow::new(8);
        window.insert(row_set_id("b", &[0, 1, 2]), 4);
        window.insert(row_set_id("b", &[5]), 6);
        window.insert(row_set_id("bb", &[3]), 7);
        window.insert("b:1".into(), 8);

        assert_eq!(window.rows_of("b"), vec![(4, vec![0, 1, 2]), (6, vec![5])]);
        assert_eq!(window.rows_of("bb"), vec![(7, vec![3])]);
        assert!(window.rows_of("c").is_empty());
    }

    #[test]
    fn test_reorder_buffer_fills_gaps() {
        let entry = |seq| LogEntry {
            seq,
            epoch: 1,
            batch_id: format!("b{}", seq),
            rows: Vec::new(),
        };
        let mut buffer = ReorderBuffer::default();
        buffer.insert(entry(4));
        buffer.insert(entry(3));
        buffer.insert(entry(1));

        assert!(buffer.pop_next(1).is_none());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.pop_next(2).map(|e| e.seq), Some(3));
        assert_eq!(buffer.pop_next(3).map(|e| e.seq), Some(4));
        assert!(buffer.is_empty());
    }
}
