//! Change notification for the coordination key space
//!
//! Every committed mutation is appended to a bounded history and broadcast.
//! A [`WatchStream`] replays history after the caller's revision and then
//! follows the broadcast, so a watcher that reconnects with the last revision
//! it saw misses nothing as long as that revision is still retained.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    Put {
        key: String,
        value: Vec<u8>,
        version: u64,
        revision: u64,
    },
    Delete {
        key: String,
        revision: u64,
    },
    /// Requested history is gone; re-read state at `revision` and continue
    Resync { revision: u64 },
}

impl WatchEvent {
    pub fn revision(&self) -> u64 {
        match self {
            WatchEvent::Put { revision, .. }
            | WatchEvent::Delete { revision, .. }
            | WatchEvent::Resync { revision } => *revision,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key, .. } => Some(key),
            WatchEvent::Resync { .. } => None,
        }
    }
}

/// History plus live fan-out of committed events
#[derive(Debug)]
pub struct WatchHub {
    history: RwLock<VecDeque<WatchEvent>>,
    /// Revision of the newest event ever discarded from history
    discarded_through: RwLock<u64>,
    sender: broadcast::Sender<WatchEvent>,
    limit: usize,
}

impl WatchHub {
    pub fn new(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            history: RwLock::new(VecDeque::new()),
            discarded_through: RwLock::new(0),
            sender,
            limit: limit.max(1),
        }
    }

    /// Record and broadcast events of one commit
    pub fn publish(&self, events: Vec<WatchEvent>) {
        let mut history = self.history.write();
        for event in events {
            history.push_back(event.clone());
            // No receivers is fine; history still records the event.
            let _ = self.sender.send(event);
        }
        while history.len() > self.limit {
            if let Some(old) = history.pop_front() {
                *self.discarded_through.write() = old.revision();
            }
        }
    }

    /// Start a stream of events under `prefix` with revision > `from_revision`
    pub fn subscribe(self: &Arc<Self>, prefix: &str, from_revision: u64, current_revision: u64) -> WatchStream {
        // Subscribe before copying history so nothing falls between the two.
        let receiver = self.sender.subscribe();
        let mut stream = WatchStream {
            prefix: prefix.to_string(),
            last_revision: from_revision,
            backlog: VecDeque::new(),
            receiver,
            hub: Arc::clone(self),
        };
        stream.refill(current_revision);
        stream
    }

    fn discarded_through(&self) -> u64 {
        *self.discarded_through.read()
    }
}

/// Infinite, restartable sequence of changes under a key prefix
#[derive(Debug)]
pub struct WatchStream {
    prefix: String,
    last_revision: u64,
    backlog: VecDeque<WatchEvent>,
    receiver: broadcast::Receiver<WatchEvent>,
    hub: Arc<WatchHub>,
}

impl WatchStream {
    /// Next matching event; `None` once the ensemble is gone
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                return Some(self.deliver(event));
            }
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.revision() <= self.last_revision && !self.is_resync(&event) {
                        continue;
                    }
                    if self.matches(&event) {
                        return Some(self.deliver(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, prefix = %self.prefix, "Watch lagged, replaying history");
                    let newest = self
                        .hub
                        .history
                        .read()
                        .back()
                        .map(|e| e.revision())
                        .unwrap_or(self.last_revision);
                    self.refill(newest);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Revision of the last event delivered; pass it to `watch` to resume
    pub fn last_revision(&self) -> u64 {
        self.last_revision
    }

    fn deliver(&mut self, event: WatchEvent) -> WatchEvent {
        self.last_revision = self.last_revision.max(event.revision());
        event
    }

    fn is_resync(&self, event: &WatchEvent) -> bool {
        matches!(event, WatchEvent::Resync { .. })
    }

    fn matches(&self, event: &WatchEvent) -> bool {
        event.key().map_or(true, |k| k.starts_with(&self.prefix))
    }

    fn refill(&mut self, current_revision: u64) {
        if self.last_revision < self.hub.discarded_through() {
            self.backlog.push_back(WatchEvent::Resync {
                revision: current_revision,
            });
            // Resume after the events that were replaced by the resync.
            self.last_revision = current_revision;
            return;
        }
        let history = self.hub.history.read();
        for event in history.iter() {
            if event.revision() > self.last_revision && self.matches(event) {
                self.backlog.push_back(event.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, revision: u64) -> WatchEvent {
        WatchEvent::Put {
            key: key.to_string(),
            value: b"v".to_vec(),
            version: 1,
            revision,
        }
    }

    #[tokio::test]
    async fn test_replays_history_then_follows() {
        let hub = Arc::new(WatchHub::new(16));
        hub.publish(vec![put("cluster/map", 1)]);
        hub.publish(vec![put("replicas/0/node-0-0", 2)]);

        let mut stream = hub.subscribe("cluster/", 0, 2);
        assert_eq!(stream.next().await.unwrap().revision(), 1);

        hub.publish(vec![put("cluster/map", 3)]);
        assert_eq!(stream.next().await.unwrap().revision(), 3);
        assert_eq!(stream.last_revision(), 3);
    }

    #[tokio::test]
    async fn test_resync_when_history_discarded() {
        let hub = Arc::new(WatchHub::new(2));
        for rev in 1..=5 {
            hub.publish(vec![put("k", rev)]);
        }
        let mut stream = hub.subscribe("k", 1, 5);
        assert_eq!(stream.next().await.unwrap(), WatchEvent::Resync { revision: 5 });

        hub.publish(vec![put("k", 6)]);
        assert_eq!(stream.next().await.unwrap().revision(), 6);
    }
}
