//! In-process coordination ensemble
//!
//! Each member keeps a full copy of the versioned key space. Proposals are
//! serialised through a leader lock and commit when a majority of members is
//! reachable: lagging reachable members first copy the freshest reachable
//! member's state (which holds every committed change, since any two
//! majorities intersect), the proposal is evaluated against that state, and
//! the result is applied to every reachable member.
//!
//! Below majority every mutation fails with `Unavailable` and reads return
//! the freshest reachable copy flagged `stale`.

use super::lease::{self, LeaseGuard, LeaseRecord, LeaseToken, LEASE_PREFIX};
use super::watch::{WatchEvent, WatchHub, WatchStream};
use crate::clock::Clock;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_HISTORY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    /// Per-key version, starting at 1 on creation
    pub version: u64,
    /// Revision of the last modification
    pub mod_revision: u64,
}

pub type KvState = BTreeMap<String, VersionedValue>;

/// Result of a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadView {
    pub value: Option<Vec<u8>>,
    /// Per-key version; 0 when the key is absent
    pub version: u64,
    /// Ensemble revision the read observed
    pub revision: u64,
    /// True when no majority was reachable
    pub stale: bool,
}

#[derive(Debug, Clone)]
pub enum Mutation {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Context handed to a proposal while the leader lock is held
#[derive(Debug, Clone, Copy)]
pub struct CommitCtx {
    pub now_ms: i64,
    /// Revision the first mutation of this commit will receive
    pub revision: u64,
}

#[derive(Debug, Default, Clone)]
struct MemberState {
    revision: u64,
    entries: KvState,
}

#[derive(Debug)]
struct Member {
    reachable: AtomicBool,
    state: RwLock<MemberState>,
}

/// Consensus-backed store for cluster metadata and leases
#[derive(Debug)]
pub struct Ensemble {
    members: Vec<Member>,
    leader: Mutex<()>,
    clock: Arc<dyn Clock>,
    hub: Arc<WatchHub>,
}

impl Ensemble {
    pub fn new(size: usize, clock: Arc<dyn Clock>) -> Self {
        Self::with_history(size, clock, DEFAULT_HISTORY)
    }

    pub fn with_history(size: usize, clock: Arc<dyn Clock>, history: usize) -> Self {
        let members = (0..size.max(1))
            .map(|_| Member {
                reachable: AtomicBool::new(true),
                state: RwLock::new(MemberState::default()),
            })
            .collect();
        Self {
            members,
            leader: Mutex::new(()),
            clock,
            hub: Arc::new(WatchHub::new(history)),
        }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Fault injection: cut a member off from the leader
    pub fn set_member_reachable(&self, idx: usize, reachable: bool) {
        if let Some(member) = self.members.get(idx) {
            member.reachable.store(reachable, Ordering::SeqCst);
            debug!(member = idx, reachable, "Ensemble member reachability changed");
        }
    }

    pub fn reachable_members(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.reachable.load(Ordering::SeqCst))
            .count()
    }

    pub fn has_quorum(&self) -> bool {
        self.reachable_members() >= self.majority()
    }

    /// Revision a member has applied, for tests and inspection
    pub fn member_revision(&self, idx: usize) -> Option<u64> {
        self.members.get(idx).map(|m| m.state.read().revision)
    }

    /// Run a proposal against the committed state and apply its mutations
    /// to every reachable member
    pub fn commit<R, F>(&self, propose: F) -> Result<R>
    where
        F: FnOnce(&KvState, CommitCtx) -> Result<(Vec<Mutation>, R)>,
    {
        let _leader = self.leader.lock();

        let reachable: Vec<&Member> = self
            .members
            .iter()
            .filter(|m| m.reachable.load(Ordering::SeqCst))
            .collect();
        if reachable.len() < self.majority() {
            return Err(Error::unavailable(format!(
                "ensemble has {} of {} members reachable, majority is {}",
                reachable.len(),
                self.members.len(),
                self.majority()
            )));
        }

        let freshest = reachable
            .iter()
            .map(|m| m.state.read().clone())
            .max_by_key(|s| s.revision)
            .unwrap_or_default();
        for member in &reachable {
            let mut state = member.state.write();
            if state.revision < freshest.revision {
                *state = freshest.clone();
            }
        }

        let ctx = CommitCtx {
            now_ms: self.clock.now_ms(),
            revision: freshest.revision + 1,
        };
        let (mutations, result) = propose(&freshest.entries, ctx)?;
        if mutations.is_empty() {
            return Ok(result);
        }

        let mut next = freshest;
        let mut events = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            next.revision += 1;
            match mutation {
                Mutation::Put { key, value } => {
                    let version = next.entries.get(&key).map_or(1, |v| v.version + 1);
                    next.entries.insert(
                        key.clone(),
                        VersionedValue {
                            value: value.clone(),
                            version,
                            mod_revision: next.revision,
                        },
                    );
                    events.push(WatchEvent::Put {
                        key,
                        value,
                        version,
                        revision: next.revision,
                    });
                }
                Mutation::Delete { key } => {
                    if next.entries.remove(&key).is_some() {
                        events.push(WatchEvent::Delete {
                            key,
                            revision: next.revision,
                        });
                    }
                }
            }
        }

        for member in &reachable {
            *member.state.write() = next.clone();
        }
        self.hub.publish(events);
        Ok(result)
    }

    fn read_state<R>(&self, f: impl FnOnce(&MemberState) -> R) -> Result<(R, bool)> {
        let reachable: Vec<&Member> = self
            .members
            .iter()
            .filter(|m| m.reachable.load(Ordering::SeqCst))
            .collect();
        let Some(freshest) = reachable.iter().max_by_key(|m| m.state.read().revision) else {
            return Err(Error::unavailable("no ensemble member reachable"));
        };
        let stale = reachable.len() < self.majority();
        if stale {
            warn!(
                reachable = reachable.len(),
                majority = self.majority(),
                "Serving stale ensemble read"
            );
        }
        let state = freshest.state.read();
        Ok((f(&state), stale))
    }

    pub fn get(&self, key: &str) -> Result<ReadView> {
        let ((value, revision), stale) =
            self.read_state(|s| (s.entries.get(key).cloned(), s.revision))?;
        Ok(ReadView {
            version: value.as_ref().map_or(0, |v| v.version),
            value: value.map(|v| v.value),
            revision,
            stale,
        })
    }

    /// Every key under `prefix`, with the revision and staleness of the read
    pub fn list(&self, prefix: &str) -> Result<(Vec<(String, VersionedValue)>, u64, bool)> {
        let ((entries, revision), stale) = self.read_state(|s| {
            let entries = s
                .entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>();
            (entries, s.revision)
        })?;
        Ok((entries, revision, stale))
    }

    /// Compare-and-set: `expected_version = 0` means the key must not exist
    pub fn propose(&self, key: &str, expected_version: u64, value: Vec<u8>) -> Result<u64> {
        self.commit(|state, _| {
            check_version(state, key, expected_version)?;
            Ok((
                vec![Mutation::Put {
                    key: key.to_string(),
                    value,
                }],
                expected_version + 1,
            ))
        })
    }

    /// Compare-and-set that only commits while `fence` is the live lease
    pub fn propose_fenced(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
        fence: &LeaseToken,
    ) -> Result<u64> {
        self.commit(|state, ctx| {
            lease::check(state, ctx.now_ms, fence)?;
            check_version(state, key, expected_version)?;
            Ok((
                vec![Mutation::Put {
                    key: key.to_string(),
                    value,
                }],
                expected_version + 1,
            ))
        })
    }

    pub fn delete(&self, key: &str, expected_version: u64) -> Result<()> {
        self.commit(|state, _| {
            check_version(state, key, expected_version)?;
            Ok((
                vec![Mutation::Delete {
                    key: key.to_string(),
                }],
                (),
            ))
        })
    }

    pub fn watch(&self, prefix: &str, from_revision: u64) -> Result<WatchStream> {
        let (current, _) = self.read_state(|s| s.revision)?;
        Ok(self.hub.subscribe(prefix, from_revision, current))
    }

    pub fn acquire_lease(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
        guard: Option<&LeaseGuard>,
    ) -> Result<LeaseToken> {
        self.commit(|state, ctx| lease::grant(state, ctx, resource, holder, ttl, guard))
    }

    pub fn renew_lease(&self, token: &LeaseToken) -> Result<LeaseToken> {
        self.commit(|state, ctx| lease::renew(state, ctx, token))
    }

    pub fn release_lease(&self, token: &LeaseToken) -> Result<()> {
        self.commit(|state, _| Ok((lease::release(state, token)?, ())))
    }

    /// Live lease on `resource`, if any
    pub fn lease_holder(&self, resource: &str) -> Result<Option<LeaseRecord>> {
        let now_ms = self.clock.now_ms();
        let (record, _) = self.read_state(|s| lease::current(&s.entries, resource))?;
        Ok(record?.filter(|r| r.is_live(now_ms)))
    }

    /// Every stored lease record, live or expired
    pub fn list_leases(&self) -> Result<Vec<LeaseRecord>> {
        let (entries, _, _) = self.list(LEASE_PREFIX)?;
        entries
            .iter()
            .map(|(_, v)| lease::decode_record(&v.value))
            .collect()
    }

    /// Delete expired lease records; returns how many were removed
    pub fn scavenge_leases(&self) -> Result<usize> {
        self.commit(|state, ctx| {
            let mutations = lease::scavenge(state, ctx.now_ms)?;
            let removed = mutations.len();
            Ok((mutations, removed))
        })
    }
}

fn check_version(state: &KvState, key: &str, expected_version: u64) -> Result<()> {
    let actual = state.get(key).map_or(0, |v| v.version);
    if actual != expected_version {
        return Err(Error::Conflict {
            key: key.to_string(),
            expected: expected_version,
            actual,
        });
    }
    Ok(())
}
