//! Leases held in the coordination ensemble
//!
//! A lease is a record under `leases/{resource}`. The fencing token is the
//! ensemble revision at which the lease was first granted to its current
//! holder, so tokens strictly increase across grants of one resource.
//! Expiry is judged against the ensemble's clock.

use super::ensemble::{CommitCtx, KvState, Mutation};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const LEASE_PREFIX: &str = "leases/";

pub fn lease_key(resource: &str) -> String {
    format!("{}{}", LEASE_PREFIX, resource)
}

/// Stored lease record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub resource: String,
    pub holder: String,
    /// Fencing token
    pub token: u64,
    pub ttl_ms: u64,
    pub expires_at_ms: i64,
}

impl LeaseRecord {
    pub fn is_live(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// What a holder keeps after a successful grant or renewal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    pub resource: String,
    pub holder: String,
    pub token: u64,
    pub expires_at_ms: i64,
}

impl LeaseToken {
    /// Whether the holder may still act on the lease at `now_ms`, keeping
    /// `margin` in reserve for clock drift between holder and ensemble
    pub fn valid_at(&self, now_ms: i64, margin: Duration) -> bool {
        now_ms + (margin.as_millis() as i64) < self.expires_at_ms
    }
}

impl From<&LeaseRecord> for LeaseToken {
    fn from(record: &LeaseRecord) -> Self {
        Self {
            resource: record.resource.clone(),
            holder: record.holder.clone(),
            token: record.token,
            expires_at_ms: record.expires_at_ms,
        }
    }
}

/// Extra condition checked atomically with a lease grant: `key` must be at
/// exactly `version` (0 = absent)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGuard {
    pub key: String,
    pub version: u64,
}

pub(crate) fn decode_record(bytes: &[u8]) -> Result<LeaseRecord> {
    Ok(serde_json::from_slice(bytes)?)
}

pub(crate) fn current(state: &KvState, resource: &str) -> Result<Option<LeaseRecord>> {
    state
        .get(&lease_key(resource))
        .map(|v| decode_record(&v.value))
        .transpose()
}

/// Grant `resource` to `holder`, or extend it when `holder` already owns it
pub(crate) fn grant(
    state: &KvState,
    ctx: CommitCtx,
    resource: &str,
    holder: &str,
    ttl: Duration,
    guard: Option<&LeaseGuard>,
) -> Result<(Vec<Mutation>, LeaseToken)> {
    if let Some(guard) = guard {
        let actual = state.get(&guard.key).map(|v| v.version).unwrap_or(0);
        if actual != guard.version {
            return Err(Error::Conflict {
                key: guard.key.clone(),
                expected: guard.version,
                actual,
            });
        }
    }

    let existing = current(state, resource)?;
    let token = match &existing {
        Some(record) if record.is_live(ctx.now_ms) && record.holder != holder => {
            return Err(Error::LeaseDenied {
                resource: resource.to_string(),
                holder: record.holder.clone(),
                expires_at_ms: record.expires_at_ms,
            });
        }
        Some(record) if record.is_live(ctx.now_ms) => record.token,
        _ => ctx.revision,
    };

    let record = LeaseRecord {
        resource: resource.to_string(),
        holder: holder.to_string(),
        token,
        ttl_ms: ttl.as_millis() as u64,
        expires_at_ms: ctx.now_ms + ttl.as_millis() as i64,
    };
    let token = LeaseToken::from(&record);
    Ok((
        vec![Mutation::Put {
            key: lease_key(resource),
            value: serde_json::to_vec(&record)?,
        }],
        token,
    ))
}

/// Verify that `lease` is the live lease on its resource
pub(crate) fn check(state: &KvState, now_ms: i64, lease: &LeaseToken) -> Result<LeaseRecord> {
    match current(state, &lease.resource)? {
        Some(record)
            if record.token == lease.token
                && record.holder == lease.holder
                && record.is_live(now_ms) =>
        {
            Ok(record)
        }
        _ => Err(Error::LeaseExpired {
            resource: lease.resource.clone(),
        }),
    }
}

pub(crate) fn renew(
    state: &KvState,
    ctx: CommitCtx,
    lease: &LeaseToken,
) -> Result<(Vec<Mutation>, LeaseToken)> {
    let mut record = check(state, ctx.now_ms, lease)?;
    record.expires_at_ms = ctx.now_ms + record.ttl_ms as i64;
    let renewed = LeaseToken::from(&record);
    Ok((
        vec![Mutation::Put {
            key: lease_key(&record.resource),
            value: serde_json::to_vec(&record)?,
        }],
        renewed,
    ))
}

pub(crate) fn release(state: &KvState, lease: &LeaseToken) -> Result<Vec<Mutation>> {
    match current(state, &lease.resource)? {
        Some(record) if record.token == lease.token && record.holder == lease.holder => {
            Ok(vec![Mutation::Delete {
                key: lease_key(&lease.resource),
            }])
        }
        _ => Ok(Vec::new()),
    }
}

/// Expired lease records to delete
pub(crate) fn scavenge(state: &KvState, now_ms: i64) -> Result<Vec<Mutation>> {
    let mut mutations = Vec::new();
    for (key, value) in state.range(LEASE_PREFIX.to_string()..) {
        if !key.starts_with(LEASE_PREFIX) {
            break;
        }
        if !decode_record(&value.value)?.is_live(now_ms) {
            mutations.push(Mutation::Delete { key: key.clone() });
        }
    }
    Ok(mutations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_validity_margin() {
        let token = LeaseToken {
            resource: "shard/0/primary".into(),
            holder: "node-0-0".into(),
            token: 3,
            expires_at_ms: 10_000,
        };
        assert!(token.valid_at(9_000, Duration::ZERO));
        assert!(!token.valid_at(9_000, Duration::from_millis(1_000)));
        assert!(!token.valid_at(10_000, Duration::ZERO));
    }

    #[test]
    fn test_lease_key_layout() {
        assert_eq!(lease_key("shard/1/primary"), "leases/shard/1/primary");
    }
}
