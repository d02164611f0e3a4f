//! Per-identity issuance locks.
//!
//! At most one issuance runs per [`IdentityKey`]. A second attempt for a
//! key that is already held fails immediately instead of queueing, and
//! holding one key never blocks another.

use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use certgate_common::IdentityKey;

/// Set of identities with an issuance in flight.
///
/// Backed by a sharded `DashMap`, so acquisitions for unrelated keys don't
/// contend on a global lock.
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    inflight: Arc<DashMap<IdentityKey, Instant>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key`, or `None` if it is already held.
    pub fn try_acquire(&self, key: &IdentityKey) -> Option<IssuanceLock> {
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(held) => {
                debug!(
                    key = %key,
                    held_for_ms = held.get().elapsed().as_millis() as u64,
                    "Issuance already in progress"
                );
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                trace!(key = %key, "Acquired issuance lock");
                Some(IssuanceLock {
                    inflight: Arc::clone(&self.inflight),
                    key: key.clone(),
                })
            }
        }
    }

    pub fn is_held(&self, key: &IdentityKey) -> bool {
        self.inflight.contains_key(key)
    }

    /// Number of identities currently being issued.
    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

/// Held issuance lock. Released on drop.
#[derive(Debug)]
pub struct IssuanceLock {
    inflight: Arc<DashMap<IdentityKey, Instant>>,
    key: IdentityKey,
}

impl IssuanceLock {
    #[cfg(test)]
    fn key(&self) -> &IdentityKey {
        &self.key
    }
}

impl Drop for IssuanceLock {
    fn drop(&mut self) {
        if let Some((key, started)) = self.inflight.remove(&self.key) {
            trace!(
                key = %key,
                held_ms = started.elapsed().as_millis() as u64,
                "Released issuance lock"
            );
        }
    }
}
