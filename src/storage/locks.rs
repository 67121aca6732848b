//! In-process exclusive locks on principals.
//!
//! Merge and split hold locks on the principals they edit so two graph edits
//! on the same pair cannot interleave. Resolution never takes these locks;
//! it relies on optimistic commit validation instead.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::ExecutionError;
use crate::principal::PrincipalId;

/// Lock table keyed by principal id.
#[derive(Debug, Default)]
pub struct PrincipalLocks {
    held: Mutex<HashSet<PrincipalId>>,
    released: Condvar,
}

impl PrincipalLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks every id in `ids` (all or nothing), waiting at most `timeout`.
    ///
    /// Ids are taken in ascending order as one unit, so two callers locking
    /// overlapping pairs cannot deadlock.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::LockTimeout` naming the first contended id.
    pub fn acquire(
        &self,
        ids: &[PrincipalId],
        timeout: Duration,
    ) -> Result<PrincipalLockGuard<'_>, ExecutionError> {
        let mut wanted = ids.to_vec();
        wanted.sort();
        wanted.dedup();

        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let Some(contended) = wanted.iter().find(|id| held.contains(*id)).copied() else {
                held.extend(wanted.iter().copied());
                return Ok(PrincipalLockGuard {
                    locks: self,
                    ids: wanted,
                });
            };
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(principal = %contended, "principal lock timed out");
                return Err(ExecutionError::LockTimeout {
                    id: contended,
                    duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            let (guard, _) = self
                .released
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            held = guard;
        }
    }

    /// Returns true if `id` is currently locked.
    #[must_use]
    pub fn is_locked(&self, id: PrincipalId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }
}

/// Releases its principals when dropped.
#[derive(Debug)]
pub struct PrincipalLockGuard<'a> {
    locks: &'a PrincipalLocks,
    ids: Vec<PrincipalId>,
}

impl PrincipalLockGuard<'_> {
    /// The locked ids, ascending.
    #[must_use]
    pub fn ids(&self) -> &[PrincipalId] {
        &self.ids
    }
}

impl Drop for PrincipalLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for id in &self.ids {
            held.remove(id);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}
