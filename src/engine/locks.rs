use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::domain::CaseId;

/// Per-case mutual exclusion supplied by the host.
///
/// The orchestrator reads current state, computes new state and appends
/// history in separate steps, so callers must never run two transitions for
/// the same case at once. Different cases may run in parallel.
pub trait CaseLock: Send + Sync {
    fn with_case_lock<T, F>(&self, case_id: &CaseId, f: F) -> T
    where
        F: FnOnce() -> T;
}

/// In-process [`CaseLock`] for hosts running a single worker process.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCaseLocks {
    cases: Arc<Mutex<HashMap<CaseId, Arc<Mutex<()>>>>>,
}

impl InMemoryCaseLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cases with a held or awaited lock.
    pub fn held(&self) -> usize {
        lock_ignoring_poison(&*self.cases).len()
    }
}

impl CaseLock for InMemoryCaseLocks {
    fn with_case_lock<T, F>(&self, case_id: &CaseId, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let case_mutex = {
            let mut cases = lock_ignoring_poison(&*self.cases);
            Arc::clone(cases.entry(case_id.clone()).or_default())
        };

        let result = {
            let _held = lock_ignoring_poison(&*case_mutex);
            f()
        };

        // Entries are only cloned or released under the map lock, so the count is exact here.
        let mut cases = lock_ignoring_poison(&*self.cases);
        drop(case_mutex);
        if cases
            .get(case_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            cases.remove(case_id);
        }
        result
    }
}

/// A panic inside one transition must not wedge every later transition.
fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Optimistic concurrency check against the persisted case.
pub trait CaseGuard: Send + Sync {
    /// Persisted version of `case_id`, or `None` when the guard does not track it.
    fn current_version(&self, case_id: &CaseId) -> Result<Option<u64>, GuardError>;
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("case guard unavailable: {0}")]
    Unavailable(String),
}

/// Version table standing in for the persistence layer.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCaseGuard {
    versions: Arc<Mutex<HashMap<CaseId, u64>>>,
}

impl InMemoryCaseGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `version` as persisted for `case_id`.
    pub fn set_version(&self, case_id: &CaseId, version: u64) {
        lock_ignoring_poison(&*self.versions).insert(case_id.clone(), version);
    }
}

impl CaseGuard for InMemoryCaseGuard {
    fn current_version(&self, case_id: &CaseId) -> Result<Option<u64>, GuardError> {
        let versions = self
            .versions
            .lock()
            .map_err(|_| GuardError::Unavailable("case guard mutex poisoned".to_string()))?;
        Ok(versions.get(case_id).copied())
    }
}
