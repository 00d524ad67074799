use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Tokens this instance believes it holds, keyed by lock key
///
/// Local bookkeeping only; the store's lock record is authoritative.
#[derive(Debug, Default)]
pub struct LockTable {
    tokens: Mutex<HashMap<String, u64>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, lock_key: &str) -> Option<u64> {
        self.guard().get(lock_key).copied()
    }

    pub fn insert(&self, lock_key: impl Into<String>, token: u64) {
        self.guard().insert(lock_key.into(), token);
    }

    pub fn remove(&self, lock_key: &str) -> Option<u64> {
        self.guard().remove(lock_key)
    }

    /// Removes the entry only if it still holds `token`
    pub fn remove_if(&self, lock_key: &str, token: u64) -> bool {
        let mut tokens = self.guard();

        if tokens.get(lock_key) == Some(&token) {
            tokens.remove(lock_key);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        // The map is always left consistent, so a poisoned guard is still usable
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
