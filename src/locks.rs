use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::OwnedMutexGuard;

/// `KeyedLocks` serializes async sections that share a key while letting sections with different
/// keys run concurrently.
///
/// Entries are pruned lazily: locks nobody holds or waits for are dropped on the next `lock()`.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub(crate) fn new() -> KeyedLocks {
        KeyedLocks::default()
    }

    /// Wait until no other holder of `key` exists and return a guard that releases the key on
    /// drop.
    pub(crate) async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .expect("thread holding keyed locks map should not panic");
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.to_owned()).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks
            .lock()
            .expect("thread holding keyed locks map should not panic")
            .len()
    }
}
