//! Per-operation serialization
//!
//! Deliveries for the same operation run one at a time inside this process;
//! deliveries for different operations never wait on each other. Entries are
//! held weakly, so the map only keeps locks someone is holding or waiting on.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct OperationLocks {
    locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl OperationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `operation_id`
    pub async fn acquire(&self, operation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, entry| entry.strong_count() > 0);

            match locks.get(operation_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    locks.insert(operation_id.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };

        lock.lock_owned().await
    }

    /// Number of operations with a live lock
    pub async fn active(&self) -> usize {
        self.locks
            .lock()
            .await
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }
}
