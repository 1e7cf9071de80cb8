//! Per-key write serialization
//!
//! Writers lock every key an operation touches (the server key and the name
//! keys involved). Keys are acquired in sorted order, so two operations that
//! share keys never deadlock and operations on disjoint keys never wait on
//! each other. Idle entries are dropped when the last guard goes away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Default)]
pub struct KeyLocks {
    locks: LockMap,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock all `keys`, waiting for current holders to release them
    pub async fn acquire<I>(&self, keys: I) -> KeyGuard
    where
        I: IntoIterator<Item = String>,
    {
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = {
                let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
                map.entry(key.clone()).or_default().clone()
            };
            guards.push(lock.lock_owned().await);
        }

        KeyGuard {
            keys,
            guards,
            locks: self.locks.clone(),
        }
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds a set of key locks until dropped
pub struct KeyGuard {
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl KeyGuard {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guards.clear();
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        for key in &self.keys {
            // Only the map holds it: nobody waits on this key
            if map.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                map.remove(key);
            }
        }
    }
}

/// Lock key for the server address of an entry
pub fn server_key(server: &str) -> String {
    format!("server:{}", server)
}

/// Lock key for a `(project, name)` pair, `None` for unnamed entries
pub fn name_key(project: &str, name: &str) -> Option<String> {
    if name.is_empty() {
        None
    } else {
        Some(format!("name:{}/{}", project, name))
    }
}
