//! Scoped Lock System
//!
//! Cooperative mutual exclusion over a namespaced keyspace. Acquisition is a
//! single atomic add-if-absent against a pluggable store; there is no waiting
//! or queueing, callers that need to wait retry on their own.

pub mod file;

pub use file::FileLockStore;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::error::{FederationError, Result};

/// Shortest expected duration of a locked operation
pub const EXPIRES_MINIMUM: Duration = Duration::from_secs(300);

/// Locks outlive a crashed holder by this much before they can be reclaimed
pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 300);

/// Atomic add-if-absent keyed store
pub trait LockStore: Send + Sync {
    /// Insert the key unless a live entry exists. Returns true if inserted.
    fn add(&self, key: &str, ttl: Duration) -> Result<bool>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Remove every key starting with `prefix`, returning how many went away
    fn delete_by_prefix(&self, prefix: &str) -> Result<usize>;
}

pub(crate) fn expiry_after(ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| FederationError::LockStore(format!("invalid ttl: {}", e)))?;
    Ok(Utc::now() + ttl)
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>>> {
        self.entries
            .lock()
            .map_err(|_| FederationError::LockStore("memory lock store poisoned".into()))
    }
}

impl LockStore for MemoryLockStore {
    fn add(&self, key: &str, ttl: Duration) -> Result<bool> {
        let expires_at = expiry_after(ttl)?;
        let mut entries = self.entries()?;
        if let Some(existing) = entries.get(key) {
            if *existing > Utc::now() {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), expires_at);
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries()?.remove(key);
        Ok(())
    }

    fn delete_by_prefix(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }
}

/// Lock over the keys of one namespace. Clones share the set of keys
/// acquired through them.
#[derive(Clone)]
pub struct ScopedLock {
    store: Arc<dyn LockStore>,
    namespace: String,
    ttl: Duration,
    held: Arc<Mutex<HashSet<String>>>,
}

impl fmt::Debug for ScopedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedLock")
            .field("namespace", &self.namespace)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl ScopedLock {
    pub fn new(store: Arc<dyn LockStore>, namespace: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            ttl: DEFAULT_TTL,
            held: Arc::default(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Same store and expiry under another namespace
    pub fn scoped(&self, namespace: &str) -> Self {
        Self {
            store: Arc::clone(&self.store),
            namespace: namespace.to_string(),
            ttl: self.ttl,
            held: Arc::default(),
        }
    }

    fn held(&self) -> Result<std::sync::MutexGuard<'_, HashSet<String>>> {
        self.held
            .lock()
            .map_err(|_| FederationError::LockStore("held key set poisoned".into()))
    }

    fn full_key(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.namespace, key)
        }
    }

    /// Try to take the lock; false if someone already holds it
    pub fn acquire(&self, key: &str) -> Result<bool> {
        let acquired = self.store.add(&self.full_key(key), self.ttl)?;
        tracing::debug!(namespace = %self.namespace, key, acquired, "lock acquire");
        if acquired {
            self.held()?.insert(key.to_string());
        }
        Ok(acquired)
    }

    pub fn release(&self, key: &str) -> Result<()> {
        self.held()?.remove(key);
        self.store.delete(&self.full_key(key))
    }

    /// Drop a lock regardless of who holds it
    pub fn force_drop(&self, key: &str) -> Result<()> {
        tracing::warn!(namespace = %self.namespace, key, "forcing lock drop");
        self.held()?.remove(key);
        self.store.delete(&self.full_key(key))
    }

    /// Keys currently held through this lock, sorted
    pub fn held_keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.held()?.iter().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Release only the keys acquired through this lock; other holders keep theirs
    pub fn release_held(&self) -> Result<usize> {
        let keys: Vec<String> = self.held()?.drain().collect();
        for key in &keys {
            self.store.delete(&self.full_key(key))?;
        }
        if !keys.is_empty() {
            tracing::info!(namespace = %self.namespace, released = keys.len(), "released held locks");
        }
        Ok(keys.len())
    }

    /// Remove every lock in this namespace
    pub fn clean(&self) -> Result<usize> {
        if self.namespace.is_empty() {
            return Err(FederationError::Config(
                "refusing to clean locks without a namespace".into(),
            ));
        }
        let removed = self.store.delete_by_prefix(&format!("{}:", self.namespace))?;
        self.held()?.clear();
        if removed > 0 {
            tracing::info!(namespace = %self.namespace, removed, "cleaned locks");
        }
        Ok(removed)
    }

    /// Acquire and hand back a guard that releases on drop; None if already held
    pub fn guard(&self, key: &str) -> Result<Option<LockGuard>> {
        if self.acquire(key)? {
            Ok(Some(LockGuard { lock: self.clone(), key: key.to_string() }))
        } else {
            Ok(None)
        }
    }
}

/// RAII guard that releases lock on drop
#[derive(Debug)]
pub struct LockGuard {
    lock: ScopedLock,
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release(&self.key) {
            tracing::warn!(key = %self.key, error = %e, "failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(ns: &str) -> ScopedLock {
        ScopedLock::new(Arc::new(MemoryLockStore::new()), ns)
    }

    #[test]
    fn test_acquire_release() {
        let l = lock("sync");
        assert!(l.acquire("users").unwrap());
        // Can't acquire same lock twice
        assert!(!l.acquire("users").unwrap());
        l.release("users").unwrap();
        assert!(l.acquire("users").unwrap());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let l = lock("sync");
        let guard = l.guard("users").unwrap().unwrap();
        assert_eq!(guard.key(), "users");
        assert!(l.guard("users").unwrap().is_none());
        drop(guard);
        assert!(l.guard("users").unwrap().is_some());
    }

    #[test]
    fn test_namespaces_are_separate() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let a = ScopedLock::new(Arc::clone(&store), "a");
        let b = a.scoped("b");
        assert!(a.acquire("t").unwrap());
        assert!(b.acquire("t").unwrap());

        assert_eq!(a.clean().unwrap(), 1);
        assert!(a.acquire("t").unwrap());
        assert!(!b.acquire("t").unwrap());
    }

    #[test]
    fn test_clean_requires_namespace() {
        assert!(lock("").clean().is_err());
    }

    #[test]
    fn test_expired_entry_is_replaced() {
        let l = lock("x").with_ttl(Duration::from_secs(0));
        assert!(l.acquire("k").unwrap());
        std::thread::sleep(Duration::from_millis(5));
        assert!(l.acquire("k").unwrap());
    }

    #[test]
    fn test_release_held_keeps_foreign_locks() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let ours = ScopedLock::new(Arc::clone(&store), "sync");
        let theirs = ScopedLock::new(Arc::clone(&store), "sync");

        assert!(ours.acquire("a").unwrap());
        assert!(theirs.acquire("b").unwrap());
        assert_eq!(ours.held_keys().unwrap(), vec!["a"]);

        assert_eq!(ours.release_held().unwrap(), 1);
        assert!(ours.held_keys().unwrap().is_empty());
        assert!(!ours.acquire("b").unwrap());
        assert!(theirs.acquire("a").unwrap());
    }

    #[test]
    fn test_force_drop() {
        let l = lock("x");
        let _guard = l.guard("k").unwrap().unwrap();
        l.force_drop("k").unwrap();
        assert!(l.acquire("k").unwrap());
    }
}
