use dashmap::DashMap;
use shared::{Error, Result};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Registry = DashMap<String, Arc<Mutex<()>>>;

/// Per-key mutual exclusion shared by the façade, the coherence listener and
/// the expiration bridge.
///
/// Each contended token maps to a reference-counted mutex. A registry entry
/// lives exactly as long as some task holds or waits on it: the last guard to
/// drop removes it, so the map never outgrows the set of keys in use and two
/// different mutexes never exist for the same token at once.
#[derive(Clone, Default)]
pub struct KeyLocks {
    registry: Arc<Registry>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait (without timeout) until `token` is free and take it.
    pub async fn acquire(&self, token: &str) -> KeyGuard {
        let mut pending = PendingWait::new(&self.registry, token);
        let wait = self.handle(token).lock_owned();
        let guard = wait.await;
        pending.finish();
        self.guard(token, guard)
    }

    /// Like `acquire`, but give up with `Error::LockTimeout` after `timeout`.
    pub async fn acquire_timeout(&self, token: &str, timeout: Duration) -> Result<KeyGuard> {
        let mut pending = PendingWait::new(&self.registry, token);
        let wait = self.handle(token).lock_owned();
        let guard = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::LockTimeout(token.to_string()))?;
        pending.finish();
        Ok(self.guard(token, guard))
    }

    /// Number of tokens currently held or waited on
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    fn guard(&self, token: &str, guard: OwnedMutexGuard<()>) -> KeyGuard {
        KeyGuard {
            guard: Some(guard),
            registry: Arc::clone(&self.registry),
            token: token.to_string(),
        }
    }

    fn handle(&self, token: &str) -> Arc<Mutex<()>> {
        // Cloned while the shard is write-locked, so `prune` can never observe
        // a count of one for a handle somebody is about to wait on
        self.registry
            .entry(token.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Debug for KeyLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLocks")
            .field("tokens", &self.registry.len())
            .finish()
    }
}

fn prune(registry: &Registry, token: &str) {
    registry.remove_if(token, |_, lock| Arc::strong_count(lock) == 1);
}

/// Prunes the token when a wait ends without the lock, by timeout or by the
/// waiting future being dropped.
///
/// Must be created before the wait future so it drops after it and the
/// abandoned handle no longer counts.
struct PendingWait<'a> {
    registry: &'a Registry,
    token: &'a str,
    waiting: bool,
}

impl<'a> PendingWait<'a> {
    fn new(registry: &'a Registry, token: &'a str) -> Self {
        Self {
            registry,
            token,
            waiting: true,
        }
    }

    fn finish(&mut self) {
        self.waiting = false;
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if self.waiting {
            prune(self.registry, self.token);
        }
    }
}

/// Exclusive hold on one key; released when dropped.
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    registry: Arc<Registry>,
    token: String,
}

impl KeyGuard {
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release the mutex first so the guard's own handle no longer counts
        drop(self.guard.take());
        prune(&self.registry, &self.token);
    }
}

impl Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("token", &self.token).finish()
    }
}
