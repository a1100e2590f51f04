// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-execution context cache.
//!
//! One [`ExecutionContext`] per execution identity, each behind its own async
//! mutex. [`ExecutionCache::acquire`] returns an [`ExecutionHandle`] holding
//! that lock; dropping the handle releases it. Callers touching the same
//! execution are serialized, different executions proceed in parallel.
//!
//! ```text
//! acquire(ns/wf/run) ──► holders += 1 ──► lock ──► handle
//!                                                    │ load() → store read, once per handle
//!                                                    ▼
//!                         holders -= 1 ◄── unlock ◄── drop(handle)
//!                              │
//!                              └─ 0 holders → context removed
//! ```
//!
//! Every handle starts from a fresh read of the execution store, so a run
//! that closed since the previous task is seen as closed. Only executions
//! with a handle held or awaited are kept in the map.
//!
//! Dropping a handle is the only release path, so early returns, `?` and
//! cancelled futures all release. A future cancelled while still waiting for
//! the lock releases its reservation the same way.

use crate::error::{StoreError, StoreResult};
use crate::execution::ExecutionState;
use crate::metrics;
use crate::store::ExecutionStore;
use crate::task::ExecutionIdentity;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type Contexts = DashMap<ExecutionIdentity, Arc<ExecutionContext>>;

/// Lock for one execution plus the number of outstanding handles.
struct ExecutionContext {
    holders: AtomicUsize,
    lock: Arc<Mutex<()>>,
}

impl ExecutionContext {
    fn new() -> Self {
        Self {
            holders: AtomicUsize::new(0),
            lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Reference-counted map of execution contexts, keyed by identity.
///
/// A context lives while at least one handle for it is held or being
/// acquired, and is removed when the last one is released.
pub struct ExecutionCache<S: ExecutionStore> {
    store: Arc<S>,
    contexts: Arc<Contexts>,
}

impl<S: ExecutionStore> ExecutionCache<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            contexts: Arc::new(DashMap::new()),
        }
    }

    /// The durable store backing this cache.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get or create the context for `identity` and lock it.
    ///
    /// Never fails: an unknown identity gets a fresh, empty context. Waits
    /// while another handle for the same identity is alive.
    pub async fn acquire(&self, identity: &ExecutionIdentity) -> ExecutionHandle<S> {
        // The holder count is bumped while the map entry is locked, so a
        // concurrent release cannot remove the context out from under us.
        let context = {
            let entry = self
                .contexts
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(ExecutionContext::new()));
            entry.holders.fetch_add(1, Ordering::AcqRel);
            Arc::clone(entry.value())
        };
        metrics::set_cached_executions(self.contexts.len());

        let lease = Lease {
            identity: identity.clone(),
            context: Arc::clone(&context),
            contexts: Arc::clone(&self.contexts),
        };

        let guard = Arc::clone(&context.lock).lock_owned().await;
        trace!(execution = %identity, "Execution handle acquired");

        ExecutionHandle {
            state: None,
            _guard: guard,
            lease,
            store: Arc::clone(&self.store),
        }
    }

    /// Number of contexts currently held or awaited.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn is_cached(&self, identity: &ExecutionIdentity) -> bool {
        self.contexts.contains_key(identity)
    }

    /// Outstanding handles (held or waiting) for `identity`.
    pub fn holders(&self, identity: &ExecutionIdentity) -> usize {
        self.contexts
            .get(identity)
            .map(|ctx| ctx.holders.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

/// Reservation on a context, released on drop.
///
/// Created before waiting on the lock so that a cancelled `acquire` still
/// gives its reservation back.
struct Lease {
    identity: ExecutionIdentity,
    context: Arc<ExecutionContext>,
    contexts: Arc<Contexts>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.context.holders.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Re-checked under the shard lock: an acquire may have raced in.
        let removed = self
            .contexts
            .remove_if(&self.identity, |_, ctx| {
                Arc::ptr_eq(ctx, &self.context) && ctx.holders.load(Ordering::Acquire) == 0
            })
            .is_some();
        if removed {
            trace!(execution = %self.identity, "Idle execution context removed");
            metrics::set_cached_executions(self.contexts.len());
        }
    }
}

/// Exclusive access to one execution's state while held.
///
/// Copy what you need out of the state and drop the handle before any slow
/// I/O such as publishing.
pub struct ExecutionHandle<S: ExecutionStore> {
    state: Option<ExecutionState>,
    // Field order matters: the lock is released before the lease.
    _guard: OwnedMutexGuard<()>,
    lease: Lease,
    store: Arc<S>,
}

impl<S: ExecutionStore> ExecutionHandle<S> {
    pub fn identity(&self) -> &ExecutionIdentity {
        &self.lease.identity
    }

    /// Read the execution from the store on first call, then return that
    /// copy for the rest of this handle's life.
    ///
    /// A [`StoreError::NotFound`] leaves the handle empty.
    pub async fn load(&mut self) -> StoreResult<&ExecutionState> {
        if self.state.is_none() {
            let start = Instant::now();
            let result = self.store.get_execution(&self.lease.identity).await;
            metrics::record_execution_load(result.is_ok(), start.elapsed());
            self.state = Some(result?);
        }
        self.state
            .as_ref()
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", self.lease.identity)))
    }

    /// The state read by [`load`](Self::load), if any.
    pub fn state(&self) -> Option<&ExecutionState> {
        self.state.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionStatus;
    use crate::store::InMemoryExecutionStore;
    use crate::version_history::VersionHistories;
    use std::time::Duration;

    fn identity(run: &str) -> ExecutionIdentity {
        ExecutionIdentity::new("ns", "wf", run)
    }

    fn cache_with(run: &str) -> (Arc<InMemoryExecutionStore>, ExecutionCache<InMemoryExecutionStore>) {
        let store = Arc::new(InMemoryExecutionStore::new());
        store.insert(identity(run), ExecutionState::running(VersionHistories::default()));
        let cache = ExecutionCache::new(Arc::clone(&store));
        (store, cache)
    }

    #[tokio::test]
    async fn test_acquire_unknown_identity_never_fails() {
        let (_store, cache) = cache_with("present");

        let mut handle = cache.acquire(&identity("absent")).await;
        assert!(cache.is_cached(&identity("absent")));
        assert_eq!(cache.holders(&identity("absent")), 1);

        let err = handle.load().await.unwrap_err();
        assert!(err.is_not_found());
        assert!(handle.state().is_none());

        drop(handle);
        assert!(!cache.is_cached(&identity("absent")));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_context_removed_after_last_release() {
        let (_store, cache) = cache_with("run");

        {
            let mut handle = cache.acquire(&identity("run")).await;
            assert!(handle.load().await.unwrap().is_running());
            assert!(cache.is_cached(&identity("run")));
        }
        assert!(!cache.is_cached(&identity("run")));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_each_handle_reads_the_store() {
        let (store, cache) = cache_with("run");

        {
            let mut handle = cache.acquire(&identity("run")).await;
            assert!(handle.load().await.unwrap().is_running());
        }
        store.insert(
            identity("run"),
            ExecutionState::running(VersionHistories::default()).with_status(ExecutionStatus::Completed),
        );

        let mut handle = cache.acquire(&identity("run")).await;
        assert!(!handle.load().await.unwrap().is_running());
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test]
    async fn test_load_is_read_once_per_handle() {
        let (store, cache) = cache_with("run");

        let mut handle = cache.acquire(&identity("run")).await;
        assert!(handle.state().is_none());
        handle.load().await.unwrap();
        handle.load().await.unwrap();
        assert!(handle.state().is_some());
        assert_eq!(store.load_count(), 1);
        assert_eq!(handle.identity(), &identity("run"));
    }

    #[tokio::test]
    async fn test_same_identity_is_serialized() {
        let (_store, cache) = cache_with("run");
        let cache = Arc::new(cache);

        let first = cache.acquire(&identity("run")).await;

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let _second = cache.acquire(&identity("run")).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(cache.holders(&identity("run")), 2);

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cache.holders(&identity("run")), 0);
    }

    #[tokio::test]
    async fn test_different_identities_do_not_block() {
        let (_store, cache) = cache_with("a");

        let _a = cache.acquire(&identity("a")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), cache.acquire(&identity("b"))).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_acquire_releases_reservation() {
        let (_store, cache) = cache_with("run");

        let held = cache.acquire(&identity("other")).await;
        let timed_out =
            tokio::time::timeout(Duration::from_millis(10), cache.acquire(&identity("other"))).await;
        assert!(timed_out.is_err());
        assert_eq!(cache.holders(&identity("other")), 1);

        drop(held);
        assert!(!cache.is_cached(&identity("other")));
    }
}
