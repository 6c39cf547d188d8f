//! Registry of live relay workers.
//!
//! Every relay worker inserts itself when it starts and removes itself right
//! before it stops. The registry is only used for bulk cancellation during
//! shutdown; workers of the same connection coordinate through their own
//! connection state, never through the registry.
//!
//! The membership set sits behind a single `std::sync::Mutex` that is never
//! held across an await point. [`WorkerRegistry::cancel_all`] snapshots the
//! members under the lock and cancels + joins them after releasing it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

/// Process-unique identity of a relay worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Allocate the next worker id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w-{}", self.0)
    }
}

/// Control handle for one relay worker.
///
/// Clones share the same tokens. `cancel` asks the worker to stop at its
/// next (or current) suspension point; `join` resolves once the worker task
/// has fully ended, including its teardown.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    cancel: CancellationToken,
    stopped: CancellationToken,
}

impl WorkerHandle {
    pub fn new() -> Self {
        Self {
            id: WorkerId::next(),
            cancel: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Wait until the worker has fully stopped.
    pub async fn join(&self) {
        self.stopped.cancelled().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Guard that marks the worker stopped when dropped.
    ///
    /// Create it before spawning and move it into the task's future: a join
    /// then also completes if the task panics, or is aborted before it ever
    /// ran.
    pub(crate) fn stop_guard(&self) -> DropGuard {
        self.stopped.clone().drop_guard()
    }
}

impl Default for WorkerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration refused because the registry has been swept for shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryClosed;

impl fmt::Display for RegistryClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker registry is closed")
    }
}

impl std::error::Error for RegistryClosed {}

#[derive(Default)]
struct Members {
    workers: HashMap<WorkerId, WorkerHandle>,
    closed: bool,
}

/// Synchronised set of running relay workers.
#[derive(Default)]
pub struct WorkerRegistry {
    members: Mutex<Members>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Members> {
        // The set is updated with single insert/remove calls, so a panic
        // while holding the lock cannot leave it half-modified.
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a worker.
    ///
    /// Fails once [`cancel_all`](Self::cancel_all) has started; the caller
    /// must then treat itself as cancelled.
    pub fn register(&self, handle: &WorkerHandle) -> Result<(), RegistryClosed> {
        let mut members = self.lock();
        if members.closed {
            return Err(RegistryClosed);
        }
        members.workers.insert(handle.id(), handle.clone());
        Ok(())
    }

    /// Remove a worker. Returns whether it was registered.
    pub fn unregister(&self, id: WorkerId) -> bool {
        self.lock().workers.remove(&id).is_some()
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.lock().workers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().workers.is_empty()
    }

    /// Whether a shutdown sweep has started.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Cancel every registered worker and wait for all of them to stop.
    ///
    /// Closes the registry first, so workers that try to register while the
    /// sweep runs are turned away and cancel themselves. Returns the number
    /// of workers in the snapshot.
    pub async fn cancel_all(&self) -> usize {
        let snapshot: Vec<WorkerHandle> = {
            let mut members = self.lock();
            members.closed = true;
            members.workers.values().cloned().collect()
        };

        info!(workers = snapshot.len(), "Cancelling all relay workers");

        for handle in &snapshot {
            handle.cancel();
        }
        for handle in &snapshot {
            handle.join().await;
            debug!(worker = %handle.id(), "Worker joined");
        }

        snapshot.len()
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members = self.lock();
        f.debug_struct("WorkerRegistry")
            .field("workers", &members.workers.len())
            .field("closed", &members.closed)
            .finish()
    }
}
