//! Fixed-size worker pool with fair, cancellable waiting
//!
//! `wait_for_available` hands out an idle worker immediately when there is
//! one. Otherwise the caller is queued under its key and granted the next
//! worker that frees up, oldest key first. A worker that has been handed
//! out is reserved by its [`WorkerLease`] until the lease executes a request
//! or is dropped.

use crate::worker::process::{AvailabilityObserver, Worker};
use crate::worker::registry::PendingRequestRegistry;
use crate::worker::schema::{Request, Response, WorkerError};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Metadata stored with every queued wait
struct Waiter {
    /// Distinguishes this wait from later ones under the same key
    ticket: u64,
    /// Token of the waiting caller, checked before every grant
    cancel: Option<CancellationToken>,
}

impl Waiter {
    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

struct PoolState {
    /// Workers handed to a caller that has not executed yet
    reserved: Vec<bool>,
    /// Queued waits, oldest first
    pending: PendingRequestRegistry<WorkerLease, Waiter>,
    /// Ticket for the next queued wait
    next_ticket: u64,
}

struct PoolShared {
    /// Fixed at construction; indices double as worker ids
    workers: Vec<Arc<Worker>>,
    /// Locked before any worker's own state, never across an await
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_free(&self, state: &PoolState, index: usize) -> bool {
        !state.reserved[index] && !self.workers[index].is_busy()
    }

    /// Hand `index` to the oldest queued wait that is still interested
    fn dispatch(self: &Arc<Self>, index: usize) {
        let mut state = self.lock();

        while self.is_free(&state, index) {
            let Some(key) = state.pending.keys().next().map(str::to_owned) else {
                return;
            };

            if state.pending.metadata(&key).is_some_and(Waiter::is_cancelled) {
                debug!(key = %key, "Dropping cancelled wait");
                let _ = state.pending.reject(&key, WorkerError::Cancelled);
                continue;
            }

            // The lease is only built for an entry that exists, so none is
            // ever dropped armed while the lock is held
            state.reserved[index] = true;
            let granted = state
                .pending
                .resolve_with(&key, || WorkerLease::new(Arc::clone(self), index));
            match granted {
                Ok(None) => {
                    debug!(key = %key, worker = index, "Granted worker to queued request");
                    return;
                }
                Ok(Some(mut lease)) => {
                    // The waiter went away; keep the worker and try the next one
                    lease.disarm();
                    state.reserved[index] = false;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Queued request vanished during dispatch");
                    state.reserved[index] = false;
                    return;
                }
            }
        }
    }

    /// Give back a reservation without running anything
    fn release(self: &Arc<Self>, index: usize) {
        self.lock().reserved[index] = false;
        self.dispatch(index);
    }

    /// Clear a reservation once its worker is busy executing
    fn unreserve(&self, index: usize) {
        self.lock().reserved[index] = false;
    }

    /// Remove the wait `ticket` under `key` if it is still queued
    fn remove_waiter(&self, key: &str, ticket: u64, error: WorkerError) -> bool {
        let mut state = self.lock();
        let current = state
            .pending
            .metadata(key)
            .is_some_and(|waiter| waiter.ticket == ticket);
        if current {
            let _ = state.pending.reject(key, error);
        }
        current
    }
}

impl AvailabilityObserver for PoolShared {
    fn worker_available(self: Arc<Self>, worker: usize) {
        self.dispatch(worker);
    }
}

/// Exclusive right to run one request on a pooled worker
///
/// Executing consumes the lease. Dropping it unused returns the worker to
/// the pool.
pub struct WorkerLease {
    shared: Arc<PoolShared>,
    /// Leased worker
    index: usize,
    /// Cleared once the reservation no longer needs releasing
    armed: bool,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker", &self.index)
            .finish()
    }
}

impl WorkerLease {
    fn new(shared: Arc<PoolShared>, index: usize) -> Self {
        Self {
            shared,
            index,
            armed: true,
        }
    }

    /// Index of the leased worker within its pool
    pub fn id(&self) -> usize {
        self.index
    }

    /// Run `request` on the leased worker
    ///
    /// The worker returns to the pool when the execution finishes, whatever
    /// the outcome.
    pub async fn execute(
        mut self,
        request: Request,
        cancel: Option<CancellationToken>,
    ) -> Result<Response, WorkerError> {
        let worker = Arc::clone(&self.shared.workers[self.index]);
        let guard = worker.begin(cancel.as_ref())?;

        self.disarm();
        self.shared.unreserve(self.index);
        drop(self);

        worker.run(guard, request, cancel).await
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            debug!(worker = self.index, "Lease dropped unused");
            self.shared.release(self.index);
        }
    }
}

/// Pool of a fixed number of workers
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Create a pool of `size` workers (at least one)
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let shared = Arc::new_cyclic(|weak: &Weak<PoolShared>| {
            let workers = (0..size)
                .map(|id| {
                    let observer: Weak<dyn AvailabilityObserver> = weak.clone();
                    Arc::new(Worker::with_observer(id, observer))
                })
                .collect();

            PoolShared {
                workers,
                state: Mutex::new(PoolState {
                    reserved: vec![false; size],
                    pending: PendingRequestRegistry::new(),
                    next_ticket: 0,
                }),
            }
        });

        Self { shared }
    }

    pub fn size(&self) -> usize {
        self.shared.workers.len()
    }

    /// Workers that are neither busy nor leased out
    pub fn free_count(&self) -> usize {
        let state = self.shared.lock();
        (0..self.size())
            .filter(|&index| self.shared.is_free(&state, index))
            .count()
    }

    /// Number of queued waits
    pub fn queued(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn has_pending(&self, key: &str) -> bool {
        self.shared.lock().pending.has(key)
    }

    /// Get a worker, waiting under `key` if all of them are taken
    ///
    /// A later wait under the same key fails this one with
    /// [`WorkerError::Replaced`]. Cancelling `cancel` while queued fails it
    /// with [`WorkerError::Cancelled`] and the wait is never granted a
    /// worker afterwards.
    pub async fn wait_for_available(
        &self,
        key: impl Into<String>,
        cancel: Option<CancellationToken>,
    ) -> Result<WorkerLease, WorkerError> {
        let key = key.into();

        let (ticket, receiver) = {
            let mut state = self.shared.lock();

            if let Some(index) = (0..self.size()).find(|&i| self.shared.is_free(&state, i)) {
                state.reserved[index] = true;
                debug!(key = %key, worker = index, "Worker available immediately");
                return Ok(WorkerLease::new(Arc::clone(&self.shared), index));
            }

            if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(WorkerError::Cancelled);
            }

            let ticket = state.next_ticket;
            state.next_ticket += 1;

            let (sender, receiver) = oneshot::channel();
            let waiter = Waiter {
                ticket,
                cancel: cancel.clone(),
            };
            state.pending.register(key.clone(), sender, waiter);
            debug!(key = %key, queued = state.pending.len(), "All workers busy, queueing request");
            (ticket, receiver)
        };

        let mut wait = PendingWait {
            shared: Arc::clone(&self.shared),
            key,
            ticket,
            receiver,
            settled: false,
        };
        wait.finish(cancel).await
    }
}

/// A queued wait; dropping it unsettled withdraws it from the queue
struct PendingWait {
    shared: Arc<PoolShared>,
    key: String,
    ticket: u64,
    receiver: oneshot::Receiver<Result<WorkerLease, WorkerError>>,
    settled: bool,
}

impl PendingWait {
    async fn finish(
        &mut self,
        cancel: Option<CancellationToken>,
    ) -> Result<WorkerLease, WorkerError> {
        let cancelled = async {
            match &cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let result = tokio::select! {
            biased;
            result = &mut self.receiver => match result {
                // Cancelled after the grant was sent; the dropped lease moves on
                Ok(Ok(lease)) if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) => {
                    debug!(key = %self.key, worker = lease.id(), "Grant arrived after cancellation");
                    drop(lease);
                    Err(WorkerError::Cancelled)
                }
                Ok(result) => result,
                // The registry settles every entry before dropping it, and
                // this wait keeps the pool alive
                Err(_) => Err(WorkerError::Cancelled),
            },
            _ = cancelled => {
                debug!(key = %self.key, "Queued request cancelled");
                if self.shared.remove_waiter(&self.key, self.ticket, WorkerError::Cancelled) {
                    Err(WorkerError::Cancelled)
                } else {
                    // Settled concurrently; a grant goes back to the pool
                    match self.receiver.try_recv() {
                        Ok(Err(e)) => Err(e),
                        _ => Err(WorkerError::Cancelled),
                    }
                }
            }
        };

        self.settled = true;
        result
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        if !self.settled {
            self.shared
                .remove_waiter(&self.key, self.ticket, WorkerError::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_immediate_grants_saturate_pool() {
        let pool = WorkerPool::new(3);
        assert_eq!(pool.free_count(), 3);

        let mut leases = Vec::new();
        for key in ["a", "b", "c"] {
            let mut wait = task::spawn(pool.wait_for_available(key, None));
            leases.push(assert_ready!(wait.poll()).unwrap());
        }

        assert_eq!(pool.free_count(), 0);
        let mut ids: Vec<usize> = leases.iter().map(WorkerLease::id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test]
    async fn test_dropped_lease_goes_to_next_waiter() {
        let pool = WorkerPool::new(1);
        let lease = pool.wait_for_available("a", None).await.unwrap();

        let mut waiting = task::spawn(pool.wait_for_available("b", None));
        assert_pending!(waiting.poll());
        assert_eq!(pool.queued(), 1);

        drop(lease);
        assert!(waiting.is_woken());
        let lease = assert_ready!(waiting.poll()).unwrap();
        assert_eq!(lease.id(), 0);
        assert_eq!(pool.free_count(), 0);

        drop(lease);
        assert_eq!(pool.free_count(), 1);
    }

    #[tokio::test]
    async fn test_fifo_order_between_waiters() {
        let pool = WorkerPool::new(1);
        let lease = pool.wait_for_available("holder", None).await.unwrap();

        let mut first = task::spawn(pool.wait_for_available("first", None));
        let mut second = task::spawn(pool.wait_for_available("second", None));
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        drop(lease);
        assert_pending!(second.poll());
        let granted = assert_ready!(first.poll()).unwrap();

        drop(granted);
        assert_ready!(second.poll()).unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_wait_is_never_granted() {
        let pool = WorkerPool::new(1);
        let lease = pool.wait_for_available("holder", None).await.unwrap();

        let cancel = CancellationToken::new();
        let mut cancelled = task::spawn(pool.wait_for_available("k1", Some(cancel.clone())));
        let mut other = task::spawn(pool.wait_for_available("k2", None));
        assert_pending!(cancelled.poll());
        assert_pending!(other.poll());

        // Cancel and free the worker in the same tick
        cancel.cancel();
        drop(lease);

        assert!(assert_ready!(cancelled.poll()).unwrap_err().is_cancellation());
        let granted = assert_ready!(other.poll()).unwrap();
        assert_eq!(granted.id(), 0);
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test]
    async fn test_grant_followed_by_cancel_is_not_delivered() {
        let pool = WorkerPool::new(1);
        let lease = pool.wait_for_available("holder", None).await.unwrap();

        let cancel = CancellationToken::new();
        let mut waiting = task::spawn(pool.wait_for_available("k", Some(cancel.clone())));
        assert_pending!(waiting.poll());

        // The worker is sent before the token fires, but the waiter sees both
        drop(lease);
        assert_eq!(pool.queued(), 0);
        cancel.cancel();

        assert!(assert_ready!(waiting.poll()).unwrap_err().is_cancellation());
        assert_eq!(pool.free_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_queued() {
        let pool = WorkerPool::new(1);
        let _lease = pool.wait_for_available("holder", None).await.unwrap();

        let cancel = CancellationToken::new();
        let mut waiting = task::spawn(pool.wait_for_available("k", Some(cancel.clone())));
        assert_pending!(waiting.poll());
        assert!(pool.has_pending("k"));

        cancel.cancel();
        assert!(assert_ready!(waiting.poll()).unwrap_err().is_cancellation());
        assert!(!pool.has_pending("k"));
    }

    #[tokio::test]
    async fn test_same_key_replaces_previous_wait() {
        let pool = WorkerPool::new(1);
        let lease = pool.wait_for_available("holder", None).await.unwrap();

        let mut first = task::spawn(pool.wait_for_available("doc", None));
        assert_pending!(first.poll());
        let mut second = task::spawn(pool.wait_for_available("doc", None));
        assert_pending!(second.poll());

        assert!(assert_ready!(first.poll()).unwrap_err().is_replaced());
        assert_eq!(pool.queued(), 1);

        drop(lease);
        assert_ready!(second.poll()).unwrap();
    }

    #[tokio::test]
    async fn test_dropped_wait_leaves_queue() {
        let pool = WorkerPool::new(1);
        let lease = pool.wait_for_available("holder", None).await.unwrap();

        let mut abandoned = task::spawn(pool.wait_for_available("gone", None));
        assert_pending!(abandoned.poll());
        assert_eq!(pool.queued(), 1);
        drop(abandoned);
        assert_eq!(pool.queued(), 0);

        drop(lease);
        assert_eq!(pool.free_count(), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_token_on_saturated_pool() {
        let pool = WorkerPool::new(1);
        let _lease = pool.wait_for_available("holder", None).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pool
            .wait_for_available("late", Some(cancel))
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(pool.queued(), 0);
    }

    #[test]
    fn test_zero_size_pool_has_one_worker() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
    }
}
