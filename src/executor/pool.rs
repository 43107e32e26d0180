//! Cached worker-thread pool
//!
//! Each live worker owns one OS thread. A worker serves its assigned connection
//! to completion, then parks in the cache. A parked worker is either handed a
//! new connection by [`WorkerPool::submit`] or exits after the idle timeout.
//! Exited workers sit in the stopped list until the next `submit` or `shutdown`
//! joins them; there is no dedicated reaper thread.
//!
//! Lock order is always pool state first, then a task's slot.

use crate::core::config::PoolConfig;
use crate::core::error::PoolError;
use crate::core::types::TaskId;
use crate::executor::task::{Assignment, IdleOutcome, TaskState, WorkerTask};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Serves one connection on a worker thread.
///
/// `serve` runs until the session ends; returning (or dropping the connection)
/// closes it. Long-running sessions should poll [`WorkerContext::is_shutting_down`].
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Connection type carried by an [`Assignment`]
    type Connection: Send + 'static;

    /// Serve `assignment` to completion
    fn serve(&self, worker: &WorkerContext, assignment: Assignment<Self::Connection>);

    /// Called with fresh counters whenever workers are spawned, cached, retired or reaped.
    ///
    /// Runs under the pool lock and must not call back into the pool.
    fn pool_changed(&self, _stats: &PoolStats) {}
}

/// Cooperative shutdown flag shared by the pool and its workers
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    /// Create an untriggered signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag has been raised
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a handler sees of the worker it runs on
#[derive(Debug, Clone)]
pub struct WorkerContext {
    task_id: TaskId,
    shutdown: ShutdownSignal,
}

impl WorkerContext {
    /// Context for a handler running as task `task_id`
    pub fn new(task_id: TaskId, shutdown: ShutdownSignal) -> Self {
        Self { task_id, shutdown }
    }

    /// Id of the worker task
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Whether the pool has started shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }
}

/// Point-in-time view of the pool's bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks ever created
    pub total_created: u64,
    /// Live (active or cached) workers
    pub workers: usize,
    /// Workers parked in the cache
    pub cached: usize,
    /// Exited workers not yet joined
    pub stopped: usize,
    /// Submissions served by a cached worker
    pub reused: u64,
    /// Workers that exited on idle timeout
    pub expired: u64,
    /// Whether shutdown has begun
    pub shutting_down: bool,
}

struct Slot<C> {
    task: Arc<WorkerTask<C>>,
    handle: Option<JoinHandle<()>>,
}

struct PoolState<C> {
    total_created: u64,
    /// Live OS threads not yet joined
    workers: usize,
    /// Most recently idled last
    cached: Vec<TaskId>,
    stopped: Vec<TaskId>,
    slots: HashMap<TaskId, Slot<C>>,
    reused: u64,
    expired: u64,
    shutdown: bool,
}

impl<C> PoolState<C> {
    fn new() -> Self {
        Self {
            total_created: 0,
            workers: 0,
            cached: Vec::new(),
            stopped: Vec::new(),
            slots: HashMap::new(),
            reused: 0,
            expired: 0,
            shutdown: false,
        }
    }

    /// Move a live task to the stopped list. Returns false if it already left.
    fn retire(&mut self, task: &WorkerTask<C>) -> bool {
        if task.state() == TaskState::Stopped {
            return false;
        }
        task.set_state(TaskState::Stopped);
        self.cached.retain(|id| *id != task.id());
        self.stopped.push(task.id());
        self.workers -= 1;
        true
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            total_created: self.total_created,
            workers: self.workers,
            cached: self.cached.len(),
            stopped: self.stopped.len(),
            reused: self.reused,
            expired: self.expired,
            shutting_down: self.shutdown,
        }
    }

    /// Join and free every stopped task
    fn reclaim(&mut self) {
        if self.stopped.is_empty() {
            return;
        }
        let mut cleaned = 0;
        for id in std::mem::take(&mut self.stopped) {
            let Some(mut slot) = self.slots.remove(&id) else {
                continue;
            };
            if let Some(handle) = slot.handle.take() {
                if handle.join().is_err() {
                    error!("Worker-{} panicked during execution", id);
                }
            }
            cleaned += 1;
        }
        debug!("Executor: reclaimed {} stopped workers", cleaned);
    }
}

struct PoolShared<H: ConnectionHandler> {
    config: PoolConfig,
    handler: H,
    state: Mutex<PoolState<H::Connection>>,
    /// Signalled whenever `workers` drops
    drained: Condvar,
    shutdown: ShutdownSignal,
}

/// A bounded pool of long-lived worker threads that are reused across connections
pub struct WorkerPool<H: ConnectionHandler> {
    shared: Arc<PoolShared<H>>,
}

impl<H: ConnectionHandler> WorkerPool<H> {
    /// Create an empty pool; workers are spawned lazily by `submit`
    pub fn new(config: PoolConfig, handler: H) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                handler,
                state: Mutex::new(PoolState::new()),
                drained: Condvar::new(),
                shutdown: ShutdownSignal::new(),
            }),
        }
    }

    /// The handler every worker serves connections with
    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    /// Hand a connection to a cached worker, or spawn a new one.
    ///
    /// On error the assignment is dropped, which closes the connection.
    pub fn submit(&self, assignment: Assignment<H::Connection>) -> Result<TaskId, PoolError> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        let result = if state.shutdown {
            Err(PoolError::ShuttingDown)
        } else if let Some(id) = state.cached.pop() {
            match state.slots.get(&id) {
                Some(slot) => {
                    debug!("Executor: reusing worker-{} for client {}", id, assignment.client_id);
                    slot.task.assign(assignment);
                    state.reused += 1;
                    Ok(id)
                }
                None => {
                    error!("Executor: cached worker-{} has no slot", id);
                    self.spawn_worker(state, assignment)
                }
            }
        } else if state.workers >= self.shared.config.max_workers {
            Err(PoolError::AtCapacity {
                max_workers: self.shared.config.max_workers,
            })
        } else {
            self.spawn_worker(state, assignment)
        };
        state.reclaim();
        self.shared.handler.pool_changed(&state.stats());
        result
    }

    fn spawn_worker(
        &self,
        state: &mut PoolState<H::Connection>,
        assignment: Assignment<H::Connection>,
    ) -> Result<TaskId, PoolError> {
        let id = TaskId::new(state.total_created + 1);
        let task = Arc::new(WorkerTask::new(id, assignment));

        let shared = Arc::clone(&self.shared);
        let worker_task = Arc::clone(&task);
        let mut builder = thread::Builder::new().name(format!("worker-{}", id));
        if let Some(stack_size) = self.shared.config.worker_stack_size {
            builder = builder.stack_size(stack_size);
        }
        let handle = builder
            .spawn(move || run_worker(shared, worker_task))
            .map_err(|e| {
                warn!("Executor: failed to spawn worker-{}: {}", id, e);
                PoolError::SpawnFailure(e)
            })?;

        // Only counted once the thread exists
        state.total_created += 1;
        state.workers += 1;
        state.slots.insert(
            id,
            Slot {
                task,
                handle: Some(handle),
            },
        );
        debug!("Executor: spawned worker-{} ({} live)", id, state.workers);
        Ok(id)
    }

    /// Stop taking work, wake cached workers, wait for every worker to exit, then join them all.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if !state.shutdown {
            info!("Executor: shutting down {} workers", state.workers);
            state.shutdown = true;
            self.shared.shutdown.trigger();
        }

        for id in std::mem::take(&mut state.cached) {
            if let Some(slot) = state.slots.get(&id) {
                slot.task.notify();
            }
        }

        while state.workers > 0 {
            self.shared.drained.wait(&mut state);
        }
        state.reclaim();
        self.shared.handler.pool_changed(&state.stats());
    }

    /// Snapshot of the pool's counters
    pub fn stats(&self) -> PoolStats {
        self.shared.state.lock().stats()
    }

    /// Configured maximum number of live workers
    pub fn max_workers(&self) -> usize {
        self.shared.config.max_workers
    }
}

impl<H: ConnectionHandler> Drop for WorkerPool<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Outer loop of a worker thread
fn run_worker<H: ConnectionHandler>(shared: Arc<PoolShared<H>>, task: Arc<WorkerTask<H::Connection>>) {
    let context = WorkerContext::new(task.id(), shared.shutdown.clone());

    loop {
        if shared.shutdown.is_triggered() {
            // Dropping an unserved assignment closes its connection
            drop(task.take_assignment());
            exit_worker(&shared, &task);
            return;
        }

        if let Some(assignment) = task.take_assignment() {
            let client_id = assignment.client_id;
            debug!("Worker-{}: got client {} at {}", task.id(), client_id, assignment.peer);
            let served = panic::catch_unwind(AssertUnwindSafe(|| {
                shared.handler.serve(&context, assignment)
            }));
            if served.is_err() {
                error!("Worker-{}: session for client {} panicked", task.id(), client_id);
            }
        }

        if !park(&shared, &task) {
            return;
        }
    }
}

/// Cache the worker and wait for reuse. Returns false once the worker has retired.
fn park<H: ConnectionHandler>(shared: &PoolShared<H>, task: &WorkerTask<H::Connection>) -> bool {
    {
        let mut state = shared.state.lock();
        if state.shutdown {
            drop(state);
            exit_worker(shared, task);
            return false;
        }
        task.set_state(TaskState::Cached);
        state.cached.push(task.id());
        shared.handler.pool_changed(&state.stats());
    }

    let deadline = Instant::now() + shared.config.idle_timeout;
    debug!("Worker-{}: waiting for next job", task.id());
    let outcome = task.wait_idle(deadline, || shared.shutdown.is_triggered());
    if outcome == IdleOutcome::Reassigned {
        return true;
    }

    // A submit may have reassigned us between the wait and the pool lock
    let mut state = shared.state.lock();
    if task.state() == TaskState::Active {
        return true;
    }
    let timed_out = outcome == IdleOutcome::TimedOut;
    if timed_out {
        debug!("Worker-{}: idle timeout, marking self for removal", task.id());
    }
    if state.retire(task) {
        if timed_out {
            state.expired += 1;
        }
        shared.handler.pool_changed(&state.stats());
        shared.drained.notify_all();
    }
    false
}

fn exit_worker<H: ConnectionHandler>(shared: &PoolShared<H>, task: &WorkerTask<H::Connection>) {
    let mut state = shared.state.lock();
    if state.retire(task) {
        shared.handler.pool_changed(&state.stats());
        shared.drained.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ClientId;
    use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
    use std::time::Duration;

    /// Sessions last until their sender sends, is dropped, or the pool shuts down
    struct ScriptedHandler {
        served: Sender<(TaskId, ClientId)>,
        observed: Mutex<PoolStats>,
    }

    impl ConnectionHandler for ScriptedHandler {
        type Connection = Receiver<()>;

        fn serve(&self, worker: &WorkerContext, assignment: Assignment<Self::Connection>) {
            self.served.send((worker.task_id(), assignment.client_id)).unwrap();
            if assignment.peer == "panic" {
                panic!("scripted panic");
            }
            loop {
                match assignment.connection.recv_timeout(Duration::from_millis(5)) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) if worker.is_shutting_down() => return,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }

        fn pool_changed(&self, stats: &PoolStats) {
            *self.observed.lock() = *stats;
        }
    }

    fn pool(max_workers: usize, idle_timeout: Duration) -> (WorkerPool<ScriptedHandler>, Receiver<(TaskId, ClientId)>) {
        pool_with(PoolConfig {
            max_workers,
            idle_timeout,
            ..PoolConfig::default()
        })
    }

    fn pool_with(config: PoolConfig) -> (WorkerPool<ScriptedHandler>, Receiver<(TaskId, ClientId)>) {
        let (tx, rx) = channel::unbounded();
        let handler = ScriptedHandler {
            served: tx,
            observed: Mutex::new(PoolStats::default()),
        };
        (WorkerPool::new(config, handler), rx)
    }

    fn observed(pool: &WorkerPool<ScriptedHandler>) -> PoolStats {
        *pool.handler().observed.lock()
    }

    fn connection(client: u64, peer: &str) -> (Sender<()>, Assignment<Receiver<()>>) {
        let (tx, rx) = channel::bounded(1);
        (tx, Assignment::new(ClientId::new(client), rx, peer))
    }

    fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_submit_spawns_worker() {
        let (pool, served) = pool(4, Duration::from_secs(60));
        let (finish, assignment) = connection(1, "a");

        let id = pool.submit(assignment).unwrap();
        assert_eq!(served.recv_timeout(Duration::from_secs(5)).unwrap(), (id, ClientId::new(1)));
        assert_eq!(pool.stats().workers, 1);
        assert_eq!(pool.stats().total_created, 1);

        finish.send(()).unwrap();
        wait_for("worker to cache", || pool.stats().cached == 1);
        pool.shutdown();
    }

    #[test]
    fn test_at_capacity_then_reuse_cached_worker() {
        let (pool, served) = pool(1, Duration::from_secs(60));
        let (finish_a, a) = connection(1, "a");
        let (_finish_b, b) = connection(2, "b");

        let first = pool.submit(a).unwrap();
        served.recv_timeout(Duration::from_secs(5)).unwrap();

        let err = pool.submit(b).unwrap_err();
        assert!(matches!(err, PoolError::AtCapacity { max_workers: 1 }));

        finish_a.send(()).unwrap();
        wait_for("worker to cache", || pool.stats().cached == 1);

        let (finish_c, c) = connection(3, "c");
        let reused = pool.submit(c).unwrap();
        assert_eq!(reused, first);
        assert_eq!(served.recv_timeout(Duration::from_secs(5)).unwrap(), (first, ClientId::new(3)));

        let stats = pool.stats();
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.reused, 1);

        finish_c.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_most_recently_idled_worker_is_reused_first() {
        let (pool, served) = pool(2, Duration::from_secs(60));
        let (finish_a, a) = connection(1, "a");
        let (finish_b, b) = connection(2, "b");
        let first = pool.submit(a).unwrap();
        let second = pool.submit(b).unwrap();
        served.recv_timeout(Duration::from_secs(5)).unwrap();
        served.recv_timeout(Duration::from_secs(5)).unwrap();

        finish_a.send(()).unwrap();
        wait_for("first worker to cache", || pool.stats().cached == 1);
        finish_b.send(()).unwrap();
        wait_for("second worker to cache", || pool.stats().cached == 2);

        let (finish_c, c) = connection(3, "c");
        assert_eq!(pool.submit(c).unwrap(), second);
        assert_ne!(first, second);

        drop(finish_c);
        pool.shutdown();
    }

    #[test]
    fn test_idle_worker_expires_and_is_reclaimed_on_submit() {
        let (pool, served) = pool(2, Duration::from_millis(30));
        let (finish, a) = connection(1, "a");
        pool.submit(a).unwrap();
        served.recv_timeout(Duration::from_secs(5)).unwrap();
        finish.send(()).unwrap();

        wait_for("idle worker to expire", || pool.stats().workers == 0);
        let stats = pool.stats();
        assert_eq!(stats.cached, 0);
        assert_eq!(stats.stopped, 1);
        assert_eq!(stats.expired, 1);

        let (_finish_b, b) = connection(2, "b");
        let id = pool.submit(b).unwrap();
        assert_eq!(id, TaskId::new(2));
        let stats = pool.stats();
        assert_eq!(stats.stopped, 0);
        assert_eq!(stats.workers, 1);

        pool.shutdown();
    }

    #[test]
    fn test_idle_worker_is_reclaimed_on_shutdown() {
        let (pool, served) = pool(2, Duration::from_millis(20));
        let (finish, a) = connection(1, "a");
        pool.submit(a).unwrap();
        served.recv_timeout(Duration::from_secs(5)).unwrap();
        finish.send(()).unwrap();

        wait_for("idle worker to stop", || pool.stats().stopped == 1);
        pool.shutdown();
        let stats = pool.stats();
        assert_eq!(stats.stopped, 0);
        assert_eq!(stats.workers, 0);
    }

    #[test]
    fn test_shutdown_drains_active_and_cached_workers() {
        let (pool, served) = pool(4, Duration::from_secs(60));
        let (finish_a, a) = connection(1, "a");
        let (_held_b, b) = connection(2, "b");
        pool.submit(a).unwrap();
        pool.submit(b).unwrap();
        served.recv_timeout(Duration::from_secs(5)).unwrap();
        served.recv_timeout(Duration::from_secs(5)).unwrap();

        finish_a.send(()).unwrap();
        wait_for("one cached worker", || pool.stats().cached == 1);

        pool.shutdown();
        let stats = pool.stats();
        assert_eq!(stats.workers, 0);
        assert_eq!(stats.cached, 0);
        assert_eq!(stats.stopped, 0);
        assert!(stats.shutting_down);

        let (_finish_c, c) = connection(3, "c");
        assert!(matches!(pool.submit(c), Err(PoolError::ShuttingDown)));
    }

    #[test]
    fn test_shutdown_twice_is_noop() {
        let (pool, served) = pool(2, Duration::from_secs(60));
        let (finish, a) = connection(1, "a");
        pool.submit(a).unwrap();
        served.recv_timeout(Duration::from_secs(5)).unwrap();
        finish.send(()).unwrap();

        pool.shutdown();
        let first = pool.stats();
        pool.shutdown();
        assert_eq!(pool.stats(), first);
        assert_eq!(first.workers, 0);
    }

    #[test]
    fn test_panicking_session_keeps_worker_alive() {
        let (pool, served) = pool(1, Duration::from_secs(60));
        let (_finish, a) = connection(1, "panic");
        let id = pool.submit(a).unwrap();
        served.recv_timeout(Duration::from_secs(5)).unwrap();

        wait_for("worker to cache after panic", || pool.stats().cached == 1);
        let (finish_b, b) = connection(2, "b");
        assert_eq!(pool.submit(b).unwrap(), id);

        drop(finish_b);
        pool.shutdown();
    }

    #[test]
    fn test_live_workers_never_exceed_max() {
        let (pool, _served) = pool(3, Duration::from_secs(60));
        let mut held = Vec::new();
        let mut rejected = 0;
        for client in 0..10 {
            let (finish, assignment) = connection(client, "x");
            match pool.submit(assignment) {
                Ok(_) => held.push(finish),
                Err(PoolError::AtCapacity { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
            assert!(pool.stats().workers <= 3);
        }
        assert_eq!(held.len(), 3);
        assert_eq!(rejected, 7);

        drop(held);
        pool.shutdown();
    }

    // A stack far beyond the address space makes thread creation fail
    #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
    #[test]
    fn test_spawn_failure_leaves_counters_untouched() {
        let (pool, served) = pool_with(PoolConfig {
            max_workers: 2,
            worker_stack_size: Some(1 << 60),
            ..PoolConfig::default()
        });
        let (_finish, a) = connection(1, "a");

        assert!(matches!(pool.submit(a), Err(PoolError::SpawnFailure(_))));
        let stats = pool.stats();
        assert_eq!(stats.total_created, 0);
        assert_eq!(stats.workers, 0);
        assert!(served.try_recv().is_err());
        pool.shutdown();
    }

    #[test]
    fn test_handler_sees_cache_and_expiry() {
        let (pool, served) = pool(2, Duration::from_millis(30));
        let (finish, a) = connection(1, "a");
        pool.submit(a).unwrap();
        served.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(observed(&pool).workers, 1);

        finish.send(()).unwrap();
        wait_for("worker to cache", || observed(&pool).cached == 1);

        // No further submit: the expiry alone has to be reported
        wait_for("idle worker to expire", || observed(&pool).workers == 0);
        let seen = observed(&pool);
        assert_eq!(seen.cached, 0);
        assert_eq!(seen.expired, 1);

        pool.shutdown();
        assert_eq!(observed(&pool).stopped, 0);
    }
}
