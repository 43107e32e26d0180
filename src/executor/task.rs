//! Worker task slots
//!
//! A [`WorkerTask`] belongs to a pool slot, not to a connection: the same task
//! (and its OS thread) is handed a new [`Assignment`] every time it leaves the
//! cached state.

use crate::core::types::{ClientId, TaskId};
use parking_lot::{Condvar, Mutex};
use std::time::Instant;

/// A connection handed to the pool for serving
#[derive(Debug)]
pub struct Assignment<C> {
    /// Id the acceptor gave this client
    pub client_id: ClientId,
    /// The connection itself; dropping it closes it
    pub connection: C,
    /// Printable peer address
    pub peer: String,
}

impl<C> Assignment<C> {
    /// Bundle a connection with its client id and peer address
    pub fn new(client_id: ClientId, connection: C, peer: impl Into<String>) -> Self {
        Self {
            client_id,
            connection,
            peer: peer.into(),
        }
    }
}

/// Lifecycle of a worker task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Serving (or about to serve) an assignment
    Active,
    /// Idle in the pool's cache, waiting for reuse
    Cached,
    /// Exited or exiting; waiting to be joined
    Stopped,
}

pub(crate) struct TaskSlot<C> {
    pub(crate) state: TaskState,
    pub(crate) assignment: Option<Assignment<C>>,
}

/// One pool slot: its current assignment plus a private wake signal
pub(crate) struct WorkerTask<C> {
    id: TaskId,
    slot: Mutex<TaskSlot<C>>,
    wake: Condvar,
}

/// Outcome of waiting in the cached state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleOutcome {
    /// A new assignment was installed
    Reassigned,
    /// The idle deadline passed with no reassignment
    TimedOut,
    /// The pool is shutting down
    Shutdown,
}

impl<C> WorkerTask<C> {
    /// Create an active task that will serve `assignment` first
    pub(crate) fn new(id: TaskId, assignment: Assignment<C>) -> Self {
        Self {
            id,
            slot: Mutex::new(TaskSlot {
                state: TaskState::Active,
                assignment: Some(assignment),
            }),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        self.slot.lock().state
    }

    /// Take the pending assignment, if any
    pub(crate) fn take_assignment(&self) -> Option<Assignment<C>> {
        self.slot.lock().assignment.take()
    }

    /// Install a new assignment on a cached task and wake its thread.
    ///
    /// Caller holds the pool lock and has already removed the task from the cache.
    pub(crate) fn assign(&self, assignment: Assignment<C>) {
        let mut slot = self.slot.lock();
        debug_assert_eq!(slot.state, TaskState::Cached);
        slot.assignment = Some(assignment);
        slot.state = TaskState::Active;
        self.wake.notify_one();
    }

    /// Move to `state`; caller holds the pool lock
    pub(crate) fn set_state(&self, state: TaskState) {
        self.slot.lock().state = state;
    }

    /// Wake the thread without assigning work (used on shutdown)
    pub(crate) fn notify(&self) {
        let _slot = self.slot.lock();
        self.wake.notify_all();
    }

    /// Block while cached until reassigned, the deadline passes, or `shutting_down` reports true.
    ///
    /// `shutting_down` is read under the slot lock; the pool sets its flag before
    /// calling [`WorkerTask::notify`], so a shutdown can not be missed.
    pub(crate) fn wait_idle<F>(&self, deadline: Instant, shutting_down: F) -> IdleOutcome
    where
        F: Fn() -> bool,
    {
        let mut slot = self.slot.lock();
        loop {
            if slot.state == TaskState::Active {
                return IdleOutcome::Reassigned;
            }
            if shutting_down() {
                return IdleOutcome::Shutdown;
            }
            if self.wake.wait_until(&mut slot, deadline).timed_out() {
                return if slot.state == TaskState::Active {
                    IdleOutcome::Reassigned
                } else {
                    IdleOutcome::TimedOut
                };
            }
        }
    }
}
