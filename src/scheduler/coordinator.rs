//! Round coordinator
//!
//! A barrier over every adaptive connection. Each participant checks in once per
//! round (by asking to serve a request) or leaves. When everyone expected has
//! arrived, the next non-empty tier in High → Medium → Low order is released
//! and exactly its waiters proceed, one request each.
//!
//! Releases are numbered per tier. A caller remembers the release number of its
//! tier when it checks in and proceeds once a later release has been published
//! on that tier's queue, so a stale release never lets a client through twice.

use crate::core::error::SchedulerError;
use crate::core::types::{ClientId, Tier};
use crate::scheduler::registry::PriorityRegistry;
use crate::system::metrics::Metrics;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Point-in-time view of the round state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundSnapshot {
    /// Participants the current round waits for
    pub expected: usize,
    /// Participants that have checked in this round
    pub checked_in: usize,
    /// Waiters per tier, indexed by [`Tier::index`]
    pub pending: [usize; 3],
    /// Where the next release scan starts
    pub next_tier: Tier,
    /// Most recently released tier
    pub active_tier: Option<Tier>,
    /// Releases so far
    pub rounds: u64,
}

impl RoundSnapshot {
    /// Waiters in `tier`
    pub fn pending_in(&self, tier: Tier) -> usize {
        self.pending[tier.index()]
    }
}

struct RoundState {
    expected: usize,
    checked_in: usize,
    pending: [usize; 3],
    next_tier: Tier,
    active_tier: Option<Tier>,
    releases: [u64; 3],
    rounds: u64,
}

impl RoundState {
    fn new() -> Self {
        Self {
            expected: 0,
            checked_in: 0,
            pending: [0; 3],
            next_tier: Tier::High,
            active_tier: None,
            releases: [0; 3],
            rounds: 0,
        }
    }

    /// Pick and open the next tier if the round is complete.
    ///
    /// Returns the released tier and its new release number.
    fn try_release(&mut self) -> Option<(Tier, u64)> {
        if self.checked_in < self.expected {
            return None;
        }

        for _ in 0..Tier::ALL.len() {
            let tier = self.next_tier;
            self.next_tier = tier.next();

            let waiting = self.pending[tier.index()];
            if waiting == 0 {
                continue;
            }

            self.checked_in = 0;
            self.expected = waiting;
            self.pending[tier.index()] = 0;
            self.active_tier = Some(tier);
            self.releases[tier.index()] += 1;
            self.rounds += 1;
            return Some((tier, self.releases[tier.index()]));
        }

        None
    }
}

/// Wait queue for one tier
struct TierQueue {
    published: Mutex<u64>,
    signal: Condvar,
}

impl TierQueue {
    fn new() -> Self {
        Self {
            published: Mutex::new(0),
            signal: Condvar::new(),
        }
    }

    fn publish(&self, release: u64) {
        let mut published = self.published.lock();
        if release > *published {
            *published = release;
        }
        self.signal.notify_all();
    }

    fn wake_all(&self) {
        let _published = self.published.lock();
        self.signal.notify_all();
    }

    /// Block until a release newer than `ticket` is published. False on shutdown.
    fn wait_past(&self, ticket: u64, shutdown: &AtomicBool) -> bool {
        let mut published = self.published.lock();
        loop {
            if *published > ticket {
                return true;
            }
            if shutdown.load(Ordering::Acquire) {
                return false;
            }
            self.signal.wait(&mut published);
        }
    }
}

/// Barrier that releases one priority tier per round
pub struct RoundCoordinator {
    registry: Arc<PriorityRegistry>,
    metrics: Arc<Metrics>,
    state: Mutex<RoundState>,
    queues: [TierQueue; 3],
    shutdown: AtomicBool,
}

impl RoundCoordinator {
    /// Create a coordinator that ranks callers through `registry`
    pub fn new(registry: Arc<PriorityRegistry>, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            metrics,
            state: Mutex::new(RoundState::new()),
            queues: [TierQueue::new(), TierQueue::new(), TierQueue::new()],
            shutdown: AtomicBool::new(false),
        }
    }

    /// Register one more round participant
    pub fn expect_me(&self) {
        let mut state = self.state.lock();
        state.expected += 1;
        trace!("Round: expecting {} participants", state.expected);
    }

    /// Withdraw a participant; completes the round if it was the last straggler
    pub fn unexpect_me(&self) {
        let released = {
            let mut state = self.state.lock();
            if state.expected == 0 {
                warn!("Round: participant left with none expected");
            } else {
                state.expected -= 1;
            }
            state.try_release()
        };
        self.announce(released);
    }

    /// Check in for the current round and block until the caller's tier is released.
    ///
    /// Returns the tier the caller was scheduled in, or
    /// [`SchedulerError::ShuttingDown`] if shutdown interrupts the wait.
    pub fn schedule_me(&self, client_id: ClientId) -> Result<Tier, SchedulerError> {
        if self.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }

        let (rank, tier) = self.registry.placement(client_id);

        let (ticket, released) = {
            let mut state = self.state.lock();
            state.checked_in += 1;
            state.pending[tier.index()] += 1;
            let ticket = state.releases[tier.index()];
            (ticket, state.try_release())
        };
        trace!("Round: client {} checked in at rank {} ({})", client_id, rank, tier);
        self.announce(released);

        if self.queues[tier.index()].wait_past(ticket, &self.shutdown) {
            Ok(tier)
        } else {
            debug!("Round: client {} cancelled by shutdown", client_id);
            Err(SchedulerError::ShuttingDown)
        }
    }

    /// Join the round for the lifetime of the returned guard
    pub fn participate(&self) -> Participation<'_> {
        self.expect_me();
        Participation { coordinator: self }
    }

    /// Cancel every pending and future [`RoundCoordinator::schedule_me`]
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Round: shutting down, waking all tiers");
        for queue in &self.queues {
            queue.wake_all();
        }
    }

    /// Whether [`RoundCoordinator::shutdown`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Copy of the round counters
    pub fn snapshot(&self) -> RoundSnapshot {
        let state = self.state.lock();
        RoundSnapshot {
            expected: state.expected,
            checked_in: state.checked_in,
            pending: state.pending,
            next_tier: state.next_tier,
            active_tier: state.active_tier,
            rounds: state.rounds,
        }
    }

    // Broadcast outside the coordinator lock
    fn announce(&self, released: Option<(Tier, u64)>) {
        if let Some((tier, release)) = released {
            debug!("Round: releasing {} tier (release {})", tier, release);
            self.metrics.record_release(tier);
            self.queues[tier.index()].publish(release);
        }
    }
}

/// Round participation held by one adaptive connection
///
/// Dropping the guard withdraws the participant on every exit path.
pub struct Participation<'a> {
    coordinator: &'a RoundCoordinator,
}

impl Participation<'_> {
    /// See [`RoundCoordinator::schedule_me`]
    pub fn schedule(&self, client_id: ClientId) -> Result<Tier, SchedulerError> {
        self.coordinator.schedule_me(client_id)
    }
}

impl Drop for Participation<'_> {
    fn drop(&mut self) {
        self.coordinator.unexpect_me();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::SchedulerConfig;
    use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    const SETTLE: Duration = Duration::from_millis(50);
    const PATIENCE: Duration = Duration::from_secs(5);

    /// Ten clients with speeds 1..=10: clients 1-2 High, 3-5 Medium, 6-10 Low
    fn setup() -> Arc<RoundCoordinator> {
        let registry = Arc::new(PriorityRegistry::new(SchedulerConfig::default()));
        for client in 1..=10 {
            registry.upsert(ClientId::new(client), client as i64);
        }
        let metrics = Arc::new(Metrics::new().unwrap());
        Arc::new(RoundCoordinator::new(registry, metrics))
    }

    type Waiter = (JoinHandle<()>, Receiver<Result<Tier, SchedulerError>>);

    fn spawn_schedule(coordinator: &Arc<RoundCoordinator>, client: u64) -> Waiter {
        let coordinator = Arc::clone(coordinator);
        let (tx, rx) = unbounded();
        let handle = thread::spawn(move || {
            let _ = tx.send(coordinator.schedule_me(ClientId::new(client)));
        });
        (handle, rx)
    }

    fn wait_until<F: Fn(&RoundSnapshot) -> bool>(coordinator: &RoundCoordinator, done: F) {
        let deadline = std::time::Instant::now() + PATIENCE;
        while !done(&coordinator.snapshot()) {
            assert!(std::time::Instant::now() < deadline, "round state never settled");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn assert_blocked(waiter: &Waiter) {
        assert_eq!(waiter.1.recv_timeout(SETTLE), Err(RecvTimeoutError::Timeout));
    }

    fn released(waiter: Waiter) -> Result<Tier, SchedulerError> {
        let result = waiter.1.recv_timeout(PATIENCE).unwrap();
        waiter.0.join().unwrap();
        result
    }

    #[test]
    fn test_straggler_leaving_releases_round() {
        let coordinator = setup();
        for _ in 0..3 {
            coordinator.expect_me();
        }

        let first = spawn_schedule(&coordinator, 1);
        let second = spawn_schedule(&coordinator, 2);
        wait_until(&coordinator, |s| s.checked_in == 2);
        assert_blocked(&first);
        assert_eq!(coordinator.snapshot().pending_in(Tier::High), 2);

        // The medium-tier participant disconnects without checking in
        coordinator.unexpect_me();

        assert_eq!(released(first), Ok(Tier::High));
        assert_eq!(released(second), Ok(Tier::High));

        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.active_tier, Some(Tier::High));
        assert_eq!(snapshot.pending_in(Tier::High), 0);
        assert_eq!(snapshot.checked_in, 0);
        assert_eq!(snapshot.expected, 2);
        assert_eq!(snapshot.next_tier, Tier::Medium);
    }

    #[test]
    fn test_single_participant_releases_itself() {
        let coordinator = setup();
        let guard = coordinator.participate();
        assert_eq!(guard.schedule(ClientId::new(7)), Ok(Tier::Low));
        assert_eq!(guard.schedule(ClientId::new(7)), Ok(Tier::Low));
        assert_eq!(coordinator.snapshot().rounds, 2);
        drop(guard);
        assert_eq!(coordinator.snapshot().expected, 0);
    }

    #[test]
    fn test_unregistered_client_scheduled_low() {
        let coordinator = setup();
        let _guard = coordinator.participate();
        assert_eq!(coordinator.schedule_me(ClientId::new(999)), Ok(Tier::Low));
    }

    #[test]
    fn test_empty_tiers_are_skipped() {
        let coordinator = setup();
        coordinator.expect_me();
        coordinator.expect_me();

        let low = spawn_schedule(&coordinator, 9);
        wait_until(&coordinator, |s| s.checked_in == 1);
        let medium = spawn_schedule(&coordinator, 4);

        // High is empty; the scan starting at High skips it and opens Medium
        assert_eq!(released(medium), Ok(Tier::Medium));
        assert_blocked(&low);
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.active_tier, Some(Tier::Medium));
        assert_eq!(snapshot.next_tier, Tier::Low);
        assert_eq!(snapshot.expected, 1);

        // The medium client comes back for another request; Low goes next
        let medium_again = spawn_schedule(&coordinator, 4);
        assert_eq!(released(low), Ok(Tier::Low));
        assert_blocked(&medium_again);

        // The low client leaves; the round completes and Medium is released again
        coordinator.unexpect_me();
        assert_eq!(released(medium_again), Ok(Tier::Medium));
    }

    #[test]
    fn test_every_tier_released_within_three_rounds() {
        let coordinator = setup();
        let clients = [8u64, 4, 1];
        for _ in clients {
            coordinator.expect_me();
        }
        let mut waiters: Vec<Waiter> = clients.iter().map(|&c| spawn_schedule(&coordinator, c)).collect();

        // Each released client leaves, completing its single-member round
        for tier in [Tier::High, Tier::Medium, Tier::Low] {
            let waiter = waiters.pop().unwrap();
            for other in &waiters {
                assert_blocked(other);
            }
            assert_eq!(released(waiter), Ok(tier));
            coordinator.unexpect_me();
        }

        assert_eq!(coordinator.snapshot().rounds, 3);
    }

    #[test]
    fn test_stale_release_does_not_pass_twice() {
        let coordinator = setup();
        coordinator.expect_me();
        coordinator.expect_me();

        let high = spawn_schedule(&coordinator, 1);
        wait_until(&coordinator, |s| s.checked_in == 1);
        let low = spawn_schedule(&coordinator, 10);

        assert_eq!(released(high), Ok(Tier::High));
        assert_eq!(coordinator.snapshot().active_tier, Some(Tier::High));

        // High is still the active tier, but the next request needs a fresh round
        let high_again = spawn_schedule(&coordinator, 1);
        assert_eq!(released(low), Ok(Tier::Low));
        assert_blocked(&high_again);

        coordinator.unexpect_me();
        assert_eq!(released(high_again), Ok(Tier::High));
    }

    #[test]
    fn test_shutdown_cancels_waiters() {
        let coordinator = setup();
        for _ in 0..2 {
            coordinator.expect_me();
        }
        let waiter = spawn_schedule(&coordinator, 3);
        wait_until(&coordinator, |s| s.checked_in == 1);
        assert_blocked(&waiter);

        coordinator.shutdown();
        assert_eq!(released(waiter), Err(SchedulerError::ShuttingDown));
        assert_eq!(
            coordinator.schedule_me(ClientId::new(3)),
            Err(SchedulerError::ShuttingDown)
        );
        // Second shutdown is a no-op
        coordinator.shutdown();
    }

    #[test]
    fn test_unexpect_without_participants_saturates() {
        let coordinator = setup();
        coordinator.unexpect_me();
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.expected, 0);
        assert_eq!(snapshot.rounds, 0);
    }

    #[test]
    fn test_releases_are_counted_in_metrics() {
        let coordinator = setup();
        let guard = coordinator.participate();
        guard.schedule(ClientId::new(1)).unwrap();
        guard.schedule(ClientId::new(1)).unwrap();
        let text = coordinator.metrics.render().unwrap();
        assert!(text.contains("tfs_rounds_released_total{tier=\"high\"} 2"));
    }

    #[test]
    fn test_concurrent_rounds_hold_invariants() {
        let coordinator = setup();
        let clients: Vec<u64> = (1..=10).collect();
        let rounds_per_client = 20;

        let handles: Vec<_> = clients
            .iter()
            .map(|&client| {
                let coordinator = Arc::clone(&coordinator);
                coordinator.expect_me();
                thread::spawn(move || {
                    for _ in 0..rounds_per_client {
                        coordinator.schedule_me(ClientId::new(client)).unwrap();
                        let snapshot = coordinator.snapshot();
                        assert!(snapshot.checked_in <= snapshot.expected);
                        assert!(snapshot.rounds > 0);
                    }
                    coordinator.unexpect_me();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.expected, 0);
        assert_eq!(snapshot.checked_in, 0);
    }
}
