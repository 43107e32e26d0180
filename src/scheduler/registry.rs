//! Priority registry
//!
//! A single array of clients kept sorted by reported pan speed. A client's
//! index in the array is its rank; two cutoff indices split the ranks into the
//! high, medium and low tiers. Among equal speeds the entry that reached that
//! speed first keeps the lower rank.

use crate::core::config::{SchedulerConfig, SpeedOrder};
use crate::core::error::{Error, Result};
use crate::core::types::{ClientId, SideChannelId, Tier};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// One registered client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPriority {
    /// Client the entry belongs to
    pub client_id: ClientId,
    /// Last reported speed, never below 1
    pub speed: u64,
    /// Side channel that reports this client's updates
    pub channel: Option<SideChannelId>,
}

/// Rank boundaries between tiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierCutoffs {
    /// Ranks below this are high priority
    pub high: usize,
    /// Ranks below this (and not high) are medium priority
    pub medium: usize,
}

impl TierCutoffs {
    /// Cutoffs for `n` registered clients: `high = ceil(n * high%)`,
    /// `medium = high + ceil(n * medium%)`, both clamped to `n`
    pub fn compute(n: usize, high_percent: u32, medium_percent: u32) -> Self {
        let high = ceil_percent(n, high_percent).min(n);
        let medium = (high + ceil_percent(n, medium_percent)).min(n);
        Self { high, medium }
    }

    /// Tier of a rank under these cutoffs
    pub fn tier_of(&self, rank: usize) -> Tier {
        if rank < self.high {
            Tier::High
        } else if rank < self.medium {
            Tier::Medium
        } else {
            Tier::Low
        }
    }
}

// Integer ceiling so that e.g. 5 * 20% is exactly 1
fn ceil_percent(n: usize, percent: u32) -> usize {
    (n * percent as usize).div_ceil(100)
}

/// Clamp a reported speed to the registry's lower bound of 1
pub fn clamp_speed(speed: i64) -> u64 {
    speed.max(1) as u64
}

impl SpeedOrder {
    /// Whether an entry of speed `existing` stays ahead of a client moving to `speed`
    fn keeps_precedence(self, existing: u64, speed: u64) -> bool {
        match self {
            SpeedOrder::Ascending => existing <= speed,
            SpeedOrder::Descending => existing >= speed,
        }
    }
}

struct RegistryState {
    entries: Vec<ClientPriority>,
    cutoffs: TierCutoffs,
}

impl RegistryState {
    fn position(&self, client_id: ClientId) -> Option<usize> {
        self.entries.iter().position(|e| e.client_id == client_id)
    }
}

/// Sorted client table plus tier cutoffs, shared by the side channel and the coordinator
pub struct PriorityRegistry {
    config: SchedulerConfig,
    state: Mutex<RegistryState>,
}

impl PriorityRegistry {
    /// Create an empty registry
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                entries: Vec::with_capacity(config.registry_growth),
                cutoffs: TierCutoffs::default(),
            }),
            config,
        }
    }

    /// Insert a client or move it to its new speed. Returns the client's rank afterwards.
    ///
    /// Inserting changes membership and recomputes the cutoffs; a speed-only
    /// update leaves them alone.
    pub fn upsert(&self, client_id: ClientId, speed: i64) -> usize {
        let speed = clamp_speed(speed);
        let order = self.config.speed_order;
        let mut state = self.state.lock();

        let (entry, inserted) = match state.position(client_id) {
            Some(index) if state.entries[index].speed == speed => return index,
            Some(index) => {
                let mut entry = state.entries.remove(index);
                entry.speed = speed;
                (entry, false)
            }
            None => {
                if state.entries.len() == state.entries.capacity() {
                    state.entries.reserve_exact(self.config.registry_growth.max(1));
                }
                let entry = ClientPriority {
                    client_id,
                    speed,
                    channel: None,
                };
                (entry, true)
            }
        };

        let rank = state
            .entries
            .partition_point(|e| order.keeps_precedence(e.speed, speed));
        state.entries.insert(rank, entry);

        if inserted {
            state.cutoffs = self.cutoffs_for(state.entries.len());
            debug!(
                "Registry: client {} joined at rank {} ({} clients, cutoffs {:?})",
                client_id,
                rank,
                state.entries.len(),
                state.cutoffs
            );
        } else {
            debug!("Registry: client {} moved to rank {} at speed {}", client_id, rank, speed);
        }
        rank
    }

    /// Remove a client. Absent clients are a logged no-op.
    ///
    /// Cutoffs are not recomputed; call [`PriorityRegistry::recompute_cutoffs`] afterwards.
    pub fn remove(&self, client_id: ClientId) -> Option<ClientPriority> {
        let mut state = self.state.lock();
        match state.position(client_id) {
            Some(index) => Some(state.entries.remove(index)),
            None => {
                warn!("Registry: attempted removal of unregistered client {}", client_id);
                None
            }
        }
    }

    /// Remove a client only if `channel` is still the side channel attached to it.
    ///
    /// A client that handshook again on a newer channel keeps its registration.
    pub fn remove_channel(&self, client_id: ClientId, channel: SideChannelId) -> Option<ClientPriority> {
        let mut state = self.state.lock();
        let index = state.position(client_id)?;
        if state.entries[index].channel != Some(channel) {
            debug!("Registry: client {} now reports on another channel, keeping it", client_id);
            return None;
        }
        Some(state.entries.remove(index))
    }

    /// Record the side channel that reports for a registered client
    pub fn attach_channel(&self, client_id: ClientId, channel: SideChannelId) -> Result<()> {
        let mut state = self.state.lock();
        let index = state
            .position(client_id)
            .ok_or(Error::RegistryInconsistency(client_id))?;
        state.entries[index].channel = Some(channel);
        Ok(())
    }

    /// Recompute the tier cutoffs from the current membership
    pub fn recompute_cutoffs(&self) -> TierCutoffs {
        let mut state = self.state.lock();
        state.cutoffs = self.cutoffs_for(state.entries.len());
        state.cutoffs
    }

    /// Rank of a client, or the registry size if it is not registered
    pub fn rank_of(&self, client_id: ClientId) -> usize {
        let state = self.state.lock();
        state.position(client_id).unwrap_or(state.entries.len())
    }

    /// Tier of a rank under the current cutoffs
    pub fn tier_of(&self, rank: usize) -> Tier {
        self.state.lock().cutoffs.tier_of(rank)
    }

    /// Rank and tier of a client, read under one lock
    pub fn placement(&self, client_id: ClientId) -> (usize, Tier) {
        let state = self.state.lock();
        let rank = state.position(client_id).unwrap_or(state.entries.len());
        (rank, state.cutoffs.tier_of(rank))
    }

    /// Current cutoffs
    pub fn cutoffs(&self) -> TierCutoffs {
        self.state.lock().cutoffs
    }

    /// Number of registered clients
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no client is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the sorted entries
    pub fn snapshot(&self) -> Vec<ClientPriority> {
        self.state.lock().entries.clone()
    }

    fn cutoffs_for(&self, n: usize) -> TierCutoffs {
        TierCutoffs::compute(n, self.config.high_percent, self.config.medium_percent)
    }
}
