//! Identifier and tier types shared by the pool, the scheduler and the network layer
//!
//! Identifiers are transparent newtypes so that a client id can never be passed
//! where a task id is expected.

use std::fmt;

/// Monotonically increasing id assigned to each primary connection by the acceptor
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ClientId(u64);

/// Pool-assigned sequence number of a worker task (one per pool slot, not per connection)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TaskId(u64);

/// Handle of an adaptive side-channel connection owned by the side-channel listener
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SideChannelId(u64);

macro_rules! id_impls {
    ($name:ident, $prefix:literal) => {
        impl $name {
            /// Wrap a raw id
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Raw numeric value
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

id_impls!(ClientId, "ClientId");
id_impls!(TaskId, "TaskId");
id_impls!(SideChannelId, "SideChannelId");

/// Priority class a client is assigned to from its rank in the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Ranks below the high cutoff
    High,
    /// Ranks between the high and medium cutoffs
    Medium,
    /// Everything else, including unregistered clients
    Low,
}

impl Tier {
    /// All tiers in round-robin order
    pub const ALL: [Tier; 3] = [Tier::High, Tier::Medium, Tier::Low];

    /// Position of the tier in per-tier arrays
    pub const fn index(self) -> usize {
        match self {
            Tier::High => 0,
            Tier::Medium => 1,
            Tier::Low => 2,
        }
    }

    /// Next tier in round-robin order, wrapping Low back to High
    pub const fn next(self) -> Tier {
        match self {
            Tier::High => Tier::Medium,
            Tier::Medium => Tier::Low,
            Tier::Low => Tier::High,
        }
    }

    /// Lowercase label used in logs and metric labels
    pub const fn as_str(self) -> &'static str {
        match self {
            Tier::High => "high",
            Tier::Medium => "medium",
            Tier::Low => "low",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_round_robin_wraps() {
        assert_eq!(Tier::High.next(), Tier::Medium);
        assert_eq!(Tier::Medium.next(), Tier::Low);
        assert_eq!(Tier::Low.next(), Tier::High);
        for (i, tier) in Tier::ALL.iter().enumerate() {
            assert_eq!(tier.index(), i);
        }
    }

    #[test]
    fn test_id_display_and_debug() {
        let id = ClientId::new(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!(format!("{:?}", id), "ClientId(42)");
        assert_eq!(TaskId::from(7).get(), 7);
    }
}
