//! Adaptive scheduling
//!
//! The [`PriorityRegistry`] ranks clients by their reported pan speed and the
//! [`RoundCoordinator`] releases one tier of that ranking per round.

pub mod coordinator;
pub mod registry;

pub use coordinator::{Participation, RoundCoordinator, RoundSnapshot};
pub use registry::{ClientPriority, PriorityRegistry, TierCutoffs};
