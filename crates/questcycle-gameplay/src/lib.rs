//! # QuestCycle Gameplay
//!
//! Everything that touches a player's quests:
//! - Per-player quest state and its persisted form
//! - The quest catalog, quest selection and host-side hooks
//! - Reconciliation of stored snapshots against the live catalog
//! - The active-quest registry and the per-group renewal scheduler

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod catalog;
pub mod hooks;
pub mod progression;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod selection;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::catalog::*;
    pub use crate::hooks::*;
    pub use crate::progression::*;
    pub use crate::reconcile::*;
    pub use crate::registry::*;
    pub use crate::scheduler::*;
    pub use crate::selection::*;
}

pub use prelude::*;
