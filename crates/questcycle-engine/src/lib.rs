//! QuestCycle Engine - wires the quest components into a running system.
//!
//! This crate owns configuration loading, the start/stop lifecycle, the
//! reload sequence and the developer console used by the `questcycle` binary.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod console;
pub mod context;
pub mod reload;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::*;
    pub use crate::context::*;
    pub use crate::reload::*;
}

pub use prelude::*;
