//! # QuestCycle Common
//!
//! Shared types for every QuestCycle subsystem:
//! - Player and quest identifiers
//! - Persisted schema versions
//! - The error taxonomy (configuration, persistence, scheduling)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod ids;
pub mod version;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::*;
    pub use crate::ids::*;
    pub use crate::version::*;
}

pub use prelude::*;
