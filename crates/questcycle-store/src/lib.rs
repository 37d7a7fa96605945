//! # QuestCycle Store
//!
//! Persistence of player progression snapshots:
//! - [`StoredProgressionRecord`], the backend-agnostic snapshot
//! - [`ProgressionBackend`] implementations for SQLite and JSON files
//! - [`ProgressionStore`], which runs backend calls on player-sharded workers

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod file;
pub mod record;
pub mod schema;
pub mod sqlite;
pub mod store;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::file::*;
    pub use crate::record::*;
    pub use crate::sqlite::*;
    pub use crate::store::*;
}

pub use prelude::*;
