//! # QuestCycle Schedule
//!
//! Time arithmetic for quest renewal:
//! - Compact interval strings (`1d12h`) and time-of-day strings (`3:30PM`)
//! - Timezone selection (IANA ids or the system zone)
//! - The anchored renewal calculator
//! - Category groups, each with its own schedule

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod calculator;
pub mod clock;
pub mod duration;
pub mod groups;
pub mod time_of_day;
pub mod zone;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::calculator::*;
    pub use crate::clock::*;
    pub use crate::duration::*;
    pub use crate::groups::*;
    pub use crate::time_of_day::*;
    pub use crate::zone::*;
}

pub use prelude::*;
