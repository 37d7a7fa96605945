//! Layout versions of persisted progression.
//!
//! A major bump changes the layout; readers upgrade older majors and refuse
//! newer ones.

use serde::{Deserialize, Serialize};
use std::fmt;

/// `major.minor.patch` of a persisted progression layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Layout generation
    pub major: u16,
    /// Added optional fields
    pub minor: u16,
    /// Fixes that change no fields
    pub patch: u16,
}

impl SchemaVersion {
    /// A version from its three parts.
    #[must_use]
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Single timestamp and single reroll counter per player.
    pub const LEGACY_PROGRESSION: Self = Self::new(1, 0, 0);

    /// Per-group timestamps and reroll counters.
    pub const PROGRESSION: Self = Self::new(2, 0, 0);

    /// Packs the version into one integer for storage.
    #[must_use]
    pub const fn to_packed(self) -> u32 {
        ((self.major as u32) << 16) | ((self.minor as u32) << 8) | self.patch as u32
    }

    /// Unpacks a version stored with [`Self::to_packed`].
    #[must_use]
    pub const fn from_packed(value: u32) -> Self {
        Self::new(
            (value >> 16) as u16,
            ((value >> 8) & 0xFF) as u16,
            (value & 0xFF) as u16,
        )
    }

    /// Whether a reader at this version understands data written at
    /// `other` as is: same layout generation, no unknown optional fields.
    #[must_use]
    pub const fn is_compatible_with(&self, other: &Self) -> bool {
        self.major == other.major && self.minor >= other.minor
    }

    /// Checks whether data written at `older` can be upgraded to this version.
    #[must_use]
    pub const fn can_migrate_from(&self, older: &Self) -> bool {
        older.major < self.major || self.is_compatible_with(older)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
