//! Error types for QuestCycle.
//!
//! Every component-local failure is translated into one of the kinds below
//! before it crosses a component boundary. Reconciliation mismatches are not
//! errors; they live with the reconciler as a regeneration cause.

use thiserror::Error;

/// Top-level error type for QuestCycle operations.
#[derive(Debug, Error)]
pub enum QuestCycleError {
    /// Invalid group, category, quest or schedule definition.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Connection, transaction or serialization failure in the store.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Degenerate or missing schedule settings for a group.
    #[error("Scheduling error: {0}")]
    Scheduling(#[from] SchedulingError),

    /// IO errors outside the store (config files, catalog files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`QuestCycleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`ConfigError`].
    Configuration,
    /// See [`PersistenceError`].
    Persistence,
    /// See [`SchedulingError`].
    Scheduling,
    /// Plain IO.
    Io,
}

impl QuestCycleError {
    /// Returns the kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::Scheduling(_) => ErrorKind::Scheduling,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A category was assigned to more than one group.
    #[error("Category '{category}' of group '{group}' is already assigned to group '{existing}'")]
    DuplicateCategory {
        /// Category name as written in the config
        category: String,
        /// Group that tried to claim it
        group: String,
        /// Group that claimed it first
        existing: String,
    },

    /// A group lists no categories.
    #[error("Group '{group}' has no categories defined")]
    EmptyGroup {
        /// Group name
        group: String,
    },

    /// A group names a category that is not configured.
    #[error("Group '{group}' references unknown category '{category}'")]
    UnknownCategory {
        /// Category name
        category: String,
        /// Group name
        group: String,
    },

    /// A configured category belongs to no group.
    #[error("Category '{category}' is not assigned to any group")]
    UnassignedCategory {
        /// Category name
        category: String,
    },

    /// No categories at all.
    #[error("No quests_per_category entries configured")]
    NoCategories,

    /// Unparsable time of day.
    #[error("Invalid time of day '{value}'")]
    InvalidTime {
        /// Raw value
        value: String,
    },

    /// Unknown timezone identifier.
    #[error("Invalid timezone '{value}'")]
    InvalidZone {
        /// Raw value
        value: String,
    },

    /// Unparsable or overflowing duration.
    #[error("Invalid interval '{value}'")]
    InvalidInterval {
        /// Raw value
        value: String,
    },

    /// Invalid quests_per_category entry.
    #[error("Invalid quest amount for category '{category}': {reason}")]
    InvalidQuestAmount {
        /// Category name
        category: String,
        /// Why the value was rejected
        reason: String,
    },

    /// A category has fewer quests than it must draw.
    #[error("Category '{category}' has {available} quests but draws {required}")]
    InsufficientQuests {
        /// Category name
        category: String,
        /// Quests defined
        available: usize,
        /// Quests drawn per renewal
        required: u32,
    },

    /// A quest names a type tag nobody registered.
    #[error("Quest {category}#{index} has unknown type '{tag}'")]
    UnknownQuestType {
        /// Category name
        category: String,
        /// Index within the category
        index: u32,
        /// Type tag
        tag: String,
    },

    /// A quest definition is malformed.
    #[error("Quest {category}#{index} is invalid: {reason}")]
    InvalidQuest {
        /// Category name
        category: String,
        /// Index within the category
        index: u32,
        /// Why the quest was rejected
        reason: String,
    },

    /// The file could not be parsed at all.
    #[error("Failed to parse {file}: {reason}")]
    Parse {
        /// File name or description
        file: String,
        /// Parser message
        reason: String,
    },
}

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The backing store could not be opened or reached.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A transaction failed and was rolled back.
    #[error("Transaction failed for player {player} (rolled back): {reason}")]
    Transaction {
        /// Player the transaction was for
        player: String,
        /// Underlying failure
        reason: String,
    },

    /// Stored data could not be decoded.
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// Encoding failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored schema is newer than this build understands.
    #[error("Schema version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Supported version
        expected: String,
        /// Found version
        found: String,
    },

    /// The persistence workers have been shut down.
    #[error("Persistence workers are not running")]
    WorkerUnavailable,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scheduling errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulingError {
    /// Interval is zero or negative.
    #[error("Group '{group}' has a non-positive renewal interval")]
    NonPositiveInterval {
        /// Group name
        group: String,
    },

    /// Schedule settings failed to parse.
    #[error("Group '{group}' has an invalid schedule: {source}")]
    InvalidSettings {
        /// Group name
        group: String,
        /// Parse failure
        #[source]
        source: ConfigError,
    },

    /// No runtime to schedule on.
    #[error("Scheduler runtime unavailable: {0}")]
    Runtime(String),
}

/// Result type alias for QuestCycle operations.
pub type QuestCycleResult<T> = Result<T, QuestCycleError>;

/// Result type alias for configuration parsing.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type alias for persistence operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;
