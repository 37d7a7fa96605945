//! Persisted snapshot of one player's quest state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One stored quest row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredQuestRow {
    /// Position in the player's quest list.
    pub sequence: u32,
    /// Category name.
    pub category: String,
    /// Index within the category.
    pub quest_index: u32,
    /// Progress made so far.
    pub advancement: u32,
    /// Amount required, fixed at draw time. Zero marks a corrupted row.
    pub required_amount: u32,
    /// Cached reward amount; absent in older saves.
    #[serde(default)]
    pub reward_amount: Option<f64>,
    /// Whether the quest is complete.
    pub achieved: bool,
    /// Chosen sub-objective for random-objective quests.
    #[serde(default)]
    pub selected_required: Option<u32>,
}

/// Everything persisted for one player.
///
/// Timestamps are Unix epoch milliseconds. Saves written before per-group
/// schedules carry a single legacy timestamp and reroll counter, which apply
/// to every group without an entry of its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredProgressionRecord {
    /// Single renewal timestamp of the legacy layout.
    pub legacy_timestamp: Option<i64>,
    /// Last renewal per group.
    pub timestamps_by_group: BTreeMap<String, i64>,
    /// Quests achieved in the current cycle.
    pub achieved_quests: u32,
    /// Quests achieved over the player's lifetime.
    pub total_achieved_quests: u32,
    /// Single reroll counter of the legacy layout.
    pub legacy_rerolls: Option<u32>,
    /// Rerolls used per group in the current cycle.
    pub rerolls_by_group: BTreeMap<String, u32>,
    /// Quest rows in sequence order.
    pub rows: Vec<StoredQuestRow>,
    /// Lifetime achievements per category.
    pub category_stats: BTreeMap<String, u32>,
}

impl StoredProgressionRecord {
    /// Renewal timestamp for `group`, falling back to the legacy timestamp.
    #[must_use]
    pub fn effective_timestamp(&self, group: &str) -> Option<i64> {
        self.timestamps_by_group
            .get(group)
            .copied()
            .or(self.legacy_timestamp)
    }

    /// Reroll counter for `group`, falling back to the legacy counter.
    #[must_use]
    pub fn effective_rerolls(&self, group: &str) -> u32 {
        self.rerolls_by_group
            .get(group)
            .copied()
            .or(self.legacy_rerolls)
            .unwrap_or(0)
    }

    /// Whether the record was written in the legacy single-timestamp layout.
    #[must_use]
    pub fn is_legacy_layout(&self) -> bool {
        self.timestamps_by_group.is_empty() && self.legacy_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_fallback() {
        let mut record = StoredProgressionRecord {
            legacy_timestamp: Some(1_000),
            legacy_rerolls: Some(2),
            ..StoredProgressionRecord::default()
        };
        assert!(record.is_legacy_layout());
        assert_eq!(record.effective_timestamp("daily"), Some(1_000));
        assert_eq!(record.effective_rerolls("daily"), 2);

        record.timestamps_by_group.insert("daily".to_string(), 5_000);
        record.rerolls_by_group.insert("daily".to_string(), 0);
        assert!(!record.is_legacy_layout());
        assert_eq!(record.effective_timestamp("daily"), Some(5_000));
        assert_eq!(record.effective_timestamp("weekly"), Some(1_000));
        assert_eq!(record.effective_rerolls("daily"), 0);
    }

    #[test]
    fn test_missing_fields_default() {
        let record: StoredProgressionRecord =
            serde_json::from_str(r#"{"achieved_quests": 1, "rows": []}"#).expect("valid json");
        assert_eq!(record.achieved_quests, 1);
        assert_eq!(record.effective_timestamp("any"), None);
        assert_eq!(record.effective_rerolls("any"), 0);
    }
}
