//! Per-player quest state.

use chrono::{DateTime, Utc};
use questcycle_common::QuestKey;
use questcycle_schedule::{CategoryGroup, GroupRegistry};
use questcycle_store::{StoredProgressionRecord, StoredQuestRow};
use std::collections::BTreeMap;

/// Lifecycle of a single quest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressionState {
    /// Freshly drawn, no progress.
    Drawn,
    /// Some progress, not complete.
    InProgress,
    /// Complete. Terminal until the quest is replaced.
    Achieved,
}

/// One quest's state for one player.
#[derive(Debug, Clone, PartialEq)]
pub struct Progression {
    required_amount: u32,
    reward_amount: Option<f64>,
    advancement: u32,
    achieved: bool,
    selected_required: Option<u32>,
}

impl Progression {
    /// A freshly drawn quest.
    #[must_use]
    pub fn new(
        required_amount: u32,
        reward_amount: Option<f64>,
        selected_required: Option<u32>,
    ) -> Self {
        Self {
            required_amount,
            reward_amount,
            advancement: 0,
            achieved: false,
            selected_required,
        }
    }

    /// A quest restored from storage.
    #[must_use]
    pub fn restored(
        required_amount: u32,
        reward_amount: Option<f64>,
        advancement: u32,
        achieved: bool,
        selected_required: Option<u32>,
    ) -> Self {
        Self {
            required_amount,
            reward_amount,
            advancement,
            achieved,
            selected_required,
        }
    }

    /// Amount required to complete the quest.
    #[must_use]
    pub fn required_amount(&self) -> u32 {
        self.required_amount
    }

    /// Reward amount fixed when the quest was drawn or restored.
    #[must_use]
    pub fn reward_amount(&self) -> Option<f64> {
        self.reward_amount
    }

    /// Progress so far.
    #[must_use]
    pub fn advancement(&self) -> u32 {
        self.advancement
    }

    /// Whether the quest is complete.
    #[must_use]
    pub fn is_achieved(&self) -> bool {
        self.achieved
    }

    /// Chosen sub-objective of a random-objective quest.
    #[must_use]
    pub fn selected_required(&self) -> Option<u32> {
        self.selected_required
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProgressionState {
        if self.achieved {
            ProgressionState::Achieved
        } else if self.advancement == 0 {
            ProgressionState::Drawn
        } else {
            ProgressionState::InProgress
        }
    }

    /// Adds progress. Returns `true` only on the call that completes the quest.
    pub fn advance(&mut self, amount: u32) -> bool {
        if self.achieved || amount == 0 {
            return false;
        }
        self.advancement = self.advancement.saturating_add(amount);
        if self.advancement >= self.required_amount {
            self.advancement = self.required_amount;
            self.achieved = true;
            return true;
        }
        false
    }
}

/// A quest held by a player.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveQuest {
    key: QuestKey,
    serial: u64,
    progression: Progression,
}

impl ActiveQuest {
    /// Creates an active quest. The serial is assigned when it joins a set.
    #[must_use]
    pub fn new(key: QuestKey, progression: Progression) -> Self {
        Self {
            key,
            serial: 0,
            progression,
        }
    }

    /// Catalog key.
    #[must_use]
    pub fn key(&self) -> &QuestKey {
        &self.key
    }

    /// Identifies this draw within its set; a replacement always gets a new
    /// serial even when the same quest is drawn again.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// The player's progression on this quest.
    #[must_use]
    pub fn progression(&self) -> &Progression {
        &self.progression
    }

    /// Mutable progression.
    pub fn progression_mut(&mut self) -> &mut Progression {
        &mut self.progression
    }
}

/// Lifetime counters that survive renewal and regeneration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifetimeTotals {
    /// Quests achieved over the player's lifetime.
    pub total_achieved_quests: u32,
    /// Lifetime achievements per category.
    pub achieved_by_category: BTreeMap<String, u32>,
}

/// Outcome of adding progress to a quest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    /// Progress after the call.
    pub advancement: u32,
    /// Amount required.
    pub required_amount: u32,
    /// Whether this call completed the quest.
    pub newly_achieved: bool,
}

/// All quests and counters of one player.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerQuestSet {
    quests: Vec<ActiveQuest>,
    achieved_quests: u32,
    totals: LifetimeTotals,
    renewed_at: BTreeMap<String, DateTime<Utc>>,
    rerolls: BTreeMap<String, u32>,
    next_serial: u64,
}

impl PlayerQuestSet {
    /// A fresh draw covering every group, renewed at `now`.
    #[must_use]
    pub fn fresh(
        draw: Vec<ActiveQuest>,
        groups: &GroupRegistry,
        totals: LifetimeTotals,
        now: DateTime<Utc>,
    ) -> Self {
        let mut set = Self {
            totals,
            ..Self::default()
        };
        set.replace_all(draw, groups, now);
        set
    }

    /// A set rebuilt from stored state.
    #[must_use]
    pub fn restored(
        quests: Vec<ActiveQuest>,
        achieved_quests: u32,
        totals: LifetimeTotals,
        renewed_at: BTreeMap<String, DateTime<Utc>>,
        rerolls: BTreeMap<String, u32>,
    ) -> Self {
        let mut set = Self {
            achieved_quests,
            totals,
            renewed_at,
            rerolls,
            ..Self::default()
        };
        set.quests = set.stamp_all(quests);
        set
    }

    /// Quests in display order.
    #[must_use]
    pub fn quests(&self) -> &[ActiveQuest] {
        &self.quests
    }

    /// Quest at `index`.
    #[must_use]
    pub fn quest(&self, index: usize) -> Option<&ActiveQuest> {
        self.quests.get(index)
    }

    /// Keys of all held quests.
    #[must_use]
    pub fn keys(&self) -> Vec<QuestKey> {
        self.quests.iter().map(|q| q.key.clone()).collect()
    }

    /// Quests achieved in the current cycle.
    #[must_use]
    pub fn achieved_quests(&self) -> u32 {
        self.achieved_quests
    }

    /// Lifetime counters.
    #[must_use]
    pub fn totals(&self) -> &LifetimeTotals {
        &self.totals
    }

    /// Last renewal of `group`.
    #[must_use]
    pub fn renewed_at(&self, group: &str) -> Option<DateTime<Utc>> {
        self.renewed_at.get(group).copied()
    }

    /// Rerolls used in `group` this cycle.
    #[must_use]
    pub fn rerolls(&self, group: &str) -> u32 {
        self.rerolls.get(group).copied().unwrap_or(0)
    }

    /// Adds progress to the quest at `index`.
    pub fn advance(&mut self, index: usize, amount: u32) -> Option<Advance> {
        let quest = self.quests.get_mut(index)?;
        let newly_achieved = quest.progression.advance(amount);
        let advance = Advance {
            advancement: quest.progression.advancement(),
            required_amount: quest.progression.required_amount(),
            newly_achieved,
        };

        if newly_achieved {
            let category = quest.key.category.clone();
            self.achieved_quests += 1;
            self.totals.total_achieved_quests += 1;
            *self.totals.achieved_by_category.entry(category).or_insert(0) += 1;
        }
        Some(advance)
    }

    /// Replaces this group's quests with `draw`, leaving other groups'
    /// quests untouched. The new quests take the place of the group's first
    /// quest, or go last when the group held none.
    pub fn replace_group(
        &mut self,
        group: &CategoryGroup,
        draw: Vec<ActiveQuest>,
        now: DateTime<Utc>,
    ) {
        let position = self
            .quests
            .iter()
            .position(|q| group.contains_category(&q.key.category));
        self.quests.retain(|q| !group.contains_category(&q.key.category));

        let at = position.unwrap_or(self.quests.len());
        let stamped = self.stamp_all(draw);
        self.quests.splice(at..at, stamped);

        self.renewed_at.insert(group.name().to_string(), now);
        self.rerolls.insert(group.name().to_string(), 0);
        self.recount_achieved();
    }

    /// Replaces every quest and resets every group's cycle.
    pub fn replace_all(
        &mut self,
        draw: Vec<ActiveQuest>,
        groups: &GroupRegistry,
        now: DateTime<Utc>,
    ) {
        self.quests = self.stamp_all(draw);
        for group in groups.groups() {
            self.renewed_at.insert(group.name().to_string(), now);
            self.rerolls.insert(group.name().to_string(), 0);
        }
        self.recount_achieved();
    }

    /// Swaps the quest at `index` for `quest` and counts a reroll against
    /// `group`. Returns the replaced quest.
    pub fn reroll(&mut self, index: usize, quest: ActiveQuest, group: &str) -> Option<ActiveQuest> {
        if index >= self.quests.len() {
            return None;
        }
        let stamped = self.stamp(quest);
        let old = std::mem::replace(&mut self.quests[index], stamped);
        *self.rerolls.entry(group.to_string()).or_insert(0) += 1;
        self.recount_achieved();
        Some(old)
    }

    /// Persisted form of this set.
    #[must_use]
    pub fn to_record(&self) -> StoredProgressionRecord {
        StoredProgressionRecord {
            legacy_timestamp: None,
            timestamps_by_group: self
                .renewed_at
                .iter()
                .map(|(group, at)| (group.clone(), at.timestamp_millis()))
                .collect(),
            achieved_quests: self.achieved_quests,
            total_achieved_quests: self.totals.total_achieved_quests,
            legacy_rerolls: None,
            rerolls_by_group: self.rerolls.clone(),
            rows: self
                .quests
                .iter()
                .enumerate()
                .map(|(sequence, quest)| StoredQuestRow {
                    sequence: sequence as u32,
                    category: quest.key.category.clone(),
                    quest_index: quest.key.index,
                    advancement: quest.progression.advancement,
                    required_amount: quest.progression.required_amount,
                    reward_amount: quest.progression.reward_amount,
                    achieved: quest.progression.achieved,
                    selected_required: quest.progression.selected_required,
                })
                .collect(),
            category_stats: self.totals.achieved_by_category.clone(),
        }
    }

    fn recount_achieved(&mut self) {
        self.achieved_quests = self
            .quests
            .iter()
            .filter(|q| q.progression.achieved)
            .count() as u32;
    }

    fn stamp(&mut self, mut quest: ActiveQuest) -> ActiveQuest {
        self.next_serial += 1;
        quest.serial = self.next_serial;
        quest
    }

    fn stamp_all(&mut self, quests: Vec<ActiveQuest>) -> Vec<ActiveQuest> {
        quests.into_iter().map(|q| self.stamp(q)).collect()
    }
}
