//! Decides whether a stored snapshot can be trusted.
//!
//! A snapshot is adopted whole or not at all: the first failed check
//! discards it and the player gets a fresh draw, keeping only the lifetime
//! counters. Groups that fell due while the player was away are not checked;
//! their quests are handed back for renewal. Only when every group is due is
//! the whole snapshot dropped for staleness.

use crate::catalog::QuestCatalog;
use crate::progression::{ActiveQuest, LifetimeTotals, PlayerQuestSet, Progression};
use chrono::{DateTime, TimeZone, Utc};
use questcycle_common::{PlayerId, QuestKey};
use questcycle_schedule::{CategoryGroup, GroupRegistry, TimestampMode};
use questcycle_store::{StoredProgressionRecord, StoredQuestRow};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a snapshot was discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MismatchCause {
    /// Every group's quests are due for renewal.
    StaleTimestamp {
        /// Group name
        group: String,
    },
    /// The snapshot holds no quests.
    NoQuestRows,
    /// A stored quest is no longer in the catalog.
    MissingQuest {
        /// Stored key
        key: QuestKey,
    },
    /// A stored required amount is zero.
    ZeroRequiredAmount {
        /// Stored key
        key: QuestKey,
    },
    /// A fixed required amount no longer matches the catalog.
    RequiredAmountChanged {
        /// Stored key
        key: QuestKey,
        /// Amount in the snapshot
        stored: u32,
        /// Amount in the catalog
        expected: u32,
    },
    /// A random-objective quest has no usable sub-objective.
    InvalidRandomIndex {
        /// Stored key
        key: QuestKey,
        /// Stored index, if any
        selected: Option<u32>,
        /// Sub-objectives available
        options: u32,
    },
}

impl fmt::Display for MismatchCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleTimestamp { group } => {
                write!(f, "quests of group '{group}' and every other group are due for renewal")
            },
            Self::NoQuestRows => write!(f, "no stored quests"),
            Self::MissingQuest { key } => write!(f, "quest {key} does not exist"),
            Self::ZeroRequiredAmount { key } => write!(f, "required amount of {key} is 0"),
            Self::RequiredAmountChanged { key, stored, expected } => {
                write!(f, "required amount of {key} is {stored}, catalog says {expected}")
            },
            Self::InvalidRandomIndex { key, selected, options } => match selected {
                Some(index) => write!(f, "selected objective {index} of {key} is out of {options}"),
                None => write!(f, "no selected objective for {key}"),
            },
        }
    }
}

impl MismatchCause {
    fn log(&self, player: PlayerId) {
        match self {
            Self::StaleTimestamp { group } => {
                debug!(
                    player = %player,
                    group = %group,
                    "Quests are due for renewal. New quests will be drawn."
                );
            },
            Self::NoQuestRows => {
                debug!(player = %player, "No stored quests. New quests will be drawn.");
            },
            Self::MissingQuest { key } => {
                warn!(
                    player = %player,
                    quest = %key,
                    "Quest does not exist anymore. New quests will be drawn."
                );
            },
            Self::ZeroRequiredAmount { key } => {
                warn!(
                    player = %player,
                    quest = %key,
                    "Required amount is 0. The stored data is corrupted or predates the \
                     current layout. New quests will be drawn."
                );
            },
            Self::RequiredAmountChanged { key, stored, expected } => {
                warn!(
                    player = %player,
                    quest = %key,
                    "Required amount is not equal to the configured one ({} stored, {} \
                     configured). New quests will be drawn.",
                    stored,
                    expected
                );
            },
            Self::InvalidRandomIndex { key, selected, options } => {
                warn!(
                    player = %player,
                    quest = %key,
                    "Selected objective {:?} is invalid for {} options. New quests will be drawn.",
                    selected,
                    options
                );
            },
        }
    }
}

/// Outcome of reconciling a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// The snapshot is valid. Quests of the `due` groups are carried as
    /// stored and must be renewed before the set is used.
    Adopt {
        /// Restored quests and counters
        set: PlayerQuestSet,
        /// Groups whose renewal fell due since the snapshot was taken
        due: Vec<String>,
    },
    /// The snapshot must be replaced by a fresh draw.
    Regenerate {
        /// First failed check
        cause: MismatchCause,
        /// Counters to carry into the fresh set
        totals: LifetimeTotals,
    },
}

/// Checks stored snapshots against the live catalog and schedules.
#[derive(Debug, Clone)]
pub struct Reconciler {
    catalog: Arc<dyn QuestCatalog>,
    groups: Arc<GroupRegistry>,
    mode: TimestampMode,
}

impl Reconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn QuestCatalog>,
        groups: Arc<GroupRegistry>,
        mode: TimestampMode,
    ) -> Self {
        Self { catalog, groups, mode }
    }

    /// Reconciles `record` at `now`.
    #[must_use]
    pub fn reconcile(
        &self,
        player: PlayerId,
        record: &StoredProgressionRecord,
        now: DateTime<Utc>,
    ) -> Reconciliation {
        let totals = LifetimeTotals {
            total_achieved_quests: record.total_achieved_quests,
            achieved_by_category: record.category_stats.clone(),
        };

        let due = self.due_groups(record, now);
        for group in &due {
            debug!(
                player = %player,
                group = %group.name(),
                "Stored quests of group are due for renewal"
            );
        }

        match self.check(record, &due) {
            Ok(quests) => Reconciliation::Adopt {
                set: self.restore(record, quests, totals),
                due: due.iter().map(|group| group.name().to_string()).collect(),
            },
            Err(cause) => {
                cause.log(player);
                Reconciliation::Regenerate { cause, totals }
            },
        }
    }

    /// Groups with a usable schedule whose stored draw is due at `now`.
    fn due_groups(
        &self,
        record: &StoredProgressionRecord,
        now: DateTime<Utc>,
    ) -> Vec<&CategoryGroup> {
        self.groups
            .groups()
            .filter(|group| {
                group.settings().is_ok_and(|settings| {
                    let last = record
                        .effective_timestamp(group.name())
                        .and_then(from_millis);
                    settings.is_due(self.mode, last, now)
                })
            })
            .map(|group| &**group)
            .collect()
    }

    fn check(
        &self,
        record: &StoredProgressionRecord,
        due: &[&CategoryGroup],
    ) -> Result<Vec<ActiveQuest>, MismatchCause> {
        let scheduled = self
            .groups
            .groups()
            .filter(|group| group.settings().is_ok())
            .count();
        if let Some(first) = due.first() {
            if due.len() == scheduled {
                return Err(MismatchCause::StaleTimestamp {
                    group: first.name().to_string(),
                });
            }
        }

        if record.rows.is_empty() {
            return Err(MismatchCause::NoQuestRows);
        }

        record
            .rows
            .iter()
            .map(|row| {
                if due.iter().any(|group| group.contains_category(&row.category)) {
                    Ok(carried(row))
                } else {
                    self.check_row(row)
                }
            })
            .collect()
    }

    fn check_row(&self, row: &StoredQuestRow) -> Result<ActiveQuest, MismatchCause> {
        let key = QuestKey::new(row.category.clone(), row.quest_index);

        let Some(def) = self.catalog.resolve(&key) else {
            return Err(MismatchCause::MissingQuest { key });
        };

        if row.required_amount == 0 {
            return Err(MismatchCause::ZeroRequiredAmount { key });
        }

        if let Some(expected) = def.fixed_required_amount() {
            if expected != row.required_amount {
                return Err(MismatchCause::RequiredAmountChanged {
                    key,
                    stored: row.required_amount,
                    expected,
                });
            }
        }

        if let Some(options) = def.option_count() {
            if !row.selected_required.is_some_and(|selected| selected < options) {
                return Err(MismatchCause::InvalidRandomIndex {
                    key,
                    selected: row.selected_required,
                    options,
                });
            }
        }

        let reward_amount = row
            .reward_amount
            .or_else(|| def.resolve_reward_amount(&mut fastrand::Rng::new()));

        Ok(ActiveQuest::new(
            def.key().clone(),
            Progression::restored(
                row.required_amount,
                reward_amount,
                row.advancement,
                row.achieved,
                row.selected_required,
            ),
        ))
    }

    fn restore(
        &self,
        record: &StoredProgressionRecord,
        quests: Vec<ActiveQuest>,
        totals: LifetimeTotals,
    ) -> PlayerQuestSet {
        let mut renewed_at = BTreeMap::new();
        let mut rerolls = BTreeMap::new();
        for group in self.groups.groups() {
            if let Some(at) = record.effective_timestamp(group.name()).and_then(from_millis) {
                renewed_at.insert(group.name().to_string(), at);
            }
            rerolls.insert(group.name().to_string(), record.effective_rerolls(group.name()));
        }
        PlayerQuestSet::restored(quests, record.achieved_quests, totals, renewed_at, rerolls)
    }
}

/// A row of a due group, kept only to hold its place until renewal.
fn carried(row: &StoredQuestRow) -> ActiveQuest {
    ActiveQuest::new(
        QuestKey::new(row.category.clone(), row.quest_index),
        Progression::restored(
            row.required_amount,
            row.reward_amount,
            row.advancement,
            row.achieved,
            row.selected_required,
        ),
    )
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        QuestDef, QuestKind, RequiredAmount, RewardSpec, StaticCatalog, TargetFamily,
    };
    use chrono::TimeDelta;
    use questcycle_schedule::{GroupConfig, ScheduleConfig};

    fn catalog() -> Arc<dyn QuestCatalog> {
        let global = |category: &str, index: u32, required: RequiredAmount| {
            QuestDef::new(
                QuestKey::new(category, index),
                "quest",
                QuestKind::Global {
                    action: "EXP_POINTS".to_string(),
                },
                required,
                RewardSpec::Fixed(25.0),
            )
        };
        Arc::new(StaticCatalog::from_defs(vec![
            global("easy", 0, RequiredAmount::Fixed(10)),
            global("easy", 1, RequiredAmount::Random { min: 5, max: 15 }),
            global("easy", 2, RequiredAmount::Fixed(3)),
            QuestDef::new(
                QuestKey::new("easy", 3),
                "hunter",
                QuestKind::Targeted {
                    action: "KILL".to_string(),
                    family: TargetFamily::Entity,
                    targets: vec!["ZOMBIE".to_string(), "SPIDER".to_string()],
                    random_target: true,
                },
                RequiredAmount::Fixed(4),
                RewardSpec::None,
            ),
            global("hard", 0, RequiredAmount::Fixed(50)),
            global("hard", 1, RequiredAmount::Fixed(60)),
        ]))
    }

    fn groups() -> Arc<GroupRegistry> {
        Arc::new(
            GroupRegistry::load(
                &[
                    GroupConfig::new("daily", &["easy"]),
                    GroupConfig::new("weekly", &["hard"]).with_interval("7d"),
                ],
                &["easy".to_string(), "hard".to_string()],
                &ScheduleConfig::default(),
            )
            .expect("valid groups"),
        )
    }

    fn now() -> DateTime<Utc> {
        "2026-05-13T12:00:00Z".parse().expect("valid timestamp")
    }

    fn row(sequence: u32, category: &str, index: u32, required: u32) -> StoredQuestRow {
        StoredQuestRow {
            sequence,
            category: category.to_string(),
            quest_index: index,
            advancement: 1,
            required_amount: required,
            reward_amount: Some(25.0),
            achieved: false,
            selected_required: None,
        }
    }

    fn fresh_record() -> StoredProgressionRecord {
        let renewed = (now() - TimeDelta::hours(2)).timestamp_millis();
        let mut hunter = row(3, "easy", 3, 4);
        hunter.selected_required = Some(1);
        StoredProgressionRecord {
            timestamps_by_group: BTreeMap::from([
                ("daily".to_string(), renewed),
                ("weekly".to_string(), renewed),
            ]),
            achieved_quests: 0,
            total_achieved_quests: 17,
            rows: vec![
                row(0, "easy", 0, 10),
                row(1, "easy", 1, 7),
                row(2, "easy", 2, 3),
                hunter,
                row(4, "hard", 0, 50),
            ],
            category_stats: BTreeMap::from([("easy".to_string(), 12)]),
            ..StoredProgressionRecord::default()
        }
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(catalog(), groups(), TimestampMode::Anchored)
    }

    fn cause_of(outcome: Reconciliation) -> MismatchCause {
        match outcome {
            Reconciliation::Regenerate { cause, .. } => cause,
            Reconciliation::Adopt { .. } => panic!("expected regeneration"),
        }
    }

    #[test]
    fn test_valid_snapshot_is_adopted() {
        let outcome = reconciler().reconcile(PlayerId::random(), &fresh_record(), now());
        let Reconciliation::Adopt { set, due } = outcome else {
            panic!("expected adoption");
        };
        assert!(due.is_empty());
        assert_eq!(set.quests().len(), 5);
        assert_eq!(set.quest(1).expect("row").progression().required_amount(), 7);
        assert_eq!(set.quest(3).expect("row").progression().selected_required(), Some(1));
        assert_eq!(set.totals().total_achieved_quests, 17);
        assert_eq!(set.renewed_at("weekly"), Some(now() - TimeDelta::hours(2)));
    }

    #[test]
    fn test_zero_required_amount_is_distinct_from_missing_quest() {
        let mut record = fresh_record();
        record.rows[2].required_amount = 0;
        let zero = cause_of(reconciler().reconcile(PlayerId::random(), &record, now()));
        assert_eq!(
            zero,
            MismatchCause::ZeroRequiredAmount {
                key: QuestKey::new("easy", 2)
            }
        );

        let mut record = fresh_record();
        record.rows[2].quest_index = 99;
        let missing = cause_of(reconciler().reconcile(PlayerId::random(), &record, now()));
        assert!(matches!(missing, MismatchCause::MissingQuest { .. }));
        assert_ne!(zero.to_string(), missing.to_string());
    }

    #[test]
    fn test_one_bad_row_discards_everything() {
        let mut record = fresh_record();
        record.rows.push(row(5, "hard", 7, 60));

        match reconciler().reconcile(PlayerId::random(), &record, now()) {
            Reconciliation::Regenerate { cause, totals } => {
                assert_eq!(
                    cause,
                    MismatchCause::MissingQuest {
                        key: QuestKey::new("hard", 7)
                    }
                );
                assert_eq!(totals.total_achieved_quests, 17);
                assert_eq!(totals.achieved_by_category["easy"], 12);
            },
            Reconciliation::Adopt { .. } => panic!("partial snapshot adopted"),
        }
    }

    #[test]
    fn test_fixed_amount_change_regenerates() {
        let mut record = fresh_record();
        record.rows[0].required_amount = 12;
        assert_eq!(
            cause_of(reconciler().reconcile(PlayerId::random(), &record, now())),
            MismatchCause::RequiredAmountChanged {
                key: QuestKey::new("easy", 0),
                stored: 12,
                expected: 10,
            }
        );
    }

    #[test]
    fn test_random_index_checks() {
        for selected in [None, Some(2)] {
            let mut record = fresh_record();
            record.rows[3].selected_required = selected;
            assert!(matches!(
                cause_of(reconciler().reconcile(PlayerId::random(), &record, now())),
                MismatchCause::InvalidRandomIndex { options: 2, .. }
            ));
        }
    }

    #[test]
    fn test_due_group_is_handed_back_unchecked() {
        let yesterday = (now() - TimeDelta::days(1)).timestamp_millis();
        let mut record = fresh_record();
        record.timestamps_by_group.insert("daily".to_string(), yesterday);
        // Would fail the catalog check if the daily rows were checked.
        record.rows[0].quest_index = 99;

        let outcome = reconciler().reconcile(PlayerId::random(), &record, now());
        let Reconciliation::Adopt { set, due } = outcome else {
            panic!("expected adoption");
        };
        assert_eq!(due, vec!["daily".to_string()]);
        assert_eq!(set.quest(4).expect("row").key(), &QuestKey::new("hard", 0));
        assert_eq!(set.quest(4).expect("row").progression().advancement(), 1);
        assert_eq!(set.renewed_at("weekly"), Some(now() - TimeDelta::hours(2)));
    }

    #[test]
    fn test_every_group_due_regenerates() {
        let last_week = (now() - TimeDelta::days(8)).timestamp_millis();
        let mut record = fresh_record();
        record.timestamps_by_group.insert("daily".to_string(), last_week);
        record.timestamps_by_group.insert("weekly".to_string(), last_week);
        assert_eq!(
            cause_of(reconciler().reconcile(PlayerId::random(), &record, now())),
            MismatchCause::StaleTimestamp {
                group: "daily".to_string()
            }
        );
    }

    #[test]
    fn test_legacy_timestamp_applies_to_all_groups() {
        let mut record = fresh_record();
        record.timestamps_by_group.clear();
        record.legacy_timestamp = Some((now() - TimeDelta::hours(1)).timestamp_millis());
        record.legacy_rerolls = Some(2);

        let outcome = reconciler().reconcile(PlayerId::random(), &record, now());
        let Reconciliation::Adopt { set, .. } = outcome else {
            panic!("expected adoption");
        };
        assert_eq!(set.rerolls("daily"), 2);
        assert_eq!(set.rerolls("weekly"), 2);
    }

    #[test]
    fn test_missing_timestamp_and_empty_rows() {
        let mut record = fresh_record();
        record.timestamps_by_group.remove("weekly");
        assert!(matches!(
            reconciler().reconcile(PlayerId::random(), &record, now()),
            Reconciliation::Adopt { due, .. } if due == vec!["weekly".to_string()]
        ));

        let mut record = fresh_record();
        record.rows.clear();
        assert_eq!(
            cause_of(reconciler().reconcile(PlayerId::random(), &record, now())),
            MismatchCause::NoQuestRows
        );
    }

    #[test]
    fn test_missing_reward_is_resolved() {
        let mut record = fresh_record();
        record.rows[0].reward_amount = None;
        let outcome = reconciler().reconcile(PlayerId::random(), &record, now());
        let Reconciliation::Adopt { set, .. } = outcome else {
            panic!("expected adoption");
        };
        assert_eq!(set.quest(0).expect("row").progression().reward_amount(), Some(25.0));
    }

    #[test]
    fn test_stored_advancement_is_kept() {
        let mut record = fresh_record();
        record.rows[0].advancement = 12;
        let outcome = reconciler().reconcile(PlayerId::random(), &record, now());
        let Reconciliation::Adopt { set, .. } = outcome else {
            panic!("expected adoption");
        };
        assert_eq!(set.quest(0).expect("row").progression().advancement(), 12);
    }
}
