//! Quest selection: how many quests each category draws and which ones.

use crate::catalog::QuestCatalog;
use crate::progression::ActiveQuest;
use fastrand::Rng;
use parking_lot::Mutex;
use questcycle_common::{ConfigError, ConfigResult, PlayerId, QuestKey};
use questcycle_schedule::CategoryGroup;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Number of quests a category draws per renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestAmountSetting {
    /// A fixed positive amount.
    Static(u32),
    /// An expression resolved per player by an [`AmountResolver`].
    Dynamic(String),
}

impl QuestAmountSetting {
    /// Parses a configured value. Integers must be positive; anything else
    /// is kept as a dynamic expression.
    pub fn parse(category: &str, raw: &str) -> ConfigResult<Self> {
        let trimmed = raw.trim();
        let invalid = |reason: &str| ConfigError::InvalidQuestAmount {
            category: category.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("value is empty"));
        }

        let digits = trimmed.strip_prefix('-').unwrap_or(trimmed);
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            return match trimmed.parse::<i64>() {
                Ok(amount) if amount > 0 => u32::try_from(amount)
                    .map(Self::Static)
                    .map_err(|_| invalid("value is too large")),
                Ok(_) => Err(invalid("value must be > 0")),
                Err(_) => Err(invalid("value is too large")),
            };
        }

        Ok(Self::Dynamic(trimmed.to_string()))
    }

    /// Whether the amount depends on the player.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic(_))
    }

    /// The amount for `player`. Dynamic values that cannot be resolved
    /// count as zero.
    pub fn resolve(&self, category: &str, player: PlayerId, resolver: &dyn AmountResolver) -> u32 {
        let expression = match self {
            Self::Static(amount) => return *amount,
            Self::Dynamic(expression) => expression,
        };

        let Some(value) = resolver.resolve(player, expression) else {
            warn!(
                "Cannot resolve quests amount for category '{}' ('{}'). Defaulting to 0 quest.",
                category, expression
            );
            return 0;
        };

        match value.trim().parse::<f64>() {
            Ok(amount) if amount.is_finite() => amount.floor().max(0.0) as u32,
            _ => {
                warn!(
                    "Unable to parse quests amount for category '{}' (value='{}').",
                    category, value
                );
                0
            },
        }
    }
}

/// Resolves dynamic quest-amount expressions for a player.
pub trait AmountResolver: Send + Sync + fmt::Debug {
    /// The expression's value as text, or `None` when it cannot be resolved.
    fn resolve(&self, player: PlayerId, expression: &str) -> Option<String>;
}

/// Resolver for hosts without expression support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExpressions;

impl AmountResolver for NoExpressions {
    fn resolve(&self, _player: PlayerId, _expression: &str) -> Option<String> {
        None
    }
}

/// Quest amount of one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryAmount {
    /// Category name
    pub category: String,
    /// Quests drawn per renewal
    pub amount: QuestAmountSetting,
}

/// Every configured category with its quest amount, in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuestsPerCategory {
    entries: Vec<CategoryAmount>,
}

impl QuestsPerCategory {
    /// Creates the table. Category names must be unique, ignoring case.
    pub fn new(entries: Vec<CategoryAmount>) -> ConfigResult<Self> {
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i]
                .iter()
                .any(|e| e.category.eq_ignore_ascii_case(&entry.category))
            {
                return Err(ConfigError::InvalidQuestAmount {
                    category: entry.category.clone(),
                    reason: "category is listed twice".to_string(),
                });
            }
        }
        Ok(Self { entries })
    }

    /// Category names.
    #[must_use]
    pub fn categories(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.category.clone()).collect()
    }

    /// Amount setting of `category`.
    #[must_use]
    pub fn amount_for(&self, category: &str) -> Option<&QuestAmountSetting> {
        self.entries
            .iter()
            .find(|e| e.category.eq_ignore_ascii_case(category))
            .map(|e| &e.amount)
    }

    /// Entries in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &CategoryAmount> {
        self.entries.iter()
    }

    /// Sum of the static amounts.
    #[must_use]
    pub fn total_static(&self) -> u32 {
        self.entries
            .iter()
            .filter_map(|e| match e.amount {
                QuestAmountSetting::Static(amount) => Some(amount),
                QuestAmountSetting::Dynamic(_) => None,
            })
            .sum()
    }
}

/// Draws quests for players.
pub trait QuestSelector: Send + Sync + fmt::Debug {
    /// A full draw across every category.
    fn select_random_quests(&self, player: PlayerId) -> Vec<ActiveQuest>;

    /// A draw covering only `group`'s categories.
    fn select_random_quests_for_group(
        &self,
        player: PlayerId,
        group: &CategoryGroup,
    ) -> Vec<ActiveQuest>;

    /// One quest of `category` not in `exclude`, for a reroll.
    fn select_replacement(
        &self,
        player: PlayerId,
        category: &str,
        exclude: &[QuestKey],
    ) -> Option<ActiveQuest>;
}

/// Uniform random selection without repeats within a category.
pub struct RandomSelector {
    catalog: Arc<dyn QuestCatalog>,
    amounts: QuestsPerCategory,
    resolver: Arc<dyn AmountResolver>,
    rng: Mutex<Rng>,
}

impl fmt::Debug for RandomSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomSelector")
            .field("amounts", &self.amounts)
            .finish_non_exhaustive()
    }
}

impl RandomSelector {
    /// Creates a selector, rejecting categories with fewer quests than they
    /// statically draw.
    pub fn new(
        catalog: Arc<dyn QuestCatalog>,
        amounts: QuestsPerCategory,
        resolver: Arc<dyn AmountResolver>,
    ) -> ConfigResult<Self> {
        for entry in amounts.iter() {
            if let QuestAmountSetting::Static(required) = entry.amount {
                let available = catalog.quests_in(&entry.category).len();
                if available < required as usize {
                    return Err(ConfigError::InsufficientQuests {
                        category: entry.category.clone(),
                        available,
                        required,
                    });
                }
            }
        }

        Ok(Self {
            catalog,
            amounts,
            resolver,
            rng: Mutex::new(Rng::new()),
        })
    }

    /// Seeds the random generator.
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = Rng::with_seed(seed);
        self
    }

    fn draw_category(&self, player: PlayerId, category: &str, rng: &mut Rng) -> Vec<ActiveQuest> {
        let Some(setting) = self.amounts.amount_for(category) else {
            return Vec::new();
        };
        let amount = setting.resolve(category, player, self.resolver.as_ref()) as usize;

        let mut pool = self.catalog.quests_in(category);
        if amount > pool.len() {
            warn!(
                "Category '{}' has {} quests but {} were requested for player {}",
                category,
                pool.len(),
                amount,
                player
            );
        }

        rng.shuffle(&mut pool);
        pool.into_iter()
            .take(amount)
            .map(|def| ActiveQuest::new(def.key().clone(), def.draw_progression(rng)))
            .collect()
    }
}

impl QuestSelector for RandomSelector {
    fn select_random_quests(&self, player: PlayerId) -> Vec<ActiveQuest> {
        let mut rng = self.rng.lock();
        let quests: Vec<ActiveQuest> = self
            .amounts
            .iter()
            .flat_map(|entry| self.draw_category(player, &entry.category, &mut rng))
            .collect();
        debug!(player = %player, count = quests.len(), "Drew quests");
        quests
    }

    fn select_random_quests_for_group(
        &self,
        player: PlayerId,
        group: &CategoryGroup,
    ) -> Vec<ActiveQuest> {
        let mut rng = self.rng.lock();
        let quests: Vec<ActiveQuest> = group
            .categories()
            .iter()
            .flat_map(|category| self.draw_category(player, category, &mut rng))
            .collect();
        debug!(player = %player, group = %group.name(), count = quests.len(), "Drew group quests");
        quests
    }

    fn select_replacement(
        &self,
        player: PlayerId,
        category: &str,
        exclude: &[QuestKey],
    ) -> Option<ActiveQuest> {
        let candidates: Vec<_> = self
            .catalog
            .quests_in(category)
            .into_iter()
            .filter(|def| !exclude.contains(def.key()))
            .collect();
        if candidates.is_empty() {
            debug!(player = %player, category = %category, "No replacement quest available");
            return None;
        }

        let mut rng = self.rng.lock();
        let def = &candidates[rng.usize(..candidates.len())];
        Some(ActiveQuest::new(def.key().clone(), def.draw_progression(&mut rng)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{QuestDef, QuestKind, RequiredAmount, RewardSpec, StaticCatalog};
    use questcycle_schedule::ScheduleSettings;
    use std::collections::HashSet;

    fn catalog() -> Arc<dyn QuestCatalog> {
        let mut defs = Vec::new();
        for (category, count) in [("easy", 5), ("medium", 3), ("hard", 2)] {
            for index in 0..count {
                defs.push(QuestDef::new(
                    QuestKey::new(category, index),
                    format!("{category} {index}"),
                    QuestKind::Global {
                        action: "EXP_POINTS".to_string(),
                    },
                    RequiredAmount::Fixed(10),
                    RewardSpec::Fixed(1.0),
                ));
            }
        }
        Arc::new(StaticCatalog::from_defs(defs))
    }

    fn amounts(easy: &str, medium: &str, hard: &str) -> QuestsPerCategory {
        QuestsPerCategory::new(
            [("easy", easy), ("medium", medium), ("hard", hard)]
                .into_iter()
                .map(|(category, raw)| CategoryAmount {
                    category: category.to_string(),
                    amount: QuestAmountSetting::parse(category, raw).expect("valid amount"),
                })
                .collect(),
        )
        .expect("unique categories")
    }

    #[derive(Debug)]
    struct FixedResolver(&'static str);

    impl AmountResolver for FixedResolver {
        fn resolve(&self, _player: PlayerId, _expression: &str) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[test]
    fn test_amount_setting_parse() {
        assert_eq!(QuestAmountSetting::parse("easy", " 3 "), Ok(QuestAmountSetting::Static(3)));
        assert!(QuestAmountSetting::parse("easy", "0").is_err());
        assert!(QuestAmountSetting::parse("easy", "-2").is_err());
        assert!(QuestAmountSetting::parse("easy", "").is_err());
        assert_eq!(
            QuestAmountSetting::parse("easy", "%player_level%"),
            Ok(QuestAmountSetting::Dynamic("%player_level%".to_string()))
        );
    }

    #[test]
    fn test_dynamic_amount_resolution() {
        let setting = QuestAmountSetting::Dynamic("%rank_bonus%".to_string());
        let player = PlayerId::random();
        assert_eq!(setting.resolve("easy", player, &FixedResolver("2.9")), 2);
        assert_eq!(setting.resolve("easy", player, &FixedResolver("-4")), 0);
        assert_eq!(setting.resolve("easy", player, &FixedResolver("many")), 0);
        assert_eq!(setting.resolve("easy", player, &NoExpressions), 0);
    }

    #[test]
    fn test_insufficient_quests_rejected() {
        let err = RandomSelector::new(catalog(), amounts("1", "1", "3"), Arc::new(NoExpressions))
            .expect_err("hard has only two quests");
        assert_eq!(
            err,
            ConfigError::InsufficientQuests {
                category: "hard".to_string(),
                available: 2,
                required: 3,
            }
        );
    }

    #[test]
    fn test_full_draw_is_distinct_per_category() {
        let selector =
            RandomSelector::new(catalog(), amounts("3", "2", "1"), Arc::new(NoExpressions))
                .expect("valid")
                .with_seed(42);
        let quests = selector.select_random_quests(PlayerId::random());
        assert_eq!(quests.len(), 6);

        let keys: HashSet<_> = quests.iter().map(|q| q.key().clone()).collect();
        assert_eq!(keys.len(), 6);
        let categories: Vec<_> = quests.iter().map(|q| q.key().category.as_str()).collect();
        assert_eq!(categories, vec!["easy", "easy", "easy", "medium", "medium", "hard"]);
    }

    #[test]
    fn test_group_draw_covers_only_group() {
        let selector =
            RandomSelector::new(catalog(), amounts("2", "1", "1"), Arc::new(NoExpressions))
                .expect("valid");
        let group = CategoryGroup::new(
            "weekly",
            vec!["hard".to_string()],
            ScheduleSettings::new(
                chrono::NaiveTime::MIN,
                chrono::TimeDelta::days(7),
                questcycle_schedule::RenewZone::UTC,
            ),
        );
        let quests = selector.select_random_quests_for_group(PlayerId::random(), &group);
        assert_eq!(quests.len(), 1);
        assert_eq!(quests[0].key().category, "hard");
    }

    #[test]
    fn test_replacement_excludes_held_quests() {
        let selector =
            RandomSelector::new(catalog(), amounts("1", "1", "1"), Arc::new(NoExpressions))
                .expect("valid");
        let player = PlayerId::random();
        let held = vec![QuestKey::new("hard", 0)];
        for _ in 0..20 {
            let replacement = selector
                .select_replacement(player, "hard", &held)
                .expect("one candidate left");
            assert_eq!(replacement.key(), &QuestKey::new("hard", 1));
        }

        let all = vec![QuestKey::new("hard", 0), QuestKey::new("hard", 1)];
        assert!(selector.select_replacement(player, "hard", &all).is_none());
    }
}
