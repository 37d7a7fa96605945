//! Quest catalog: quest definitions, quest types and the static TOML catalog.

use crate::progression::Progression;
use fastrand::Rng;
use questcycle_common::{ConfigError, ConfigResult, QuestKey};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Amount a player must reach to complete a quest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAmount {
    /// Always the same amount.
    Fixed(u32),
    /// Drawn uniformly from `min..=max` when the quest is drawn.
    Random {
        /// Lower bound
        min: u32,
        /// Upper bound
        max: u32,
    },
}

impl RequiredAmount {
    /// Parses `"10"` or `"5-15"`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let amount = |s: &str| {
            s.trim()
                .parse::<u32>()
                .map_err(|_| format!("'{raw}' is not a valid required amount"))
        };

        let parsed = match raw.split_once('-') {
            Some((min, max)) => {
                let (min, max) = (amount(min)?, amount(max)?);
                if min > max {
                    return Err(format!("range '{raw}' has min greater than max"));
                }
                Self::Random { min, max }
            },
            None => Self::Fixed(amount(raw)?),
        };

        match parsed {
            Self::Fixed(0) | Self::Random { min: 0, .. } => {
                Err("required amount must be at least 1".to_string())
            },
            parsed => Ok(parsed),
        }
    }

    /// Whether the amount is drawn per player.
    #[must_use]
    pub const fn is_random(&self) -> bool {
        matches!(self, Self::Random { .. })
    }

    /// Draws an amount.
    pub fn draw(&self, rng: &mut Rng) -> u32 {
        match *self {
            Self::Fixed(amount) => amount,
            Self::Random { min, max } => rng.u32(min..=max),
        }
    }
}

/// How a quest's reward amount is determined.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RewardSpec {
    /// No reward.
    #[default]
    None,
    /// A fixed amount.
    Fixed(f64),
    /// Drawn uniformly from `[min, max]`, rounded to two decimals.
    Range {
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },
}

impl RewardSpec {
    /// Resolves a concrete amount, or `None` when the quest has no reward.
    pub fn resolve(&self, rng: &mut Rng) -> Option<f64> {
        match *self {
            Self::None => None,
            Self::Fixed(amount) => Some(amount),
            Self::Range { min, max } => {
                let amount = min + rng.f64() * (max - min);
                Some((amount * 100.0).round() / 100.0)
            },
        }
    }
}

/// What a quest's targets are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetFamily {
    /// Materials and items.
    Item,
    /// Mobs and animals.
    Entity,
}

/// The objective of a quest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestKind {
    /// An action against one of a list of targets.
    Targeted {
        /// Action tag, upper case
        action: String,
        /// What the targets are
        family: TargetFamily,
        /// Accepted targets, upper case; empty accepts any
        targets: Vec<String>,
        /// One target is drawn per player instead of accepting all of them
        random_target: bool,
    },
    /// An action with no target.
    Global {
        /// Action tag, upper case
        action: String,
    },
}

impl QuestKind {
    /// Action tag.
    #[must_use]
    pub fn action(&self) -> &str {
        match self {
            Self::Targeted { action, .. } | Self::Global { action } => action,
        }
    }

    /// Number of sub-objectives a player is drawn from, for random-target
    /// quests.
    #[must_use]
    pub fn option_count(&self) -> Option<u32> {
        match self {
            Self::Targeted {
                targets,
                random_target: true,
                ..
            } => Some(targets.len() as u32),
            _ => None,
        }
    }

    /// Whether an action reported by gameplay counts towards this quest.
    #[must_use]
    pub fn matches(&self, action: &str, target: Option<&str>, selected: Option<u32>) -> bool {
        if !self.action().eq_ignore_ascii_case(action) {
            return false;
        }

        match self {
            Self::Global { .. } => true,
            Self::Targeted {
                targets,
                random_target,
                ..
            } => {
                if targets.is_empty() {
                    return true;
                }
                let Some(target) = target else {
                    return false;
                };
                if *random_target {
                    selected
                        .and_then(|i| targets.get(i as usize))
                        .is_some_and(|t| t.eq_ignore_ascii_case(target))
                } else {
                    targets.iter().any(|t| t.eq_ignore_ascii_case(target))
                }
            },
        }
    }
}

/// A quest entry as written in a catalog file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawQuest {
    /// Category the quest belongs to
    pub category: String,
    /// Display name
    pub name: String,
    /// Type tag, e.g. `BREAK` or `KILL`
    #[serde(rename = "type")]
    pub quest_type: String,
    /// Accepted targets
    #[serde(default)]
    pub targets: Vec<String>,
    /// Draw one target per player
    #[serde(default)]
    pub random_target: bool,
    /// `10`, `"10"` or `"5-15"`
    #[serde(default = "RawAmount::one")]
    pub required_amount: RawAmount,
    /// Fixed amount or `{ min, max }`
    #[serde(default)]
    pub reward: Option<RawReward>,
}

/// Required amount as written.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawAmount {
    /// Plain integer
    Number(u32),
    /// Integer or range as a string
    Text(String),
}

impl RawAmount {
    fn one() -> Self {
        Self::Number(1)
    }

    fn as_text(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.trim().to_string(),
        }
    }
}

/// Reward as written.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum RawReward {
    /// Fixed amount
    Fixed(f64),
    /// Random range
    Range {
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },
}

/// Builds a quest kind from a raw entry.
pub type QuestFactory = fn(&RawQuest) -> Result<QuestKind, String>;

/// Quest types known to the catalog loader, by tag.
#[derive(Clone)]
pub struct QuestTypeRegistry {
    factories: HashMap<String, QuestFactory>,
}

impl fmt::Debug for QuestTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags = self.tags();
        tags.sort_unstable();
        f.debug_struct("QuestTypeRegistry").field("tags", &tags).finish()
    }
}

const ITEM_TYPES: &[&str] = &[
    "BREAK", "PLACE", "CRAFT", "PICKUP", "FISH", "CONSUME", "COOK", "ENCHANT", "FARMING",
];
const ENTITY_TYPES: &[&str] = &["KILL", "BREED", "TAME", "SHEAR", "MILKING"];
const GLOBAL_TYPES: &[&str] = &["EXP_POINTS", "EXP_LEVELS", "PLAYER_DEATH", "VILLAGER_TRADE"];

impl Default for QuestTypeRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for tag in ITEM_TYPES {
            registry.register(tag, item_quest);
        }
        for tag in ENTITY_TYPES {
            registry.register(tag, entity_quest);
        }
        for tag in GLOBAL_TYPES {
            registry.register(tag, global_quest);
        }
        registry
    }
}

impl QuestTypeRegistry {
    /// A registry with no types.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers (or replaces) the factory for `tag`.
    pub fn register(&mut self, tag: &str, factory: QuestFactory) {
        self.factories.insert(tag.to_ascii_uppercase(), factory);
    }

    /// Registered tags.
    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Builds the kind of `raw`, or `None` when its tag is unknown.
    pub fn create(&self, raw: &RawQuest) -> Option<Result<QuestKind, String>> {
        self.factories
            .get(&raw.quest_type.to_ascii_uppercase())
            .map(|factory| factory(raw))
    }
}

fn targeted(raw: &RawQuest, family: TargetFamily) -> Result<QuestKind, String> {
    if raw.random_target && raw.targets.is_empty() {
        return Err("random_target needs at least one target".to_string());
    }
    Ok(QuestKind::Targeted {
        action: raw.quest_type.to_ascii_uppercase(),
        family,
        targets: raw.targets.iter().map(|t| t.to_ascii_uppercase()).collect(),
        random_target: raw.random_target,
    })
}

fn item_quest(raw: &RawQuest) -> Result<QuestKind, String> {
    targeted(raw, TargetFamily::Item)
}

fn entity_quest(raw: &RawQuest) -> Result<QuestKind, String> {
    targeted(raw, TargetFamily::Entity)
}

fn global_quest(raw: &RawQuest) -> Result<QuestKind, String> {
    if !raw.targets.is_empty() {
        return Err(format!("{} quests take no targets", raw.quest_type));
    }
    Ok(QuestKind::Global {
        action: raw.quest_type.to_ascii_uppercase(),
    })
}

/// A quest definition.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestDef {
    key: QuestKey,
    name: String,
    kind: QuestKind,
    required_raw: String,
    required: RequiredAmount,
    reward: RewardSpec,
}

impl QuestDef {
    /// Creates a definition.
    #[must_use]
    pub fn new(
        key: QuestKey,
        name: impl Into<String>,
        kind: QuestKind,
        required: RequiredAmount,
        reward: RewardSpec,
    ) -> Self {
        let required_raw = match required {
            RequiredAmount::Fixed(amount) => amount.to_string(),
            RequiredAmount::Random { min, max } => format!("{min}-{max}"),
        };
        Self {
            key,
            name: name.into(),
            kind,
            required_raw,
            required,
            reward,
        }
    }

    /// Catalog key.
    #[must_use]
    pub fn key(&self) -> &QuestKey {
        &self.key
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Objective.
    #[must_use]
    pub fn kind(&self) -> &QuestKind {
        &self.kind
    }

    /// Required amount as configured.
    #[must_use]
    pub fn required_amount_raw(&self) -> &str {
        &self.required_raw
    }

    /// Whether the required amount is drawn per player.
    #[must_use]
    pub fn is_random_required_amount(&self) -> bool {
        self.required.is_random()
    }

    /// The required amount when it is fixed.
    #[must_use]
    pub fn fixed_required_amount(&self) -> Option<u32> {
        match self.required {
            RequiredAmount::Fixed(amount) => Some(amount),
            RequiredAmount::Random { .. } => None,
        }
    }

    /// Reward descriptor.
    #[must_use]
    pub fn reward(&self) -> RewardSpec {
        self.reward
    }

    /// See [`QuestKind::option_count`].
    #[must_use]
    pub fn option_count(&self) -> Option<u32> {
        self.kind.option_count()
    }

    /// Resolves a reward amount.
    pub fn resolve_reward_amount(&self, rng: &mut Rng) -> Option<f64> {
        self.reward.resolve(rng)
    }

    /// Draws a fresh progression for one player.
    pub fn draw_progression(&self, rng: &mut Rng) -> Progression {
        let required = self.required.draw(rng);
        let selected = self
            .option_count()
            .filter(|&count| count > 0)
            .map(|count| rng.u32(0..count));
        Progression::new(required, self.resolve_reward_amount(rng), selected)
    }
}

/// Read access to the live quest catalog.
pub trait QuestCatalog: Send + Sync + fmt::Debug {
    /// Looks up a quest.
    fn resolve(&self, key: &QuestKey) -> Option<Arc<QuestDef>>;

    /// Categories in catalog order.
    fn categories(&self) -> Vec<String>;

    /// Quests of one category, in index order.
    fn quests_in(&self, category: &str) -> Vec<Arc<QuestDef>>;
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    quests: Vec<RawQuest>,
}

/// A catalog loaded once from a TOML file.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    categories: Vec<String>,
    quests: HashMap<String, Vec<Arc<QuestDef>>>,
}

impl StaticCatalog {
    /// Loads a catalog file.
    pub fn load(path: impl AsRef<Path>, types: &QuestTypeRegistry) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            file: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let catalog = Self::from_toml(&text, types)?;
        info!(
            "Loaded {} quests in {} categories from {:?}",
            catalog.len(),
            catalog.categories.len(),
            path
        );
        Ok(catalog)
    }

    /// Parses a catalog. Quest indices follow file order within each
    /// category.
    pub fn from_toml(text: &str, types: &QuestTypeRegistry) -> ConfigResult<Self> {
        let file: CatalogFile = toml::from_str(text).map_err(|e| ConfigError::Parse {
            file: "quest catalog".to_string(),
            reason: e.to_string(),
        })?;

        let mut catalog = Self::default();
        for raw in &file.quests {
            let category = catalog.canonical_category(&raw.category);
            let index = catalog.quests.get(&category.to_lowercase()).map_or(0, Vec::len) as u32;
            let invalid = |reason: String| ConfigError::InvalidQuest {
                category: category.clone(),
                index,
                reason,
            };

            let kind = types
                .create(raw)
                .ok_or_else(|| ConfigError::UnknownQuestType {
                    category: category.clone(),
                    index,
                    tag: raw.quest_type.clone(),
                })?
                .map_err(invalid)?;
            let required_raw = raw.required_amount.as_text();
            let required = RequiredAmount::parse(&required_raw).map_err(invalid)?;
            let reward = match raw.reward {
                None => RewardSpec::None,
                Some(RawReward::Fixed(amount)) => RewardSpec::Fixed(amount),
                Some(RawReward::Range { min, max }) if min <= max => RewardSpec::Range { min, max },
                Some(RawReward::Range { .. }) => {
                    return Err(invalid("reward range has min greater than max".to_string()));
                },
            };

            let def = QuestDef {
                key: QuestKey::new(category.clone(), index),
                name: raw.name.clone(),
                kind,
                required_raw,
                required,
                reward,
            };
            debug!("Loaded quest {}", def.key);
            catalog.insert(def);
        }
        Ok(catalog)
    }

    /// Builds a catalog from definitions; each key's index must match its
    /// position within the category.
    #[must_use]
    pub fn from_defs(defs: Vec<QuestDef>) -> Self {
        let mut catalog = Self::default();
        for def in defs {
            catalog.canonical_category(&def.key.category);
            catalog.insert(def);
        }
        catalog
    }

    /// Number of quests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.quests.values().map(Vec::len).sum()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.quests.is_empty()
    }

    fn canonical_category(&mut self, category: &str) -> String {
        if let Some(existing) = self
            .categories
            .iter()
            .find(|c| c.eq_ignore_ascii_case(category))
        {
            return existing.clone();
        }
        self.categories.push(category.to_string());
        category.to_string()
    }

    fn insert(&mut self, def: QuestDef) {
        self.quests
            .entry(def.key.category.to_lowercase())
            .or_default()
            .push(Arc::new(def));
    }
}

impl QuestCatalog for StaticCatalog {
    fn resolve(&self, key: &QuestKey) -> Option<Arc<QuestDef>> {
        self.quests
            .get(&key.category.to_lowercase())
            .and_then(|quests| quests.get(key.index as usize))
            .cloned()
    }

    fn categories(&self) -> Vec<String> {
        self.categories.clone()
    }

    fn quests_in(&self, category: &str) -> Vec<Arc<QuestDef>> {
        self.quests
            .get(&category.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
        [[quests]]
        category = "easy"
        name = "Stone breaker"
        type = "break"
        targets = ["stone", "cobblestone"]
        required_amount = 32
        reward = 50

        [[quests]]
        category = "easy"
        name = "Hunter"
        type = "KILL"
        targets = ["ZOMBIE", "SKELETON", "SPIDER"]
        random_target = true
        required_amount = "5-15"
        reward = { min = 10.0, max = 20.0 }

        [[quests]]
        category = "Hard"
        name = "Level up"
        type = "EXP_LEVELS"
        required_amount = "10"
    "#;

    fn catalog() -> StaticCatalog {
        StaticCatalog::from_toml(CATALOG, &QuestTypeRegistry::default()).expect("valid catalog")
    }

    #[test]
    fn test_required_amount_parse() {
        assert_eq!(RequiredAmount::parse("10"), Ok(RequiredAmount::Fixed(10)));
        assert_eq!(
            RequiredAmount::parse(" 5-15 "),
            Ok(RequiredAmount::Random { min: 5, max: 15 })
        );
        assert!(RequiredAmount::parse("15-5").is_err());
        assert!(RequiredAmount::parse("0").is_err());
        assert!(RequiredAmount::parse("lots").is_err());
    }

    #[test]
    fn test_catalog_indices_follow_file_order() {
        let catalog = catalog();
        assert_eq!(catalog.categories(), vec!["easy".to_string(), "Hard".to_string()]);
        assert_eq!(catalog.len(), 3);

        let hunter = catalog.resolve(&QuestKey::new("easy", 1)).expect("present");
        assert_eq!(hunter.name(), "Hunter");
        assert!(hunter.is_random_required_amount());
        assert_eq!(hunter.option_count(), Some(3));

        let level = catalog.resolve(&QuestKey::new("hard", 0)).expect("case-insensitive");
        assert_eq!(level.fixed_required_amount(), Some(10));
        assert_eq!(level.reward(), RewardSpec::None);

        assert!(catalog.resolve(&QuestKey::new("easy", 2)).is_none());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let text = r#"
            [[quests]]
            category = "easy"
            name = "Dance"
            type = "DANCE"
        "#;
        let err =
            StaticCatalog::from_toml(text, &QuestTypeRegistry::default()).expect_err("unknown tag");
        assert_eq!(
            err,
            ConfigError::UnknownQuestType {
                category: "easy".to_string(),
                index: 0,
                tag: "DANCE".to_string(),
            }
        );
    }

    #[test]
    fn test_custom_type_registration() {
        fn dance(raw: &RawQuest) -> Result<QuestKind, String> {
            Ok(QuestKind::Global {
                action: raw.quest_type.to_ascii_uppercase(),
            })
        }

        let mut types = QuestTypeRegistry::empty();
        types.register("dance", dance);
        let text = r#"
            [[quests]]
            category = "fun"
            name = "Dance"
            type = "DANCE"
        "#;
        let catalog = StaticCatalog::from_toml(text, &types).expect("registered type");
        assert_eq!(catalog.quests_in("fun")[0].kind().action(), "DANCE");
    }

    #[test]
    fn test_draw_progression_respects_bounds() {
        let catalog = catalog();
        let hunter = catalog.resolve(&QuestKey::new("easy", 1)).expect("present");
        let mut rng = Rng::with_seed(7);
        for _ in 0..50 {
            let progression = hunter.draw_progression(&mut rng);
            assert!((5..=15).contains(&progression.required_amount()));
            assert!(progression.selected_required().is_some_and(|i| i < 3));
            let reward = progression.reward_amount().expect("has reward");
            assert!((10.0..=20.0).contains(&reward));
        }
    }

    #[test]
    fn test_matches() {
        let catalog = catalog();
        let breaker = catalog.resolve(&QuestKey::new("easy", 0)).expect("present");
        assert!(breaker.kind().matches("break", Some("Stone"), None));
        assert!(!breaker.kind().matches("break", Some("dirt"), None));
        assert!(!breaker.kind().matches("place", Some("stone"), None));

        let hunter = catalog.resolve(&QuestKey::new("easy", 1)).expect("present");
        assert!(hunter.kind().matches("KILL", Some("spider"), Some(2)));
        assert!(!hunter.kind().matches("KILL", Some("zombie"), Some(2)));
        assert!(!hunter.kind().matches("KILL", Some("zombie"), None));
    }
}
