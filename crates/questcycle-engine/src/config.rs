//! QuestCycle configuration.
//!
//! Everything lives in one `questcycle.toml`. Every section has defaults, so
//! an empty or missing file is a valid configuration. Unlike the catalog, a
//! config file that exists but does not parse is an error.

use questcycle_common::{ConfigError, ConfigResult};
use questcycle_gameplay::{CategoryAmount, QuestAmountSetting, QuestsPerCategory, RegistrySettings};
use questcycle_schedule::{GroupConfig, GroupRegistry, ScheduleConfig, TimestampMode};
use questcycle_store::StorageConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Configuration file name.
pub const CONFIG_FILE: &str = "questcycle.toml";

/// Default quest catalog file name.
pub const CATALOG_FILE: &str = "quests.toml";

/// A `quests_per_category` value: a positive integer or a dynamic expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AmountValue {
    /// Plain number
    Number(i64),
    /// Number written as text, or an expression
    Text(String),
}

impl AmountValue {
    fn as_text(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

/// One `[[quests_per_category]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryAmountConfig {
    /// Category name
    pub category: String,
    /// Quests drawn per renewal
    pub amount: AmountValue,
}

impl CategoryAmountConfig {
    fn new(category: &str, amount: i64) -> Self {
        Self {
            category: category.to_string(),
            amount: AmountValue::Number(amount),
        }
    }
}

/// QuestCycle configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuestCycleConfig {
    // === Renewal ===
    /// How renewal timestamps are judged
    pub timestamp_mode: TimestampMode,
    /// Rerolls per group and cycle (0 = unlimited)
    pub reroll_maximum: u32,

    // === Players ===
    /// Wait between a player connecting and their quests loading
    pub player_data_load_delay_ms: u64,

    // === Content ===
    /// Quest catalog file, relative to the config file
    pub catalog_file: PathBuf,

    // === Tables ===
    /// Schedule of the legacy group when no groups are configured
    pub schedule: ScheduleConfig,
    /// Categories and how many quests each draws
    pub quests_per_category: Vec<CategoryAmountConfig>,
    /// Explicit category groups; empty means one legacy group
    pub category_groups: Vec<GroupConfig>,
    /// Persistence backend
    pub storage: StorageConfig,
}

impl Default for QuestCycleConfig {
    fn default() -> Self {
        Self {
            timestamp_mode: TimestampMode::Anchored,
            reroll_maximum: 0,

            player_data_load_delay_ms: 0,

            catalog_file: PathBuf::from(CATALOG_FILE),

            schedule: ScheduleConfig::default(),
            quests_per_category: vec![
                CategoryAmountConfig::new("easy", 3),
                CategoryAmountConfig::new("medium", 2),
                CategoryAmountConfig::new("hard", 1),
            ],
            category_groups: Vec::new(),
            storage: StorageConfig::default(),
        }
    }
}

impl QuestCycleConfig {
    /// Load configuration from a specific path.
    ///
    /// Returns the default config if the file doesn't exist. Relative
    /// catalog and storage paths are resolved against the file's directory.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            file: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut config = Self::from_toml(&contents).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                file: path.display().to_string(),
                reason,
            },
            other => other,
        })?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parses configuration text.
    pub fn from_toml(text: &str) -> ConfigResult<Self> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            file: CONFIG_FILE.to_string(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to a specific path.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, contents)?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Makes relative file paths relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.catalog_file.is_relative() {
            self.catalog_file = base.join(&self.catalog_file);
        }
        if self.storage.path.is_relative() {
            self.storage.path = base.join(&self.storage.path);
        }
    }

    /// Parsed `quests_per_category` table.
    pub fn quest_amounts(&self) -> ConfigResult<QuestsPerCategory> {
        let entries = self
            .quests_per_category
            .iter()
            .map(|entry| {
                Ok(CategoryAmount {
                    category: entry.category.clone(),
                    amount: QuestAmountSetting::parse(&entry.category, &entry.amount.as_text())?,
                })
            })
            .collect::<ConfigResult<Vec<_>>>()?;
        QuestsPerCategory::new(entries)
    }

    /// Configured category names, in configuration order.
    #[must_use]
    pub fn category_names(&self) -> Vec<String> {
        self.quests_per_category
            .iter()
            .map(|entry| entry.category.clone())
            .collect()
    }

    /// Builds the category groups.
    pub fn group_registry(&self) -> ConfigResult<GroupRegistry> {
        GroupRegistry::load(&self.category_groups, &self.category_names(), &self.schedule)
    }

    /// Registry tuning derived from this config.
    #[must_use]
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            mode: self.timestamp_mode,
            load_delay: Duration::from_millis(self.player_data_load_delay_ms),
            reroll_maximum: self.reroll_maximum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use questcycle_store::StorageMode;
    use tempfile::TempDir;

    const GROUPED: &str = r#"
timestamp_mode = "anchored"
reroll_maximum = 2
player_data_load_delay_ms = 500

[[quests_per_category]]
category = "easy"
amount = 3

[[quests_per_category]]
category = "hard"
amount = "%player_level%"

[[category_groups]]
name = "daily"
categories = ["easy"]
renew_time = "06:00"
renew_interval = "1d"
renew_time_zone = "Europe/Paris"

[[category_groups]]
name = "weekly"
categories = ["hard"]
renew_interval = "7d"

[storage]
mode = "file"
path = "players"
"#;

    #[test]
    fn test_default_config() {
        let config = QuestCycleConfig::default();
        assert_eq!(config.timestamp_mode, TimestampMode::Anchored);
        assert_eq!(config.category_names(), vec!["easy", "medium", "hard"]);
        assert!(config.category_groups.is_empty());

        let groups = config.group_registry().expect("default groups");
        assert!(groups.is_legacy());
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_grouped_config() {
        let config = QuestCycleConfig::from_toml(GROUPED).expect("valid config");
        assert_eq!(config.reroll_maximum, 2);
        assert_eq!(config.storage.mode, StorageMode::File);

        let settings = config.registry_settings();
        assert_eq!(settings.load_delay, Duration::from_millis(500));
        assert_eq!(settings.reroll_maximum, 2);

        let amounts = config.quest_amounts().expect("valid amounts");
        assert_eq!(amounts.amount_for("easy"), Some(&QuestAmountSetting::Static(3)));
        assert!(amounts.amount_for("hard").is_some_and(QuestAmountSetting::is_dynamic));

        let groups = config.group_registry().expect("valid groups");
        assert_eq!(groups.group_names(), vec!["daily", "weekly"]);
        assert_eq!(
            groups.group_for_category("HARD").map(|g| g.name().to_string()),
            Some("weekly".to_string())
        );
    }

    #[test]
    fn test_invalid_amount_rejected() {
        let config = QuestCycleConfig::from_toml(
            r#"
[[quests_per_category]]
category = "easy"
amount = 0
"#,
        )
        .expect("parses");
        assert!(matches!(
            config.quest_amounts(),
            Err(ConfigError::InvalidQuestAmount { .. })
        ));
    }

    #[test]
    fn test_unassigned_category_rejected() {
        let mut config = QuestCycleConfig::from_toml(GROUPED).expect("valid config");
        config.quests_per_category.push(CategoryAmountConfig::new("medium", 1));
        assert!(matches!(
            config.group_registry(),
            Err(ConfigError::UnassignedCategory { .. })
        ));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let config = QuestCycleConfig::load_from(dir.path().join(CONFIG_FILE)).expect("defaults");
        assert_eq!(config, QuestCycleConfig::default());
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "reroll_maximum = \"lots\"").expect("write");

        let err = QuestCycleConfig::load_from(&path).expect_err("must fail");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_save_and_load_resolves_paths() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = QuestCycleConfig::from_toml(GROUPED).expect("valid config");
        config.save_to(&path).expect("save");

        let loaded = QuestCycleConfig::load_from(&path).expect("load");
        let base = dir.path().join("nested");
        assert_eq!(loaded.catalog_file, base.join(CATALOG_FILE));
        assert_eq!(loaded.storage.path, base.join("players"));
        assert_eq!(loaded.category_groups, config.category_groups);
    }
}
