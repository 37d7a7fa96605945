//! Category groups.
//!
//! Every quest category belongs to exactly one group and every group renews
//! on its own schedule. Without explicit groups a single legacy group named
//! [`LEGACY_GROUP_NAME`] covers all categories with the global schedule.

use crate::calculator::ScheduleSettings;
use crate::duration::{format_interval, parse_interval};
use crate::time_of_day::parse_time_of_day;
use crate::zone::{RenewZone, SYSTEM_DEFAULT_ZONE};
use questcycle_common::{ConfigError, ConfigResult, SchedulingError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the group synthesized when no groups are configured.
pub const LEGACY_GROUP_NAME: &str = "default";

/// Default anchor time of day.
pub const DEFAULT_RENEW_TIME: &str = "00:00";

/// Default renewal interval.
pub const DEFAULT_RENEW_INTERVAL: &str = "1d";

/// Raw schedule strings as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Anchor time of day.
    pub renew_time: String,
    /// Compact interval string.
    pub renew_interval: String,
    /// IANA zone id or `SystemDefault`.
    pub renew_time_zone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            renew_time: DEFAULT_RENEW_TIME.to_string(),
            renew_interval: DEFAULT_RENEW_INTERVAL.to_string(),
            renew_time_zone: SYSTEM_DEFAULT_ZONE.to_string(),
        }
    }
}

impl ScheduleConfig {
    /// Parses the three strings into schedule settings.
    ///
    /// A zero interval parses fine; validity is checked when the schedule is
    /// used.
    pub fn resolve(&self) -> ConfigResult<ScheduleSettings> {
        Ok(ScheduleSettings::new(
            parse_time_of_day(&self.renew_time)?,
            parse_interval(&self.renew_interval)?,
            RenewZone::parse(&self.renew_time_zone)?,
        ))
    }
}

/// One `[[category_groups]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Group name.
    pub name: String,
    /// Categories renewed by this group.
    pub categories: Vec<String>,
    /// Anchor time of day.
    pub renew_time: String,
    /// Compact interval string.
    pub renew_interval: String,
    /// IANA zone id or `SystemDefault`.
    pub renew_time_zone: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        let schedule = ScheduleConfig::default();
        Self {
            name: String::new(),
            categories: Vec::new(),
            renew_time: schedule.renew_time,
            renew_interval: schedule.renew_interval,
            renew_time_zone: schedule.renew_time_zone,
        }
    }
}

impl GroupConfig {
    /// Creates a group config with default schedule strings.
    #[must_use]
    pub fn new(name: impl Into<String>, categories: &[&str]) -> Self {
        Self {
            name: name.into(),
            categories: categories.iter().map(|c| (*c).to_string()).collect(),
            ..Self::default()
        }
    }

    /// Sets the renewal interval string.
    #[must_use]
    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.renew_interval = interval.into();
        self
    }

    /// Sets the anchor time string.
    #[must_use]
    pub fn with_time(mut self, time: impl Into<String>) -> Self {
        self.renew_time = time.into();
        self
    }

    /// Sets the zone string.
    #[must_use]
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.renew_time_zone = zone.into();
        self
    }

    /// This group's schedule strings.
    #[must_use]
    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            renew_time: self.renew_time.clone(),
            renew_interval: self.renew_interval.clone(),
            renew_time_zone: self.renew_time_zone.clone(),
        }
    }
}

/// A named set of categories sharing one schedule.
#[derive(Debug, Clone)]
pub struct CategoryGroup {
    name: String,
    categories: Vec<String>,
    schedule: Result<ScheduleSettings, ConfigError>,
}

impl CategoryGroup {
    /// Creates a group directly from parsed settings.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        categories: Vec<String>,
        settings: ScheduleSettings,
    ) -> Self {
        Self {
            name: name.into(),
            categories,
            schedule: Ok(settings),
        }
    }

    /// Group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Categories in configuration order.
    #[must_use]
    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Whether `category` belongs to this group, ignoring case.
    #[must_use]
    pub fn contains_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c.eq_ignore_ascii_case(category))
    }

    /// Valid schedule settings, or why there are none.
    pub fn settings(&self) -> Result<ScheduleSettings, SchedulingError> {
        match &self.schedule {
            Ok(settings) => settings.validated(&self.name),
            Err(source) => Err(SchedulingError::InvalidSettings {
                group: self.name.clone(),
                source: source.clone(),
            }),
        }
    }
}

/// All category groups of the current configuration.
#[derive(Debug, Clone)]
pub struct GroupRegistry {
    groups: Vec<Arc<CategoryGroup>>,
    by_category: HashMap<String, usize>,
    legacy: bool,
}

impl GroupRegistry {
    /// Builds the registry.
    ///
    /// `categories` are the configured quest categories. `configured` are the
    /// explicit groups; when empty a legacy group with `global` settings is
    /// synthesized. Assignment problems are rejected before any group is
    /// created; a group whose schedule fails to parse is kept but reports a
    /// scheduling error from [`CategoryGroup::settings`].
    pub fn load(
        configured: &[GroupConfig],
        categories: &[String],
        global: &ScheduleConfig,
    ) -> ConfigResult<Self> {
        if categories.is_empty() {
            return Err(ConfigError::NoCategories);
        }

        let known: HashMap<String, &String> = categories
            .iter()
            .map(|c| (c.to_lowercase(), c))
            .collect();

        if configured.is_empty() {
            let group = CategoryGroup {
                name: LEGACY_GROUP_NAME.to_string(),
                categories: categories.to_vec(),
                schedule: resolve_logged(LEGACY_GROUP_NAME, global),
            };
            info!(
                "No category groups configured, using legacy group '{}' for {} categories",
                LEGACY_GROUP_NAME,
                categories.len()
            );
            return Ok(Self::from_groups(vec![group], true));
        }

        let mut owner: HashMap<String, &str> = HashMap::new();
        let mut names: HashSet<&str> = HashSet::new();
        let mut assignments: Vec<Vec<String>> = Vec::with_capacity(configured.len());

        for group in configured {
            if !names.insert(group.name.as_str()) {
                return Err(ConfigError::Parse {
                    file: "category_groups".to_string(),
                    reason: format!("group '{}' is defined twice", group.name),
                });
            }
            if group.categories.is_empty() {
                return Err(ConfigError::EmptyGroup {
                    group: group.name.clone(),
                });
            }

            let mut resolved = Vec::with_capacity(group.categories.len());
            for category in &group.categories {
                let key = category.to_lowercase();
                if let Some(existing) = owner.get(&key) {
                    return Err(ConfigError::DuplicateCategory {
                        category: category.clone(),
                        group: group.name.clone(),
                        existing: (*existing).to_string(),
                    });
                }
                let Some(canonical) = known.get(&key) else {
                    return Err(ConfigError::UnknownCategory {
                        category: category.clone(),
                        group: group.name.clone(),
                    });
                };
                owner.insert(key, group.name.as_str());
                resolved.push((*canonical).clone());
            }
            assignments.push(resolved);
        }

        if let Some(unassigned) = categories
            .iter()
            .find(|c| !owner.contains_key(&c.to_lowercase()))
        {
            return Err(ConfigError::UnassignedCategory {
                category: unassigned.clone(),
            });
        }

        let groups = configured
            .iter()
            .zip(assignments)
            .map(|(config, categories)| {
                let schedule = resolve_logged(&config.name, &config.schedule());
                if let Ok(settings) = &schedule {
                    info!(
                        "Loaded category group '{}' with categories {:?} \
                         (interval: {}, time: {}, zone: {})",
                        config.name,
                        categories,
                        format_interval(settings.interval),
                        settings.renew_time.format("%H:%M"),
                        settings.zone
                    );
                }
                CategoryGroup {
                    name: config.name.clone(),
                    categories,
                    schedule,
                }
            })
            .collect();

        Ok(Self::from_groups(groups, false))
    }

    /// Builds a registry from already constructed groups.
    ///
    /// Overlapping categories keep their first group.
    #[must_use]
    pub fn from_groups(groups: Vec<CategoryGroup>, legacy: bool) -> Self {
        let mut by_category = HashMap::new();
        for (index, group) in groups.iter().enumerate() {
            for category in &group.categories {
                by_category.entry(category.to_lowercase()).or_insert(index);
            }
        }
        Self {
            groups: groups.into_iter().map(Arc::new).collect(),
            by_category,
            legacy,
        }
    }

    /// Looks up a group by name.
    #[must_use]
    pub fn group(&self, name: &str) -> Option<&Arc<CategoryGroup>> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Group owning `category`, ignoring case.
    #[must_use]
    pub fn group_for_category(&self, category: &str) -> Option<&Arc<CategoryGroup>> {
        self.by_category
            .get(&category.to_lowercase())
            .and_then(|&index| self.groups.get(index))
    }

    /// Group names in configuration order.
    #[must_use]
    pub fn group_names(&self) -> Vec<&str> {
        self.groups.iter().map(|g| g.name.as_str()).collect()
    }

    /// All groups in configuration order.
    pub fn groups(&self) -> impl Iterator<Item = &Arc<CategoryGroup>> {
        self.groups.iter()
    }

    /// Number of groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether there are no groups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Whether the single group was synthesized from global settings.
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }
}

fn resolve_logged(group: &str, schedule: &ScheduleConfig) -> Result<ScheduleSettings, ConfigError> {
    let resolved = schedule.resolve();
    match &resolved {
        Ok(settings) if !settings.is_valid() => warn!(
            "Group '{}' has a non-positive interval '{}'; its renewal is disabled",
            group, schedule.renew_interval
        ),
        Err(e) => warn!(
            "Group '{}' has an invalid schedule ({}); its renewal is disabled",
            group, e
        ),
        Ok(_) => {},
    }
    resolved
}
