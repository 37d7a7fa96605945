//! Live reload.
//!
//! A reload re-reads the configuration and the catalog, opens a new store,
//! saves and drops everyone's quests, then loads them again through the new
//! components. Observers see the phases in a fixed order. Anything that fails
//! before players are saved aborts the reload and leaves the running system
//! untouched.

use crate::config::QuestCycleConfig;
use crate::context::{assemble, build_runtime, Content, QuestCycle};
use questcycle_common::{ConfigError, QuestCycleResult};
use questcycle_gameplay::{PlayerDirectory, QuestCatalog, RandomSelector, StaticCatalog};
use questcycle_store::ProgressionStore;
use std::fmt;
use std::fs;
use std::sync::Arc;
use tracing::{error, info};

/// Steps of a reload, in the order they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReloadPhase {
    /// Config and catalog files were read
    FilesLoaded,
    /// Groups and quest amounts were validated
    ConfigsLoaded,
    /// The new store is open
    DatabaseLoaded,
    /// The catalog was parsed and the selector built
    ContentLoaded,
    /// Every connected player was saved and dropped
    PlayersSaved,
    /// Every connected player started loading again
    PlayersLoaded,
    /// Renewal tasks are running again
    ReloadComplete,
}

impl ReloadPhase {
    /// All phases in order.
    pub const ALL: [ReloadPhase; 7] = [
        Self::FilesLoaded,
        Self::ConfigsLoaded,
        Self::DatabaseLoaded,
        Self::ContentLoaded,
        Self::PlayersSaved,
        Self::PlayersLoaded,
        Self::ReloadComplete,
    ];
}

impl fmt::Display for ReloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FilesLoaded => "files loaded",
            Self::ConfigsLoaded => "configs loaded",
            Self::DatabaseLoaded => "database loaded",
            Self::ContentLoaded => "content loaded",
            Self::PlayersSaved => "players saved",
            Self::PlayersLoaded => "players loaded",
            Self::ReloadComplete => "reload complete",
        };
        f.write_str(name)
    }
}

/// Told about each phase as a reload reaches it.
pub trait ReloadObserver {
    /// Called once per phase.
    fn phase_reached(&self, phase: ReloadPhase);
}

impl<F: Fn(ReloadPhase)> ReloadObserver for F {
    fn phase_reached(&self, phase: ReloadPhase) {
        self(phase);
    }
}

fn reached(observer: &dyn ReloadObserver, phase: ReloadPhase) {
    info!("Reload: {}", phase);
    observer.phase_reached(phase);
}

impl QuestCycle {
    /// Reloads everything from the config file.
    pub fn reload(&mut self) -> QuestCycleResult<()> {
        self.reload_observed(&|_: ReloadPhase| {})
    }

    /// Reloads everything, reporting each phase to `observer`.
    pub fn reload_observed(&mut self, observer: &dyn ReloadObserver) -> QuestCycleResult<()> {
        let result = self.run_reload(observer);
        if let Err(e) = &result {
            error!("Reload failed, keeping the running configuration: {}", e);
        }
        result
    }

    fn run_reload(&mut self, observer: &dyn ReloadObserver) -> QuestCycleResult<()> {
        let config = QuestCycleConfig::load_from(&self.config_path)?;
        let catalog_text = fs::read_to_string(&config.catalog_file).map_err(|e| ConfigError::Parse {
            file: config.catalog_file.display().to_string(),
            reason: e.to_string(),
        })?;
        reached(observer, ReloadPhase::FilesLoaded);

        let amounts = config.quest_amounts()?;
        let groups = Arc::new(config.group_registry()?);
        reached(observer, ReloadPhase::ConfigsLoaded);

        let store = Arc::new(ProgressionStore::open(&config.storage)?);
        let runtime = build_runtime(&groups)?;
        reached(observer, ReloadPhase::DatabaseLoaded);

        let catalog: Arc<dyn QuestCatalog> =
            Arc::new(StaticCatalog::from_toml(&catalog_text, &self.hooks.types)?);
        let selector = RandomSelector::new(
            Arc::clone(&catalog),
            amounts,
            Arc::clone(&self.hooks.resolver),
        )?;
        reached(observer, ReloadPhase::ContentLoaded);

        // Nothing below can fail.
        let content = Content {
            catalog,
            selector,
            groups,
        };
        let fresh = assemble(runtime, store, content, &config, &self.hooks, &self.online);
        drop(std::mem::replace(&mut self.parts, fresh));
        reached(observer, ReloadPhase::PlayersSaved);

        let players = self.online.online_players();
        for &player in &players {
            self.parts.registry.on_connect(player);
        }
        info!("Reloading quests of {} players", players.len());
        reached(observer, ReloadPhase::PlayersLoaded);

        let started = self
            .parts
            .scheduler
            .start(&self.parts.groups, config.timestamp_mode);
        self.config = config;
        info!("{} renewal tasks running", started);
        reached(observer, ReloadPhase::ReloadComplete);
        Ok(())
    }
}
