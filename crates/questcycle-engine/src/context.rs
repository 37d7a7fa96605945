//! The running QuestCycle system.
//!
//! [`QuestCycle`] owns every component for as long as the host keeps quests
//! enabled. Nothing is global: enable builds a context, disable tears it
//! down, reload swaps its components out in place.

use crate::config::{QuestCycleConfig, CONFIG_FILE};
use questcycle_common::{PersistenceResult, PlayerId, QuestCycleResult};
use questcycle_gameplay::{
    ActiveQuestRegistry, AmountResolver, GroupScheduler, LogNotifier, LogRewards, NoExpressions,
    OnlinePlayers, PlayerDirectory, PlayerNotifier, QuestCatalog, QuestTypeRegistry,
    RandomSelector, RegistryServices, RewardDispatcher, StaticCatalog,
};
use questcycle_schedule::{Clock, GroupRegistry, SystemClock};
use questcycle_store::ProgressionStore;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tracing::{info, warn};

/// Host-provided collaborators.
#[derive(Debug, Clone)]
pub struct Hooks {
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Delivers notices to players
    pub notifier: Arc<dyn PlayerNotifier>,
    /// Pays out rewards
    pub rewards: Arc<dyn RewardDispatcher>,
    /// Evaluates dynamic quest amounts
    pub resolver: Arc<dyn AmountResolver>,
    /// Quest type tags understood by the catalog
    pub types: QuestTypeRegistry,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            notifier: Arc::new(LogNotifier),
            rewards: Arc::new(LogRewards),
            resolver: Arc::new(NoExpressions),
            types: QuestTypeRegistry::default(),
        }
    }
}

/// Everything rebuilt by a reload.
pub(crate) struct Components {
    pub(crate) store: Arc<ProgressionStore>,
    pub(crate) catalog: Arc<dyn QuestCatalog>,
    pub(crate) groups: Arc<GroupRegistry>,
    pub(crate) registry: ActiveQuestRegistry,
    pub(crate) scheduler: GroupScheduler,
    // Dropped last; the scheduler and registry spawn onto it.
    pub(crate) runtime: Runtime,
}

impl Drop for Components {
    // Stops renewals, saves every player and stops the store.
    fn drop(&mut self) {
        self.scheduler.stop();
        self.registry.shutdown();
        self.store.shutdown();
    }
}

/// Builds the runtime renewal tasks and connect delays run on: one worker
/// per group.
pub(crate) fn build_runtime(groups: &GroupRegistry) -> std::io::Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(groups.len().max(1))
        .thread_name("questcycle-scheduler")
        .enable_all()
        .build()
}

/// Parsed content a registry is built from.
pub(crate) struct Content {
    pub(crate) catalog: Arc<dyn QuestCatalog>,
    pub(crate) selector: RandomSelector,
    pub(crate) groups: Arc<GroupRegistry>,
}

/// Wires the registry and scheduler around already-loaded parts.
pub(crate) fn assemble(
    runtime: Runtime,
    store: Arc<ProgressionStore>,
    content: Content,
    config: &QuestCycleConfig,
    hooks: &Hooks,
    online: &Arc<OnlinePlayers>,
) -> Components {
    let Content {
        catalog,
        selector,
        groups,
    } = content;
    let services = RegistryServices {
        store: Arc::clone(&store),
        catalog: Arc::clone(&catalog),
        selector: Arc::new(selector),
        groups: Arc::clone(&groups),
        clock: Arc::clone(&hooks.clock),
        notifier: Arc::clone(&hooks.notifier),
        rewards: Arc::clone(&hooks.rewards),
    };
    let registry = ActiveQuestRegistry::new(
        services,
        config.registry_settings(),
        runtime.handle().clone(),
    );
    let directory: Arc<dyn PlayerDirectory> = Arc::clone(online) as Arc<dyn PlayerDirectory>;
    let scheduler = GroupScheduler::new(
        runtime.handle().clone(),
        Arc::clone(&hooks.clock),
        directory,
        Arc::new(registry.clone()),
    );

    Components {
        store,
        catalog,
        groups,
        registry,
        scheduler,
        runtime,
    }
}

/// A running QuestCycle system.
pub struct QuestCycle {
    pub(crate) config_path: PathBuf,
    pub(crate) config: QuestCycleConfig,
    pub(crate) hooks: Hooks,
    pub(crate) online: Arc<OnlinePlayers>,
    pub(crate) parts: Components,
}

impl fmt::Debug for QuestCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuestCycle")
            .field("config_path", &self.config_path)
            .field("groups", &self.parts.groups.group_names())
            .field("online", &self.online.len())
            .finish_non_exhaustive()
    }
}

impl QuestCycle {
    /// Loads `config_path` and everything it references, then starts the
    /// renewal scheduler.
    pub fn enable(config_path: impl AsRef<Path>, hooks: Hooks) -> QuestCycleResult<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = QuestCycleConfig::load_from(&config_path)?;
        Self::enable_with(config_path, config, hooks)
    }

    /// Starts with an already-loaded configuration. `config_path` is only
    /// used by later reloads.
    pub fn enable_with(
        config_path: PathBuf,
        config: QuestCycleConfig,
        hooks: Hooks,
    ) -> QuestCycleResult<Self> {
        let amounts = config.quest_amounts()?;
        let groups = Arc::new(config.group_registry()?);
        let store = Arc::new(ProgressionStore::open(&config.storage)?);
        let catalog: Arc<dyn QuestCatalog> =
            Arc::new(StaticCatalog::load(&config.catalog_file, &hooks.types)?);
        let selector =
            RandomSelector::new(Arc::clone(&catalog), amounts, Arc::clone(&hooks.resolver))?;
        let runtime = build_runtime(&groups)?;

        let online = Arc::new(OnlinePlayers::new());
        let content = Content {
            catalog,
            selector,
            groups,
        };
        let parts = assemble(runtime, store, content, &config, &hooks, &online);
        let started = parts.scheduler.start(&parts.groups, config.timestamp_mode);
        info!(
            "QuestCycle enabled: {} groups, {} renewal tasks, {} storage",
            parts.groups.len(),
            started,
            parts.store.backend_name()
        );

        Ok(Self {
            config_path,
            config,
            hooks,
            online,
            parts,
        })
    }

    /// Enables from `questcycle.toml` in the working directory.
    pub fn enable_default(hooks: Hooks) -> QuestCycleResult<Self> {
        Self::enable(CONFIG_FILE, hooks)
    }

    /// Stops renewals, saves every connected player and closes the store.
    pub fn disable(self) {
        let Self { parts, .. } = self;
        drop(parts);
        info!("QuestCycle disabled");
    }

    /// A player connected.
    pub fn player_join(&self, player: PlayerId) {
        self.online.join(player);
        self.parts.registry.on_connect(player);
    }

    /// A player disconnected; their quests are saved before this returns.
    pub fn player_quit(&self, player: PlayerId) -> PersistenceResult<()> {
        self.online.leave(player);
        let saved = self.parts.registry.on_disconnect(player);
        if let Err(e) = &saved {
            warn!(player = %player, "Failed to save quests on disconnect: {}", e);
        }
        saved
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &QuestCycleConfig {
        &self.config
    }

    /// File the configuration is reloaded from.
    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Connected players' quests.
    #[must_use]
    pub fn registry(&self) -> &ActiveQuestRegistry {
        &self.parts.registry
    }

    /// Renewal scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &GroupScheduler {
        &self.parts.scheduler
    }

    /// Category groups.
    #[must_use]
    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.parts.groups
    }

    /// Quest catalog.
    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn QuestCatalog> {
        &self.parts.catalog
    }

    /// Persistence front end.
    #[must_use]
    pub fn store(&self) -> &Arc<ProgressionStore> {
        &self.parts.store
    }

    /// Connected players.
    #[must_use]
    pub fn online_players(&self) -> Vec<PlayerId> {
        self.online.online_players()
    }
}
